//! Error types for dazzle.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains. Registry idempotence is expressed through the `NotFound` and
//! `AlreadyExists` variants: both are recoverable in well-defined places
//! (falling through to a build, treating a duplicate push as success) and
//! fatal everywhere else.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for dazzle operations.
pub type Result<T> = std::result::Result<T, DazzleError>;

/// Main error type for dazzle.
#[derive(Error, Debug)]
pub enum DazzleError {
    // Registry errors
    #[error("not found: {reference}")]
    NotFound { reference: String },

    #[error("already exists: {reference}")]
    AlreadyExists { reference: String },

    #[error("unauthorized: {reference} - check your registry credentials (docker login)")]
    Unauthorized { reference: String },

    #[error("malformed manifest for {reference}: {source}")]
    MalformedManifest {
        reference: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed image config for {reference}: {source}")]
    MalformedConfig {
        reference: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("unsupported media type for {reference}: {media_type} (multi-arch indexes are not supported)")]
    UnsupportedMediaType { reference: String, media_type: String },

    #[error("registry error for {reference}: {reason}")]
    Registry { reference: String, reason: String },

    // Build-plan errors
    #[error("cannot compute hash for chunk {chunk}: {source}")]
    HashCompute {
        chunk: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    // Subtraction errors
    #[error("chunk was not built from base image: mismatch at layer {index}: base {base_digest} != chunk {chunk_digest}")]
    NotBuiltFromBase {
        index: usize,
        base_digest: String,
        chunk_digest: String,
    },

    // Solver errors
    #[error("solver at {addr} unavailable: {reason}")]
    SolverUnavailable { addr: String, reason: String },

    #[error("build failed: {reason}")]
    BuildFailed { reason: String },

    #[error("operation canceled")]
    Canceled,

    // Test errors
    #[error("chunk {chunk}: tests failed")]
    TestsFailed { chunk: String },

    // Combiner errors
    #[error("malformed env var entry: {entry}")]
    MalformedEnv { entry: String },

    #[error("unknown env var combination action: {action}")]
    UnknownEnvAction { action: String },

    #[error("unknown combination \"{reference}\" referenced in \"{name}\"")]
    MalformedCombinationRef { name: String, reference: String },

    #[error("chunk {name} not found in project")]
    UnknownChunk { name: String },

    // Project loading errors
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path:?}: {source}")]
    MalformedYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    // Generic errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl DazzleError {
    /// True for registry lookup misses that callers may recover from by
    /// building the missing artifact.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DazzleError::NotFound { .. })
    }

    /// True for duplicate pushes, which every writer treats as success.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, DazzleError::AlreadyExists { .. })
    }
}
