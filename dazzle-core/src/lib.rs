//! Dazzle core library.
//!
//! Dazzle builds container images as independent *chunks* sharing one *base
//! image*: a change to one chunk never invalidates another's layers, and any
//! pick of chunks can later be combined into a runnable image by manifest
//! surgery alone - no build re-runs. The engine is content-addressed: every
//! artifact is tagged by a deterministic fingerprint of its inputs, and the
//! registry is the only source of truth between runs.

pub mod build;
pub mod error;
pub mod project;
pub mod reference;
pub mod registry;
pub mod solver;
pub mod test;

// Re-export commonly used items
pub use build::combine::CombineOptions;
pub use build::session::{BuildOptions, BuildSession};
pub use build::{chunk_image_name, ChunkImageType};
pub use error::{DazzleError, Result};
pub use project::{
    load_project_from_refs, resolve_combinations, ChunkCombination, EnvVarAction,
    EnvVarCombination, LoadFromRefsOpts, Project, ProjectChunk, ProjectConfig,
};
pub use reference::{AnyRef, DigestedRef, NamedRef, TaggedRef};
pub use registry::{OciRegistry, Registry, StoredTestResult};
pub use solver::{GrpcSolver, Solver};
pub use tokio_util::sync::CancellationToken;
