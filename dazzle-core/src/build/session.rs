//! Build session state.
//!
//! A session carries everything one orchestrator invocation shares across
//! chunks: the target reference, build options, the resolved base metadata
//! (set exactly once), the ledger of built chunk manifests and the
//! fingerprint cache. It is not safe for concurrent writes from more than
//! one orchestrator; dazzle runs chunks sequentially.

use crate::error::{DazzleError, Result};
use crate::project::fingerprint::FingerprintCache;
use crate::project::{Project, ProjectChunk};
use crate::reference::{DigestedRef, NamedRef};
use crate::registry::{pull_image, Registry};
use crate::solver::Solver;
use oci_client::manifest::OciImageManifest;
use oci_spec::image::ImageConfiguration;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Options modifying build behaviour.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Use a cache ref other than the target ref.
    pub cache_ref: Option<NamedRef>,
    /// Disable the solver's build cache.
    pub no_cache: bool,
    /// Skip build-time tests.
    pub no_tests: bool,
    /// Plain progress output (no colors).
    pub plain_output: bool,
    /// Tag chunked images without the fingerprint component.
    pub chunked_without_hash: bool,
}

/// Records all state of a build.
pub struct BuildSession {
    pub dest: NamedRef,
    pub(crate) opts: BuildOptions,
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) solver: Arc<dyn Solver>,
    cancel: CancellationToken,

    base_ref: Option<DigestedRef>,
    base_manifest: Option<OciImageManifest>,
    base_config: Option<ImageConfiguration>,
    chunks: BTreeMap<String, OciImageManifest>,
    fingerprints: FingerprintCache,
}

impl BuildSession {
    pub fn new(
        registry: Arc<dyn Registry>,
        solver: Arc<dyn Solver>,
        target: &str,
        opts: BuildOptions,
    ) -> Result<Self> {
        let dest = NamedRef::parse(target)?;
        Ok(Self {
            dest,
            opts,
            registry,
            solver,
            cancel: CancellationToken::new(),
            base_ref: None,
            base_manifest: None,
            base_config: None,
            chunks: BTreeMap::new(),
            fingerprints: FingerprintCache::default(),
        })
    }

    /// The cancellation signal plumbed through all solver and registry
    /// calls of this session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &BuildOptions {
        &self.opts
    }

    /// The digested base reference, once resolved.
    pub fn base_ref(&self) -> Option<&DigestedRef> {
        self.base_ref.as_ref()
    }

    /// Record the resolved base image. Calling this twice is an error: the
    /// base is immutable for the lifetime of a session.
    pub(crate) fn base_build_finished(
        &mut self,
        reference: DigestedRef,
        manifest: OciImageManifest,
        config: ImageConfiguration,
    ) -> Result<()> {
        if self.base_ref.is_some() {
            return Err(DazzleError::Internal(
                "base build finished twice in one session".to_string(),
            ));
        }
        debug!(base = %reference, "base image resolved");
        self.base_ref = Some(reference);
        self.base_manifest = Some(manifest);
        self.base_config = Some(config);
        Ok(())
    }

    /// Base metadata, failing when the base has not been resolved yet.
    pub(crate) fn base_metadata(
        &self,
    ) -> Result<(&DigestedRef, &OciImageManifest, &ImageConfiguration)> {
        match (&self.base_ref, &self.base_manifest, &self.base_config) {
            (Some(r), Some(m), Some(c)) => Ok((r, m, c)),
            _ => Err(DazzleError::Internal("base ref not set".to_string())),
        }
    }

    /// Append a built chunk manifest to the ledger.
    pub(crate) fn record_chunk(&mut self, reference: String, manifest: OciImageManifest) {
        self.chunks.insert(reference, manifest);
    }

    /// The ledger of chunked manifests built by this session, keyed by ref.
    pub fn chunks(&self) -> &BTreeMap<String, OciImageManifest> {
        &self.chunks
    }

    /// Log a summary of the built chunks and their sizes.
    pub fn print_build_info(&self) {
        for (reference, manifest) in &self.chunks {
            let size: i64 = manifest.layers.iter().map(|l| l.size).sum();
            info!(
                chunk = %reference,
                size_mb = (size as f64) / (1024.0 * 1024.0),
                "chunk built"
            );
        }
    }

    /// Chunk fingerprint relative to this session's base, memoized.
    pub(crate) fn fingerprint(
        &self,
        chunk: &ProjectChunk,
        include_tests: bool,
    ) -> Result<String> {
        let base = self
            .base_ref
            .as_ref()
            .ok_or_else(|| DazzleError::Internal("base ref not set".to_string()))?;
        self.fingerprints
            .get_or_compute(chunk, &base.to_string(), include_tests)
    }

    /// Resolve the base image metadata without building anything. Used by
    /// combine runs against an already-built project.
    pub async fn download_base_info(&mut self, project: &Project) -> Result<()> {
        let reference = match &project.base.prebuilt {
            Some(prebuilt) => prebuilt.to_oci(),
            None => project.base_tag(&self.dest)?.to_oci(),
        };
        debug!(reference = %reference, dest = %self.dest, "downloading base image info");

        let (manifest, digest, config) = pull_image(self.registry.as_ref(), &reference).await?;
        let digested = match &project.base.prebuilt {
            Some(prebuilt) => prebuilt.clone(),
            None => project.base_tag(&self.dest)?.with_digest(digest),
        };
        self.base_build_finished(digested, manifest, config)
    }
}
