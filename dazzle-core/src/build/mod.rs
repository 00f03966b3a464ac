//! Build orchestration.
//!
//! Walks a project base-first: resolve or build the base image, then for
//! each chunk run the test phase (against the test image, short-circuited by
//! a cached test-result artifact), build the full image, subtract the base
//! layers and record the chunked manifest in the session ledger. Chunks are
//! processed sequentially; the only concurrency is the solve/progress task
//! pair around each solver call.

pub mod combine;
pub mod session;
pub mod subtract;

use crate::error::{DazzleError, Result};
use crate::project::{Project, ProjectChunk};
use crate::reference::{DigestedRef, NamedRef, TaggedRef};
use crate::registry::{
    credential_pair, pull_image, pull_test_result, push_test_result, PushOptions,
    StoredTestResult, ANNOTATION_ENV_PREFIX,
};
use crate::solver::progress::{self, ProgressRenderer};
use crate::solver::{
    CacheOptions, ImageExport, RegistryCredential, SolveRequest, SolveResponse, StatusUpdate,
};
use crate::test::container::ContainerExecutor;
use crate::test::run_suite;
use session::BuildSession;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

/// The chunk build artifact types, encoded in the image tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkImageType {
    /// Image built for running the chunk's tests.
    Test,
    /// The full chunk image, base layers still present.
    Full,
    /// The chunk image with the base layers removed.
    Chunked,
    /// Like `Chunked`, but tagged without the fingerprint.
    ChunkedNoHash,
    /// Stored test result artifact; not actually an image.
    TestResult,
}

impl ChunkImageType {
    fn includes_tests(&self) -> bool {
        matches!(self, ChunkImageType::Test | ChunkImageType::TestResult)
    }
}

impl fmt::Display for ChunkImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChunkImageType::Test => "test",
            ChunkImageType::Full => "full",
            ChunkImageType::Chunked => "chunked",
            ChunkImageType::ChunkedNoHash => "chunked-wohash",
            ChunkImageType::TestResult => "test-result",
        })
    }
}

/// Produce the image name of a chunk artifact:
/// `<target>:<safe-name>--<fingerprint>--<type>`, except for
/// `ChunkedNoHash`, which maps `name[:variant]` to `<target>/<name>:<variant|latest>`.
pub fn chunk_image_name(
    chunk: &ProjectChunk,
    tpe: ChunkImageType,
    session: &BuildSession,
) -> Result<TaggedRef> {
    if chunk.prebuilt.is_some() {
        return Err(DazzleError::Internal(format!(
            "chunk {} is pre-built and has no build context",
            chunk.name
        )));
    }

    if tpe == ChunkImageType::ChunkedNoHash {
        let (name, tag) = match chunk.name.split_once(':') {
            Some((name, variant)) => (name, variant),
            None => (chunk.name.as_str(), "latest"),
        };
        return session.dest.child(name)?.with_tag(tag);
    }

    let hash = session.fingerprint(chunk, tpe.includes_tests())?;
    session
        .dest
        .with_tag(&format!("{}--{}--{}", chunk.safe_name(), hash, tpe))
}

impl Project {
    /// The tag of this project's base image under `dest`:
    /// `<dest>:base--<fingerprint>`.
    pub fn base_tag(&self, dest: &NamedRef) -> Result<TaggedRef> {
        let hash = self.base.fingerprint("", false)?;
        dest.with_tag(&format!("base--{hash}"))
    }

    /// Build all images in the project.
    ///
    /// Relying on the solver's cache alone would not yield stable content
    /// hashes, so every artifact is addressed by a locally computed
    /// fingerprint tag and only built when that tag is missing.
    #[instrument(skip_all, fields(dest = %session.dest))]
    pub async fn build(&self, session: &mut BuildSession) -> Result<()> {
        let base_tag = self.base_tag(&session.dest)?;
        info!(reference = %base_tag, "building base image");
        let base_ref = resolve_or_build_base(self, &base_tag, session).await?;

        let (mut base_manifest, _, base_config) =
            pull_image(session.registry.as_ref(), &base_ref.to_oci()).await?;

        let mut base_ref = base_ref;
        if session.opts.chunked_without_hash && !self.config.env_vars.is_empty() {
            // Record the env var combination policies on the base manifest so
            // ad-hoc combinations can recover them from the registry alone.
            let annotations = base_manifest.annotations.get_or_insert_with(Default::default);
            for policy in &self.config.env_vars {
                annotations.insert(
                    format!("{ANNOTATION_ENV_PREFIX}{}", policy.name),
                    policy.action.to_string(),
                );
            }
            match session
                .registry
                .push(
                    &base_tag.to_oci(),
                    PushOptions {
                        config: None,
                        manifest: Some(base_manifest.clone()),
                    },
                )
                .await
            {
                Ok(digest) => base_ref = base_tag.with_digest(digest),
                Err(e) if e.is_already_exists() => {}
                Err(e) => {
                    return Err(DazzleError::Internal(format!(
                        "cannot modify base manifest: {e}"
                    )));
                }
            }
        }
        session.base_build_finished(base_ref, base_manifest, base_config)?;

        for chunk in &self.chunks {
            if session.cancellation_token().is_cancelled() {
                return Err(DazzleError::Canceled);
            }
            run_chunk_tests(chunk, session).await?;
            build_chunk(chunk, session).await?;
        }

        session.print_build_info();
        Ok(())
    }
}

/// Resolve the base tag, building the base image if it does not exist yet.
async fn resolve_or_build_base(
    project: &Project,
    base_tag: &TaggedRef,
    session: &BuildSession,
) -> Result<DigestedRef> {
    match session.registry.resolve(&base_tag.to_oci()).await {
        Ok(digest) => return Ok(base_tag.with_digest(digest)),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    let cache_name = base_tag.to_string();
    let request = SolveRequest {
        frontend: "dockerfile".to_string(),
        frontend_attrs: HashMap::new(),
        context_dir: project.base.context_path.clone(),
        cache_imports: vec![CacheOptions::registry(&cache_name)],
        cache_exports: vec![CacheOptions::inline()],
        credentials: session_credentials(session),
        export: Some(ImageExport {
            name: base_tag.to_string(),
            push: true,
        }),
        no_cache: session.opts.no_cache,
    };
    let response = invoke_solver(session, request).await?;
    Ok(base_tag.with_digest(response.image_digest()?))
}

/// Test phase of one chunk: consult the cached test-result artifact, build
/// the test image and run the specs when the cache has no passing entry.
async fn run_chunk_tests(chunk: &ProjectChunk, session: &BuildSession) -> Result<()> {
    if chunk.tests.is_empty() {
        return Ok(());
    }
    if session.opts.no_tests {
        warn!(chunk = %chunk.name, "skipping chunk tests (no-tests)");
        return Ok(());
    }

    let result_ref = chunk_image_name(chunk, ChunkImageType::TestResult, session)?;
    match pull_test_result(session.registry.as_ref(), &result_ref.to_oci()).await {
        Ok(result) if result.passed => {
            info!(chunk = %chunk.name, "tests have passed before, skipping");
            return Ok(());
        }
        Ok(_) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    let (test_ref, _) = build_image(chunk, ChunkImageType::Test, session).await?;

    info!(chunk = %chunk.name, "running tests");
    let executor = ContainerExecutor::new(
        session.solver.clone(),
        test_ref.to_string(),
        session.cancellation_token(),
    );
    let suite = run_suite(&executor, &chunk.tests).await;
    if !suite.success {
        if let Ok(report) = serde_yaml::to_string(&suite) {
            warn!(chunk = %chunk.name, "test report:\n{report}");
        }
        return Err(DazzleError::TestsFailed {
            chunk: chunk.name.clone(),
        });
    }

    // Tests have passed - mark them as such.
    match push_test_result(
        session.registry.as_ref(),
        &result_ref.to_oci(),
        StoredTestResult { passed: true },
    )
    .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Full-image build and base subtraction of one chunk.
async fn build_chunk(chunk: &ProjectChunk, session: &mut BuildSession) -> Result<()> {
    let (full_ref, _) = build_image(chunk, ChunkImageType::Full, session).await?;

    let chunked_type = if session.opts.chunked_without_hash {
        ChunkImageType::ChunkedNoHash
    } else {
        ChunkImageType::Chunked
    };
    let dest = chunk_image_name(chunk, chunked_type, session)?;
    info!(chunk = %chunk.name, reference = %dest, "building chunked image");

    let (base_ref, base_manifest, base_config) = session.base_metadata()?;
    let (manifest, _) = subtract::remove_base_layers(
        session.registry.as_ref(),
        subtract::SubtractInput {
            base_ref,
            base_manifest,
            base_config,
            full_ref: &full_ref,
            dest: &dest,
        },
    )
    .await?;

    session.record_chunk(dest.to_string(), manifest);
    Ok(())
}

/// Build one chunk artifact unless its fingerprint tag already exists.
async fn build_image(
    chunk: &ProjectChunk,
    tpe: ChunkImageType,
    session: &BuildSession,
) -> Result<(DigestedRef, bool)> {
    let target = chunk_image_name(chunk, tpe, session)?;

    match session.registry.resolve(&target.to_oci()).await {
        Ok(digest) => return Ok((target.with_digest(digest), false)),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    info!(chunk = %chunk.name, reference = %target, "building {tpe} image");

    let (base_ref, _, _) = session.base_metadata()?;
    let mut frontend_attrs = HashMap::new();
    frontend_attrs.insert("build-arg:base".to_string(), base_ref.to_string());
    for (key, value) in &chunk.args {
        frontend_attrs.insert(format!("build-arg:{key}"), value.clone());
    }

    let (cache_imports, cache_exports) = if session.opts.no_cache {
        (Vec::new(), Vec::new())
    } else {
        let cache_ref = match &session.opts.cache_ref {
            Some(cache) => cache
                .with_tag(&format!("{}--cache", chunk.safe_name()))?
                .to_string(),
            None => target.to_string(),
        };
        (
            vec![CacheOptions::registry(&cache_ref)],
            vec![CacheOptions::inline()],
        )
    };

    let request = SolveRequest {
        frontend: "dockerfile".to_string(),
        frontend_attrs,
        context_dir: chunk.context_path.clone(),
        cache_imports,
        cache_exports,
        credentials: session_credentials(session),
        export: Some(ImageExport {
            name: target.to_string(),
            push: true,
        }),
        no_cache: session.opts.no_cache,
    };
    let response = invoke_solver(session, request).await?;
    Ok((target.with_digest(response.image_digest()?), true))
}

fn session_credentials(session: &BuildSession) -> Vec<RegistryCredential> {
    match credential_pair(session.dest.registry()) {
        Some((username, secret)) => vec![RegistryCredential {
            host: session.dest.registry().to_string(),
            username,
            secret,
        }],
        None => Vec::new(),
    }
}

/// Run one solve with its progress consumer; the two tasks join before this
/// function returns.
async fn invoke_solver(session: &BuildSession, request: SolveRequest) -> Result<SolveResponse> {
    let (tx, rx) = mpsc::channel::<StatusUpdate>(64);
    let renderer = ProgressRenderer::new(session.opts.plain_output);
    let consumer = tokio::spawn(progress::consume(rx, renderer));

    let result = session
        .solver
        .solve(request, tx, session.cancellation_token())
        .await;

    if let Err(e) = consumer.await {
        warn!(error = %e, "progress consumer failed");
    }
    result
}
