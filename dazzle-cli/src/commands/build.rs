//! Build command: runs the orchestrator over a project directory.

use anyhow::{Context, Result};
use dazzle_core::{BuildOptions, BuildSession, NamedRef, Project};
use std::path::Path;
use tracing::info;

pub struct Args {
    pub target_ref: String,
    pub no_cache: bool,
    pub no_tests: bool,
    pub plain_output: bool,
    pub chunked_without_hash: bool,
    pub build_ref: Option<String>,
}

pub async fn run(context: &Path, addr: &str, args: Args) -> Result<()> {
    let project = Project::load_from_dir(context)
        .with_context(|| format!("cannot load project from {}", context.display()))?;
    info!(chunks = project.chunks.len(), "project loaded");

    let cache_ref = args
        .build_ref
        .as_deref()
        .map(NamedRef::parse)
        .transpose()
        .context("cannot parse build ref")?;

    let (registry, solver) = super::connect(addr).await?;
    let mut session = BuildSession::new(
        registry,
        solver,
        &args.target_ref,
        BuildOptions {
            cache_ref,
            no_cache: args.no_cache,
            no_tests: args.no_tests,
            plain_output: args.plain_output,
            chunked_without_hash: args.chunked_without_hash,
        },
    )?;
    super::cancel_on_ctrl_c(session.cancellation_token());

    project.build(&mut session).await?;
    Ok(())
}
