//! Combine-from-ref command: builds an ad-hoc project from pre-built chunk
//! references and combines them, using the base-ref annotations the layer
//! subtractor wrote.

use anyhow::{Context, Result};
use dazzle_core::{
    load_project_from_refs, AnyRef, BuildOptions, BuildSession, CombineOptions, LoadFromRefsOpts,
};
use tracing::info;

pub async fn run(
    addr: &str,
    target_ref: String,
    chunk_refs: Vec<String>,
    no_test: bool,
    ignore_differing_base_refs: bool,
) -> Result<()> {
    let target = match AnyRef::parse(&target_ref).context("cannot parse target-ref")? {
        AnyRef::Tagged(tagged) => tagged,
        AnyRef::Digested(_) => {
            anyhow::bail!("target-ref must be a tag, not a digest")
        }
    };

    let (registry, solver) = super::connect(addr).await?;
    let project = load_project_from_refs(
        registry.as_ref(),
        &chunk_refs,
        LoadFromRefsOpts {
            ignore_differing_base_refs,
        },
    )
    .await?;

    let mut session =
        BuildSession::new(registry, solver, &target_ref, BuildOptions::default())?;
    super::cancel_on_ctrl_c(session.cancellation_token());
    session
        .download_base_info(&project)
        .await
        .context("cannot download base-image info")?;

    let chunks: Vec<String> = project.chunks.iter().map(|c| c.name.clone()).collect();
    info!(chunks = ?chunks, reference = %target, "producing chunk combination");
    project
        .combine(
            &chunks,
            &target,
            &session,
            CombineOptions::with_tests(!no_test),
        )
        .await?;

    Ok(())
}
