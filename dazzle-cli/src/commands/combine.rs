//! Combine command: produces combination images from previously built
//! chunks of a project.

use anyhow::{bail, Context, Result};
use dazzle_core::{
    BuildOptions, BuildSession, ChunkCombination, CombineOptions, NamedRef, Project,
};
use std::path::Path;
use tracing::info;

pub struct Args {
    pub target_ref: String,
    pub all: bool,
    pub combination: Option<String>,
    pub chunks: Option<String>,
    pub no_test: bool,
    pub build_ref: Option<String>,
}

pub async fn run(context: &Path, addr: &str, args: Args) -> Result<()> {
    let project = Project::load_from_dir(context)
        .with_context(|| format!("cannot load project from {}", context.display()))?;

    let target = NamedRef::parse(&args.target_ref).context("cannot parse target-ref")?;

    let picks: Vec<ChunkCombination> = if args.all {
        project.config.combinations.clone()
    } else if let Some(name) = &args.combination {
        let combination = project
            .config
            .combinations
            .iter()
            .find(|c| &c.name == name)
            .with_context(|| format!("combination {name} not found"))?;
        vec![combination.clone()]
    } else if let Some(chunks) = &args.chunks {
        let Some((name, chunk_list)) = chunks.split_once('=') else {
            bail!("chunks have invalid format - expected name=chk1,chk2,chkN");
        };
        vec![ChunkCombination {
            name: name.to_string(),
            refs: Vec::new(),
            chunks: chunk_list.split(',').map(str::to_string).collect(),
        }]
    } else {
        bail!("must use one of --all, --combination or --chunks");
    };

    let build_ref = args.build_ref.as_deref().unwrap_or(&args.target_ref);
    let (registry, solver) = super::connect(addr).await?;
    let mut session =
        BuildSession::new(registry, solver, build_ref, BuildOptions::default())?;
    super::cancel_on_ctrl_c(session.cancellation_token());
    session
        .download_base_info(&project)
        .await
        .context("cannot download base-image info")?;

    for pick in picks {
        let dest = target.with_tag(&pick.name)?;
        info!(
            combination = %pick.name,
            chunks = ?pick.chunks,
            reference = %dest,
            "producing chunk combination"
        );
        project
            .combine(
                &pick.chunks,
                &dest,
                &session,
                CombineOptions::with_tests(!args.no_test),
            )
            .await?;
    }

    Ok(())
}
