//! Test command: runs a test suite against an already-built image,
//! independent of any project or build. Useful for CI gating on images that
//! left dazzle's hands long ago; `--output-xml` saves the results as JUnit
//! XML.

use anyhow::{bail, Context, Result};
use dazzle_core::test::container::ContainerExecutor;
use dazzle_core::test::{junit_xml, run_suite, Spec};
use dazzle_core::{AnyRef, CancellationToken};
use std::path::Path;
use tracing::info;

pub async fn run(
    addr: &str,
    suite_path: &Path,
    image: &str,
    output_xml: Option<&Path>,
) -> Result<()> {
    let content = std::fs::read_to_string(suite_path)
        .with_context(|| format!("cannot read test suite {}", suite_path.display()))?;
    let specs: Vec<Spec> = serde_yaml::from_str(&content)
        .with_context(|| format!("cannot parse test suite {}", suite_path.display()))?;

    // Validate the image reference up front; the solver error for a bad ref
    // is far less helpful.
    let image = AnyRef::parse(image)?.to_string();

    let solver = super::connect_solver(addr).await?;
    let cancel = CancellationToken::new();
    super::cancel_on_ctrl_c(cancel.clone());

    info!(image = %image, tests = specs.len(), "running test suite");
    let executor = ContainerExecutor::new(solver, image, cancel);
    let suite = run_suite(&executor, &specs).await;

    let report = serde_yaml::to_string(&suite).context("cannot serialize test results")?;
    println!("{report}");

    if let Some(path) = output_xml {
        std::fs::write(path, junit_xml(&suite))
            .with_context(|| format!("cannot write {}", path.display()))?;
        info!(path = %path.display(), "wrote JUnit report");
    }

    if !suite.success {
        bail!("tests failed");
    }
    Ok(())
}
