//! CLI command implementations

pub mod build;
pub mod combine;
pub mod combine_from_ref;
pub mod project;
pub mod test;

use anyhow::{Context, Result};
use dazzle_core::{CancellationToken, GrpcSolver, OciRegistry, Registry, Solver};
use std::sync::Arc;

/// Connect to the build daemon.
pub async fn connect_solver(addr: &str) -> Result<Arc<dyn Solver>> {
    let solver: Arc<dyn Solver> = Arc::new(
        GrpcSolver::connect(addr)
            .await
            .with_context(|| format!("cannot connect to the build daemon at {addr}"))?,
    );
    Ok(solver)
}

/// Wire up the registry and solver shared by the build-ish commands.
pub async fn connect(addr: &str) -> Result<(Arc<dyn Registry>, Arc<dyn Solver>)> {
    let registry: Arc<dyn Registry> = Arc::new(OciRegistry::new());
    Ok((registry, connect_solver(addr).await?))
}

/// Propagate ctrl-c into a cancellation token. In-flight solver calls abort;
/// the registry stays consistent (uncommitted writes are invisible to future
/// runs).
pub fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("cancellation requested");
            cancel.cancel();
        }
    });
}
