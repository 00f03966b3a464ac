//! In-container test execution.
//!
//! Builds an ephemeral image on top of the image under test with the tiny
//! `dazzle-runner` binary injected at a fixed path, runs it with the
//! base64-JSON-encoded spec as its single argument, and recovers the JSON
//! run-result document from the solver's build log stream.

use crate::error::{DazzleError, Result};
use crate::solver::{progress, SolveRequest, Solver, StatusUpdate};
use crate::test::{Executor, RunResult, Spec};
use async_trait::async_trait;
use base64::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Path of the runner inside the ephemeral test image.
const RUNNER_PATH: &str = "/dazzle/runner";

/// Markers the runner prints around its JSON result so it can be fished out
/// of the interleaved build log.
pub const RESULT_MARKER_START: &str = "DAZZLE_TEST_RESULT";
pub const RESULT_MARKER_END: &str = "DAZZLE_TEST_RESULT_END";

/// Runs test specs inside containers derived from the image under test.
pub struct ContainerExecutor {
    solver: Arc<dyn Solver>,
    image: String,
    cancel: CancellationToken,
}

impl ContainerExecutor {
    pub fn new(solver: Arc<dyn Solver>, image: String, cancel: CancellationToken) -> Self {
        Self {
            solver,
            image,
            cancel,
        }
    }
}

#[async_trait]
impl Executor for ContainerExecutor {
    async fn run(&self, spec: &Spec) -> Result<RunResult> {
        let runner = runner_binary()?;
        let context = tempfile::tempdir().map_err(|e| DazzleError::Io {
            path: std::env::temp_dir(),
            source: e,
        })?;

        let runner_dest = context.path().join("dazzle-runner");
        std::fs::copy(&runner, &runner_dest).map_err(|e| DazzleError::Io {
            path: runner_dest.clone(),
            source: e,
        })?;

        let encoded = runner_args(spec)?;
        let dockerfile = format!(
            "FROM {image}\nCOPY --chmod=0755 dazzle-runner {RUNNER_PATH}\nRUN {RUNNER_PATH} {encoded}\n",
            image = self.image,
        );
        let dockerfile_path = context.path().join("Dockerfile");
        std::fs::write(&dockerfile_path, dockerfile).map_err(|e| DazzleError::Io {
            path: dockerfile_path,
            source: e,
        })?;

        // The RUN step must execute even when the daemon has seen this spec
        // before, hence no-cache. The logs are the result channel.
        let request = SolveRequest {
            frontend: "dockerfile".to_string(),
            context_dir: context.path().to_path_buf(),
            no_cache: true,
            export: None,
            ..Default::default()
        };

        let (tx, rx) = mpsc::channel::<StatusUpdate>(64);
        let collector = tokio::spawn(progress::collect_logs(rx));
        let solve_result = self.solver.solve(request, tx, self.cancel.clone()).await;
        let logs = collector
            .await
            .map_err(|e| DazzleError::Internal(format!("log collector failed: {e}")))?;
        solve_result?;

        debug!(bytes = logs.len(), "collected test run output");
        parse_run_output(&logs)
    }

    fn image_ref(&self) -> Option<String> {
        Some(self.image.clone())
    }
}

/// The single runner argument: the spec as base64-encoded JSON.
pub fn runner_args(spec: &Spec) -> Result<String> {
    let json = serde_json::to_vec(spec)
        .map_err(|e| DazzleError::Internal(format!("cannot serialize test spec: {e}")))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(json))
}

/// Locate the runner binary: `DAZZLE_RUNNER` if set, otherwise the
/// `dazzle-runner` binary next to the current executable.
fn runner_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("DAZZLE_RUNNER") {
        return Ok(PathBuf::from(path));
    }
    let exe = std::env::current_exe()
        .map_err(|e| DazzleError::Internal(format!("cannot locate current executable: {e}")))?;
    let sibling = exe.with_file_name("dazzle-runner");
    if sibling.exists() {
        return Ok(sibling);
    }
    Err(DazzleError::Internal(format!(
        "cannot find the dazzle-runner binary next to {} - set DAZZLE_RUNNER",
        exe.display()
    )))
}

/// Extract the run-result JSON document from raw build log bytes.
pub fn parse_run_output(logs: &[u8]) -> Result<RunResult> {
    let text = String::from_utf8_lossy(logs);
    let mut collecting = false;
    let mut document = String::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed == RESULT_MARKER_START {
            collecting = true;
            document.clear();
            continue;
        }
        if trimmed == RESULT_MARKER_END {
            return serde_json::from_str(&document).map_err(|e| {
                DazzleError::Internal(format!("cannot parse runner output: {e}"))
            });
        }
        if collecting {
            document.push_str(line);
            document.push('\n');
        }
    }
    Err(DazzleError::Internal(
        "runner produced no result document".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_output() {
        let logs = b"#5 [2/2] RUN /dazzle/runner abc\nsome noise\nDAZZLE_TEST_RESULT\n{\"stdout\":\"hi\",\"stderr\":\"\",\"status\":3}\nDAZZLE_TEST_RESULT_END\ntrailing\n";
        let result = parse_run_output(logs).unwrap();
        assert_eq!(result.stdout, "hi");
        assert_eq!(result.status, 3);
    }

    #[test]
    fn test_parse_run_output_without_markers() {
        assert!(parse_run_output(b"no markers here").is_err());
    }

    #[test]
    fn test_parse_run_output_multiline_document() {
        let logs = b"DAZZLE_TEST_RESULT\n{\n  \"stdout\": \"a\",\n  \"stderr\": \"b\",\n  \"status\": 0\n}\nDAZZLE_TEST_RESULT_END\n";
        let result = parse_run_output(logs).unwrap();
        assert_eq!(result.stderr, "b");
    }

    #[test]
    fn test_runner_args_roundtrip() {
        let spec = Spec {
            desc: "probe".to_string(),
            command: vec!["echo".to_string(), "ok".to_string()],
            assertions: vec!["status == 0".to_string()],
            ..Default::default()
        };
        let encoded = runner_args(&spec).unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        let parsed: Spec = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(parsed, spec);
    }
}
