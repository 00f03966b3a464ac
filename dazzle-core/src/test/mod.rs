//! Chunk tests.
//!
//! A test spec describes a command run inside a chunk image plus a list of
//! assertions over its stdout, stderr and exit code. Execution backends:
//! a local fork-exec runner (used by the `dazzle-runner` binary injected
//! into containers) and an in-container runner that builds an ephemeral
//! image through the solver.

pub mod assert;
pub mod container;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// A single command execution test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    pub desc: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub skip: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(rename = "assert")]
    pub assertions: Vec<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Raw output captured from a test command. This is also the document the
/// in-container runner prints as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub status: i64,
}

/// Failure or error details of one test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrResult {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Result of one test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestResult {
    pub desc: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub skipped: bool,

    /// The test could not be evaluated (runner failure, bad assertion).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrResult>,

    /// An assertion evaluated to false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunResult>,
}

impl TestResult {
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.failure.is_none()
    }
}

/// Results of a whole test suite. `success` is true iff every non-skipped
/// test passed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiteResult {
    pub results: Vec<TestResult>,
    pub success: bool,
}

/// An execution backend for test specs.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, spec: &Spec) -> Result<RunResult>;

    /// The image under test, for reporting.
    fn image_ref(&self) -> Option<String> {
        None
    }
}

/// Evaluate the assertions of a spec against a run result.
///
/// The first failing assertion short-circuits the rest. A throwing or
/// non-boolean assertion is an *error*, a false one a *failure*.
pub fn evaluate_assertions(spec: &Spec, run: &RunResult) -> (Option<ErrResult>, Option<ErrResult>) {
    let scope = assert::Scope {
        stdout: run.stdout.clone(),
        stderr: run.stderr.clone(),
        status: run.status,
    };
    for assertion in &spec.assertions {
        match assert::check(assertion, &scope) {
            Ok(true) => continue,
            Ok(false) => {
                return (
                    None,
                    Some(ErrResult {
                        message: format!("assertion failed: {assertion}"),
                        kind: "failure".to_string(),
                    }),
                );
            }
            Err(e) => {
                return (
                    Some(ErrResult {
                        message: format!("{assertion}: {e}"),
                        kind: "assertion".to_string(),
                    }),
                    None,
                );
            }
        }
    }
    (None, None)
}

/// Execute a series of tests in declared order.
///
/// Failures accumulate; an errored test short-circuits the remainder of the
/// suite because subsequent results would not be trustworthy.
pub async fn run_suite(executor: &dyn Executor, specs: &[Spec]) -> SuiteResult {
    let mut results = Vec::new();
    let mut success = true;

    for (step, spec) in specs.iter().enumerate() {
        if spec.skip {
            warn!(step, desc = %spec.desc, "skipping test");
            results.push(TestResult {
                desc: spec.desc.clone(),
                image_ref: executor.image_ref(),
                skipped: true,
                ..Default::default()
            });
            continue;
        }

        info!(step, desc = %spec.desc, command = ?spec.command, "running test");
        let mut result = TestResult {
            desc: spec.desc.clone(),
            image_ref: executor.image_ref(),
            ..Default::default()
        };

        match executor.run(spec).await {
            Err(e) => {
                result.error = Some(ErrResult {
                    message: e.to_string(),
                    kind: "executor".to_string(),
                });
            }
            Ok(run) => {
                let (error, failure) = evaluate_assertions(spec, &run);
                result.error = error;
                result.failure = failure;
                result.run = Some(run);
            }
        }

        if let Some(e) = &result.error {
            error!(desc = %spec.desc, message = %e.message, "test error");
            success = false;
            results.push(result);
            break;
        }
        if let Some(f) = &result.failure {
            error!(desc = %spec.desc, message = %f.message, "test failed");
            success = false;
            results.push(result);
            continue;
        }

        info!(desc = %spec.desc, "test passed");
        results.push(result);
    }

    SuiteResult { results, success }
}

/// Serialize a suite result as a JUnit XML document, one `<testsuite>` per
/// test. This is what CI systems ingest from the standalone `test` command.
pub fn junit_xml(suite: &SuiteResult) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<testsuites>\n");
    for result in &suite.results {
        out.push_str(&format!(
            "  <testsuite name=\"{}\" classname=\"{}\">\n",
            xml_escape(&result.desc),
            xml_escape(result.image_ref.as_deref().unwrap_or("")),
        ));
        if result.skipped {
            out.push_str("    <skipped/>\n");
        }
        if let Some(error) = &result.error {
            out.push_str(&format!(
                "    <error message=\"{}\" type=\"{}\"/>\n",
                xml_escape(&error.message),
                xml_escape(&error.kind),
            ));
        }
        if let Some(failure) = &result.failure {
            out.push_str(&format!(
                "    <failure message=\"{}\" type=\"{}\"/>\n",
                xml_escape(&failure.message),
                xml_escape(&failure.kind),
            ));
        }
        if let Some(run) = &result.run {
            out.push_str(&format!(
                "    <system-out>{}</system-out>\n    <system-err>{}</system-err>\n",
                xml_escape(&run.stdout),
                xml_escape(&run.stderr),
            ));
        }
        out.push_str("  </testsuite>\n");
    }
    out.push_str("</testsuites>\n");
    out
}

fn xml_escape(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DazzleError;
    use std::sync::Mutex;

    /// Executor stub returning canned results per command.
    struct StubExecutor {
        results: Mutex<Vec<Result<RunResult>>>,
    }

    impl StubExecutor {
        fn new(results: Vec<Result<RunResult>>) -> Self {
            Self {
                results: Mutex::new(results),
            }
        }
    }

    #[async_trait]
    impl Executor for StubExecutor {
        async fn run(&self, _spec: &Spec) -> Result<RunResult> {
            self.results.lock().unwrap().remove(0)
        }
    }

    fn spec(desc: &str, assertion: &str) -> Spec {
        Spec {
            desc: desc.to_string(),
            command: vec!["true".to_string()],
            assertions: vec![assertion.to_string()],
            ..Default::default()
        }
    }

    fn ok_run() -> Result<RunResult> {
        Ok(RunResult {
            stdout: "hello".to_string(),
            stderr: String::new(),
            status: 0,
        })
    }

    #[tokio::test]
    async fn test_suite_all_passing() {
        let executor = StubExecutor::new(vec![ok_run(), ok_run()]);
        let specs = vec![spec("a", "status == 0"), spec("b", "stdout == 'hello'")];
        let suite = run_suite(&executor, &specs).await;
        assert!(suite.success);
        assert_eq!(suite.results.len(), 2);
        assert!(suite.results.iter().all(TestResult::passed));
    }

    #[tokio::test]
    async fn test_suite_failure_does_not_short_circuit() {
        let executor = StubExecutor::new(vec![ok_run(), ok_run()]);
        let specs = vec![spec("fails", "status == 1"), spec("passes", "status == 0")];
        let suite = run_suite(&executor, &specs).await;
        assert!(!suite.success);
        assert_eq!(suite.results.len(), 2);
        assert!(suite.results[0].failure.is_some());
        assert!(suite.results[1].passed());
    }

    #[tokio::test]
    async fn test_suite_error_short_circuits() {
        let executor = StubExecutor::new(vec![
            Err(DazzleError::Internal("boom".to_string())),
            ok_run(),
        ]);
        let specs = vec![spec("errors", "status == 0"), spec("never-runs", "true")];
        let suite = run_suite(&executor, &specs).await;
        assert!(!suite.success);
        assert_eq!(suite.results.len(), 1);
        assert_eq!(suite.results[0].error.as_ref().unwrap().kind, "executor");
    }

    #[tokio::test]
    async fn test_suite_non_boolean_assertion_is_an_error() {
        let executor = StubExecutor::new(vec![ok_run()]);
        let specs = vec![spec("bad assertion", "stdout")];
        let suite = run_suite(&executor, &specs).await;
        assert!(!suite.success);
        assert_eq!(suite.results[0].error.as_ref().unwrap().kind, "assertion");
    }

    #[tokio::test]
    async fn test_suite_skipped_tests_do_not_count() {
        let mut skipped = spec("skipped", "status == 1");
        skipped.skip = true;
        let executor = StubExecutor::new(vec![]);
        let suite = run_suite(&executor, &[skipped]).await;
        assert!(suite.success);
        assert!(suite.results[0].skipped);
    }

    #[test]
    fn test_junit_xml_shape() {
        let suite = SuiteResult {
            results: vec![
                TestResult {
                    desc: "passes".to_string(),
                    image_ref: Some("example.com/repo:tag".to_string()),
                    run: Some(RunResult {
                        stdout: "ok".to_string(),
                        stderr: String::new(),
                        status: 0,
                    }),
                    ..Default::default()
                },
                TestResult {
                    desc: "fails with <angle> & \"quotes\"".to_string(),
                    failure: Some(ErrResult {
                        message: "assertion failed: status == 0".to_string(),
                        kind: "failure".to_string(),
                    }),
                    ..Default::default()
                },
                TestResult {
                    desc: "skipped".to_string(),
                    skipped: true,
                    ..Default::default()
                },
            ],
            success: false,
        };

        let xml = junit_xml(&suite);
        assert!(xml.starts_with("<?xml version=\"1.0\""));
        assert!(xml.contains("<testsuite name=\"passes\" classname=\"example.com/repo:tag\">"));
        assert!(xml.contains("<system-out>ok</system-out>"));
        assert!(xml.contains("fails with &lt;angle&gt; &amp; &quot;quotes&quot;"));
        assert!(xml.contains("<failure message=\"assertion failed: status == 0\""));
        assert!(xml.contains("<skipped/>"));
        assert_eq!(xml.matches("</testsuite>").count(), 3);
    }

    #[test]
    fn test_spec_yaml_shape() {
        let yaml = r#"
- desc: "it should run ls"
  command: ["ls"]
  assert:
  - "status == 0"
- desc: "as root"
  user: root
  command: ["id", "-u"]
  env: ["HOME=/root"]
  assert:
  - "stdout.trim() == '0'"
"#;
        let specs: Vec<Spec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].assertions, vec!["status == 0"]);
        assert_eq!(specs[1].user.as_deref(), Some("root"));
        assert_eq!(specs[1].env, vec!["HOME=/root"]);
    }
}
