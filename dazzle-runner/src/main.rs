//! In-container test runner.
//!
//! Invoked with a single argument, the base64-JSON-encoded test spec.
//! Executes the spec locally and prints the run result as JSON between
//! sentinel markers so the caller can recover it from the interleaved build
//! log stream. Execution failures become a run result with status 255 - the
//! assertions are the judge, not this binary.

use base64::Engine;
use dazzle_core::test::container::{RESULT_MARKER_END, RESULT_MARKER_START};
use dazzle_core::test::local::run_local;
use dazzle_core::test::{RunResult, Spec};
use std::process::exit;

fn main() {
    let Some(encoded) = std::env::args().nth(1) else {
        eprintln!("usage: dazzle-runner <base64-encoded-spec>");
        exit(1);
    };

    let decoded = match base64::engine::general_purpose::STANDARD.decode(&encoded) {
        Ok(decoded) => decoded,
        Err(e) => fail(&format!("cannot decode spec: {e}")),
    };
    let spec: Spec = match serde_json::from_slice(&decoded) {
        Ok(spec) => spec,
        Err(e) => fail(&format!("cannot unmarshal spec: {e}")),
    };

    let result = match run_local(&spec) {
        Ok(result) => result,
        Err(e) => RunResult {
            stdout: String::new(),
            stderr: format!("cannot run command: {e}"),
            status: 255,
        },
    };

    let document = match serde_json::to_string(&result) {
        Ok(document) => document,
        Err(e) => fail(&format!("cannot marshal result: {e}")),
    };
    println!("{RESULT_MARKER_START}");
    println!("{document}");
    println!("{RESULT_MARKER_END}");
}

fn fail(message: &str) -> ! {
    eprintln!("{message}");
    exit(2);
}
