//! Project scaffolding and debugging commands. These touch config files
//! only; nothing here talks to a registry or the build daemon.

use anyhow::{bail, Context, Result};
use dazzle_core::project::{
    load_chunks, load_project_config, write_project_config, ChunkCombination, ProjectConfig,
};
use dazzle_core::Project;
use std::fs;
use std::path::Path;
use tracing::info;

const SAMPLE_BASE_DOCKERFILE: &str = "FROM alpine:latest\n";

const SAMPLE_CHUNK_DOCKERFILE: &str = "ARG base\nFROM ${base}\n\nRUN true\n";

const SAMPLE_TEST: &str = r#"- desc: "it should say hello"
  command: ["echo", "hello"]
  assert:
  - "status == 0"
  - "stdout.indexOf(\"hello\") != -1"
"#;

/// Scaffold a new project, or a single chunk when a name is given.
pub fn init(context: &Path, chunk: Option<String>) -> Result<()> {
    match chunk {
        Some(name) => init_chunk(context, &name),
        None => init_project(context),
    }
}

fn init_project(context: &Path) -> Result<()> {
    let config_path = context.join("dazzle.yaml");
    if config_path.exists() {
        bail!("{} already exists", config_path.display());
    }

    fs::create_dir_all(context.join("base"))?;
    fs::create_dir_all(context.join("chunks"))?;
    fs::create_dir_all(context.join("tests"))?;
    write_file_new(&context.join("base/Dockerfile"), SAMPLE_BASE_DOCKERFILE)?;
    write_project_config(context, &ProjectConfig::default())?;

    info!(dir = %context.display(), "initialized dazzle project");
    Ok(())
}

fn init_chunk(context: &Path, name: &str) -> Result<()> {
    let chunk_dir = context.join("chunks").join(name);
    if chunk_dir.exists() {
        bail!("chunk {name} already exists");
    }
    fs::create_dir_all(&chunk_dir)?;
    write_file_new(&chunk_dir.join("Dockerfile"), SAMPLE_CHUNK_DOCKERFILE)?;
    fs::create_dir_all(context.join("tests"))?;
    write_file_new(
        &context.join("tests").join(format!("{name}.yaml")),
        SAMPLE_TEST,
    )?;

    info!(chunk = %name, "initialized chunk");
    Ok(())
}

fn write_file_new(path: &Path, content: &str) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    fs::write(path, content).with_context(|| format!("cannot write {}", path.display()))
}

/// Add a named combination to the project config.
pub fn add_combination(context: &Path, name: &str, chunks: &[String]) -> Result<()> {
    let mut config = load_project_config(context)?;
    if config.combiner.combinations.iter().any(|c| c.name == name) {
        bail!("combination {name} already exists");
    }
    config.combiner.combinations.push(ChunkCombination {
        name: name.to_string(),
        refs: Vec::new(),
        chunks: chunks.to_vec(),
    });
    write_project_config(context, &config)?;
    info!(combination = %name, chunks = ?chunks, "added combination");
    Ok(())
}

/// Append ignore patterns for the chunks directory.
pub fn ignore(context: &Path, patterns: &[String]) -> Result<()> {
    let mut config = load_project_config(context)?;
    for pattern in patterns {
        if !config.chunk_ignore.contains(pattern) {
            config.chunk_ignore.push(pattern.clone());
        }
    }
    write_project_config(context, &config)?;
    info!(patterns = ?patterns, "updated ignore list");
    Ok(())
}

/// Print a chunk's fingerprints, with and without tests. These are local
/// fingerprints (no base reference mixed in); their purpose is debugging
/// why a tag changed between runs.
pub fn hash(context: &Path, chunk: &str) -> Result<()> {
    for chunk in find_chunks(context, chunk)? {
        println!(
            "{}: {} (with tests: {})",
            chunk.name,
            chunk.fingerprint("", false)?,
            chunk.fingerprint("", true)?,
        );
    }
    Ok(())
}

/// Print a chunk's canonical hash manifest.
pub fn print_manifest(context: &Path, chunk: &str) -> Result<()> {
    for chunk in find_chunks(context, chunk)? {
        let mut out = Vec::new();
        chunk.write_hash_manifest("", true, &mut out)?;
        print!("{}", String::from_utf8_lossy(&out));
    }
    Ok(())
}

fn find_chunks(context: &Path, name: &str) -> Result<Vec<dazzle_core::ProjectChunk>> {
    if name == "base" {
        let project = Project::load_from_dir(context)?;
        return Ok(vec![project.base]);
    }
    // Strip a variant suffix for loading; variants filter afterwards.
    let dir_name = name.split(':').next().unwrap_or(name);
    let chunks = load_chunks(context, "chunks", dir_name)?;
    let matching: Vec<_> = chunks
        .into_iter()
        .filter(|c| c.name == name || dir_name == name)
        .collect();
    if matching.is_empty() {
        bail!("chunk {name} not found");
    }
    Ok(matching)
}
