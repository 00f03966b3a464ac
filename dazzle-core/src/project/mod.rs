//! Project model and loading.
//!
//! A dazzle project is a directory with a `dazzle.yaml`, a `base/` chunk, a
//! `chunks/` directory of layer chunks (optionally with `chunk.yaml` variant
//! files) and per-chunk test specs under `tests/`. Projects are immutable
//! once loaded; the combination references of the raw config are resolved
//! into a flat, resolved set at load time by a pure fixed-point step.

pub mod fingerprint;

use crate::error::{DazzleError, Result};
use crate::reference::{AnyRef, DigestedRef};
use crate::registry::{Registry, ANNOTATION_BASE_REF, ANNOTATION_ENV_PREFIX};
use crate::test::Spec;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

const PROJECT_CONFIG_FILE: &str = "dazzle.yaml";
const CHUNK_CONFIG_FILE: &str = "chunk.yaml";
const CHUNKS_DIR: &str = "chunks";
const TESTS_DIR: &str = "tests";
const BASE_DIR: &str = "base";

/// Raw structure of a project's `dazzle.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub combiner: CombinerConfig,

    #[serde(default, rename = "ignore", skip_serializing_if = "Vec::is_empty")]
    pub chunk_ignore: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CombinerConfig {
    #[serde(default)]
    pub combinations: Vec<ChunkCombination>,

    #[serde(default, rename = "envvars", skip_serializing_if = "Vec::is_empty")]
    pub env_vars: Vec<EnvVarCombination>,
}

/// Combines several chunks into a new image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCombination {
    pub name: String,

    /// Other combinations whose chunks are folded into this one.
    #[serde(default, rename = "ref", skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<String>,
}

/// How a single env var is combined across base and chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarCombination {
    pub name: String,
    pub action: EnvVarAction,
}

/// Mode by which an env var is combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvVarAction {
    /// Values are appended with `:`.
    Merge,
    /// Like `Merge`, but `: `-separated segments are deduplicated.
    MergeUnique,
    /// The last chunk that sets the variable wins.
    UseLast,
    /// The base value wins if set.
    UseFirst,
}

impl EnvVarAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVarAction::Merge => "merge",
            EnvVarAction::MergeUnique => "merge-unique",
            EnvVarAction::UseLast => "use-last",
            EnvVarAction::UseFirst => "use-first",
        }
    }
}

impl fmt::Display for EnvVarAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvVarAction {
    type Err = DazzleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "merge" => Ok(EnvVarAction::Merge),
            "merge-unique" => Ok(EnvVarAction::MergeUnique),
            "use-last" => Ok(EnvVarAction::UseLast),
            "use-first" => Ok(EnvVarAction::UseFirst),
            other => Err(DazzleError::UnknownEnvAction {
                action: other.to_string(),
            }),
        }
    }
}

/// Optional `chunk.yaml` describing the variants of a chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkConfig {
    pub variants: Vec<ChunkVariant>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkVariant {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,

    /// Alternative Dockerfile, relative to the chunk directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
}

/// Project configuration after combination references have been resolved.
/// Combinations are flat (no `ref` edges left) and sorted by name.
#[derive(Debug, Clone, Default)]
pub struct ResolvedProjectConfig {
    pub combinations: Vec<ChunkCombination>,
    pub env_vars: Vec<EnvVarCombination>,
}

/// A dazzle build project. Immutable after loading.
#[derive(Debug, Clone)]
pub struct Project {
    pub base: ProjectChunk,
    pub chunks: Vec<ProjectChunk>,
    pub config: ResolvedProjectConfig,
}

/// A layer chunk: one Dockerfile plus context, optionally tests and
/// variant build-args. Chunks of ad-hoc projects built from pre-existing
/// registry refs carry `prebuilt` instead of a Dockerfile.
#[derive(Debug, Clone, Default)]
pub struct ProjectChunk {
    pub name: String,
    pub dockerfile: Vec<u8>,
    pub context_path: PathBuf,
    pub tests: Vec<Spec>,
    pub args: BTreeMap<String, String>,
    pub prebuilt: Option<DigestedRef>,
}

impl ProjectChunk {
    /// The chunk name with the variant separator replaced so it is usable
    /// inside an image tag.
    pub fn safe_name(&self) -> String {
        self.name.replace(':', "-")
    }
}

impl Project {
    /// Load a project from a directory laid out as described in the module
    /// docs.
    pub fn load_from_dir(dir: &Path) -> Result<Project> {
        let raw = load_project_config(dir)?;
        let combinations = resolve_combinations(&raw.combiner.combinations)?;
        let ignore = compile_ignore(&raw.chunk_ignore)?;

        let base = load_chunks(dir, "", BASE_DIR)?;
        if base.len() != 1 {
            return Err(DazzleError::Internal(
                "base must have exactly one variant".to_string(),
            ));
        }

        let mut chunks = Vec::new();
        let chunks_dir = dir.join(CHUNKS_DIR);
        let mut entries: Vec<_> = std::fs::read_dir(&chunks_dir)
            .map_err(|e| DazzleError::Io {
                path: chunks_dir.clone(),
                source: e,
            })?
            .collect::<std::io::Result<_>>()
            .map_err(|e| DazzleError::Io {
                path: chunks_dir.clone(),
                source: e,
            })?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('_') || name.starts_with('.') {
                continue;
            }
            if ignore.is_match(&name) {
                debug!(chunk = %name, "skipping ignored chunk");
                continue;
            }
            if !entry.path().is_dir() {
                continue;
            }
            let loaded = load_chunks(dir, CHUNKS_DIR, &name)?;
            for chunk in &loaded {
                info!(name = %chunk.name, "added chunk to project");
            }
            chunks.extend(loaded);
        }

        let mut seen = HashSet::new();
        for chunk in &chunks {
            if !seen.insert(chunk.name.clone()) {
                return Err(DazzleError::Internal(format!(
                    "duplicate chunk name after variant expansion: {}",
                    chunk.name
                )));
            }
        }

        Ok(Project {
            base: base.into_iter().next().unwrap_or_default(),
            chunks,
            config: ResolvedProjectConfig {
                combinations,
                env_vars: raw.combiner.env_vars,
            },
        })
    }

    /// Find a chunk by its variant-expanded name.
    pub fn find_chunk(&self, name: &str) -> Result<&ProjectChunk> {
        self.chunks
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DazzleError::UnknownChunk {
                name: name.to_string(),
            })
    }
}

/// Load and parse a project's `dazzle.yaml`.
pub fn load_project_config(dir: &Path) -> Result<ProjectConfig> {
    let path = dir.join(PROJECT_CONFIG_FILE);
    let content = std::fs::read_to_string(&path).map_err(|e| DazzleError::Io {
        path: path.clone(),
        source: e,
    })?;
    serde_yaml::from_str(&content).map_err(|e| DazzleError::MalformedYaml { path, source: e })
}

/// Write a project config back to `<dir>/dazzle.yaml`. Used by the
/// scaffolding commands only.
pub fn write_project_config(dir: &Path, config: &ProjectConfig) -> Result<()> {
    let path = dir.join(PROJECT_CONFIG_FILE);
    let content = serde_yaml::to_string(config)
        .map_err(|e| DazzleError::Internal(format!("cannot serialize project config: {e}")))?;
    std::fs::write(&path, content).map_err(|e| DazzleError::Io { path, source: e })
}

fn compile_ignore(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            DazzleError::Internal(format!("invalid ignore pattern {pattern}: {e}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| DazzleError::Internal(format!("invalid ignore patterns: {e}")))
}

/// Resolve the `ref` edges between combinations into flat chunk sets.
///
/// This is a fixed-point union: each iteration folds referenced combinations'
/// chunks into the referencing one until nothing changes. Cycles are legal
/// and self-resolving; the iteration count is bounded by `len(input) + 1`.
pub fn resolve_combinations(input: &[ChunkCombination]) -> Result<Vec<ChunkCombination>> {
    let mut chunks: BTreeMap<&str, HashSet<String>> = BTreeMap::new();
    for combination in input {
        chunks.insert(
            &combination.name,
            combination.chunks.iter().cloned().collect(),
        );
    }
    for combination in input {
        for reference in &combination.refs {
            if !chunks.contains_key(reference.as_str()) {
                return Err(DazzleError::MalformedCombinationRef {
                    name: combination.name.clone(),
                    reference: reference.clone(),
                });
            }
        }
    }

    let mut changed = true;
    let mut iterations = input.len() + 1;
    while changed && iterations > 0 {
        changed = false;
        for combination in input {
            for reference in &combination.refs {
                let referenced: Vec<String> = chunks[reference.as_str()].iter().cloned().collect();
                let own = chunks
                    .get_mut(combination.name.as_str())
                    .expect("combination present by construction");
                for chunk in referenced {
                    if own.insert(chunk) {
                        changed = true;
                    }
                }
            }
        }
        iterations -= 1;
    }
    if changed {
        return Err(DazzleError::Internal(
            "combination references did not converge".to_string(),
        ));
    }

    Ok(chunks
        .into_iter()
        .map(|(name, set)| {
            let mut chunk_names: Vec<String> = set.into_iter().collect();
            chunk_names.sort();
            ChunkCombination {
                name: name.to_string(),
                refs: Vec::new(),
                chunks: chunk_names,
            }
        })
        .collect())
}

/// Load the chunk(s) in `<root>/<subdir>/<name>`; a `chunk.yaml` expands the
/// directory into one chunk per variant.
pub fn load_chunks(root: &Path, subdir: &str, name: &str) -> Result<Vec<ProjectChunk>> {
    let chunk_dir = if subdir.is_empty() {
        root.join(name)
    } else {
        root.join(subdir).join(name)
    };

    let load = |variant: &ChunkVariant| -> Result<ProjectChunk> {
        let dockerfile_name = variant.dockerfile.as_deref().unwrap_or("Dockerfile");
        let dockerfile_path = chunk_dir.join(dockerfile_name);
        let dockerfile = std::fs::read(&dockerfile_path).map_err(|e| DazzleError::Io {
            path: dockerfile_path.clone(),
            source: e,
        })?;

        let full_name = if variant.name.is_empty() {
            name.to_string()
        } else {
            format!("{}:{}", name, variant.name)
        };
        let tests = load_tests(root, name, &variant.name)?;

        Ok(ProjectChunk {
            name: full_name,
            dockerfile,
            context_path: chunk_dir.clone(),
            tests,
            args: variant.args.clone(),
            prebuilt: None,
        })
    };

    let chunk_config_path = chunk_dir.join(CHUNK_CONFIG_FILE);
    if chunk_config_path.exists() {
        let content =
            std::fs::read_to_string(&chunk_config_path).map_err(|e| DazzleError::Io {
                path: chunk_config_path.clone(),
                source: e,
            })?;
        let config: ChunkConfig = serde_yaml::from_str(&content).map_err(|e| {
            DazzleError::MalformedYaml {
                path: chunk_config_path,
                source: e,
            }
        })?;
        return config.variants.iter().map(load).collect();
    }

    Ok(vec![load(&ChunkVariant::default())?])
}

/// Load test specs for a chunk. Variant chunks may carry their own spec file
/// (`tests/<name>:<variant>.yaml`) and fall back to the shared one; a missing
/// file is equivalent to no tests.
fn load_tests(root: &Path, name: &str, variant: &str) -> Result<Vec<Spec>> {
    let mut candidates = Vec::new();
    if !variant.is_empty() {
        candidates.push(root.join(TESTS_DIR).join(format!("{name}:{variant}.yaml")));
    }
    candidates.push(root.join(TESTS_DIR).join(format!("{name}.yaml")));

    for path in candidates {
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                return serde_yaml::from_str(&content)
                    .map_err(|e| DazzleError::MalformedYaml { path, source: e });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(DazzleError::Io { path, source: e }),
        }
    }
    Ok(Vec::new())
}

/// Options for [`load_project_from_refs`].
#[derive(Debug, Clone, Default)]
pub struct LoadFromRefsOpts {
    /// Demote differing base refs from an error to a warning.
    pub ignore_differing_base_refs: bool,
}

/// Construct an ad-hoc project from pre-built chunk references.
///
/// Each chunk manifest must carry the base-ref annotation written by the
/// layer subtractor; env-var combination policies are recovered from the
/// base manifest's annotations.
pub async fn load_project_from_refs(
    registry: &dyn Registry,
    refs: &[String],
    opts: LoadFromRefsOpts,
) -> Result<Project> {
    let mut base_ref: Option<(String, String)> = None; // (annotation value, owning chunk)
    let mut chunks = Vec::new();

    for input in refs {
        let any = AnyRef::parse(input)?;
        let pulled = registry.pull(&any.to_oci()).await?;

        let annotation = pulled
            .manifest
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_BASE_REF))
            .cloned()
            .ok_or_else(|| {
                DazzleError::Internal(format!(
                    "chunk {input} has no {ANNOTATION_BASE_REF} annotation - please build that chunk with an up-to-date version of dazzle"
                ))
            })?;

        match &base_ref {
            None => base_ref = Some((annotation, input.clone())),
            Some((existing, owner)) if *existing != annotation => {
                if opts.ignore_differing_base_refs {
                    warn!(
                        chunk = %input,
                        base = %annotation,
                        expected = %existing,
                        "ignoring differing base ref"
                    );
                } else {
                    return Err(DazzleError::Internal(format!(
                        "cannot combine chunks with different base images: chunk {owner} is based on {existing}, while chunk {input} is based on {annotation}"
                    )));
                }
            }
            Some(_) => {}
        }

        let digested = match any {
            AnyRef::Digested(d) => d,
            AnyRef::Tagged(t) => t.with_digest(pulled.manifest_digest.clone()),
        };
        chunks.push(ProjectChunk {
            name: input.clone(),
            prebuilt: Some(digested),
            ..Default::default()
        });
    }

    let (base_annotation, _) = base_ref.ok_or_else(|| {
        DazzleError::Internal("cannot build a project from an empty set of chunk refs".to_string())
    })?;
    let base_any = AnyRef::parse(&base_annotation).map_err(|_| {
        DazzleError::InvalidReference {
            reference: base_annotation.clone(),
            reason: "cannot parse base ref annotation".to_string(),
        }
    })?;
    let base_pulled = registry.pull(&base_any.to_oci()).await?;

    let mut env_vars = Vec::new();
    if let Some(annotations) = &base_pulled.manifest.annotations {
        for (key, value) in annotations {
            if let Some(name) = key.strip_prefix(ANNOTATION_ENV_PREFIX) {
                env_vars.push(EnvVarCombination {
                    name: name.to_string(),
                    action: value.parse()?,
                });
            }
        }
    }

    let base_digested = match base_any {
        AnyRef::Digested(d) => d,
        AnyRef::Tagged(t) => t.with_digest(base_pulled.manifest_digest.clone()),
    };

    Ok(Project {
        base: ProjectChunk {
            name: "base".to_string(),
            prebuilt: Some(base_digested),
            ..Default::default()
        },
        chunks,
        config: ResolvedProjectConfig {
            combinations: Vec::new(),
            env_vars,
        },
    })
}
