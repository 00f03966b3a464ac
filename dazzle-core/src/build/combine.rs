//! Chunk combination.
//!
//! Combines previously built chunks into a single runnable image while
//! maintaining layer identity: the combined manifest concatenates the base
//! and chunk layer lists verbatim, the combined config concatenates diff-IDs
//! and history, and the container configuration is synthesized from the base
//! with env vars merged according to the project's combination policies.
//! No build step runs; combining is pure manifest surgery plus pushes.

use crate::build::chunk_image_name;
use crate::build::session::BuildSession;
use crate::build::ChunkImageType;
use crate::error::{DazzleError, Result};
use crate::project::{EnvVarAction, EnvVarCombination, Project, ProjectChunk};
use crate::reference::TaggedRef;
use crate::registry::{
    canonical_json, content_digest, new_descriptor, pull_image, BlobContent, PushOptions,
    Reference, MEDIA_TYPE_IMAGE_CONFIG,
};
use crate::test::container::ContainerExecutor;
use crate::test::run_suite;
use chrono::{DateTime, SecondsFormat, Utc};
use oci_client::manifest::{OciDescriptor, OciImageManifest};
use oci_spec::image::{ConfigBuilder, ImageConfiguration, ImageConfigurationBuilder, RootFsBuilder};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

/// Options for a combine run.
#[derive(Debug, Clone, Default)]
pub struct CombineOptions {
    /// Run each picked chunk's tests against the combined image.
    pub run_tests: bool,
}

impl CombineOptions {
    pub fn with_tests(run_tests: bool) -> Self {
        Self { run_tests }
    }
}

impl Project {
    /// Combine a pick of previously built chunks into a single image at
    /// `dest`, maintaining layer identity.
    ///
    /// When tests are requested, the combination is first written to a
    /// temporary tag and tested there, so a broken combination never
    /// overwrites the destination tag.
    #[instrument(skip(self, session, opts), fields(dest = %dest))]
    pub async fn combine(
        &self,
        chunks: &[String],
        dest: &TaggedRef,
        session: &BuildSession,
        opts: CombineOptions,
    ) -> Result<()> {
        if opts.run_tests {
            let temp_tag = format!("temp{}", Utc::now().timestamp());
            let temp_dest = dest.name().with_tag(&temp_tag)?;
            info!(temp = %temp_dest, "combining and testing under a temporary tag");
            self.combine_once(chunks, &temp_dest, session, true).await?;
        }
        self.combine_once(chunks, dest, session, false).await
    }

    /// One combination pass; the public entry point runs this twice when
    /// tests are requested.
    async fn combine_once(
        &self,
        chunks: &[String],
        dest: &TaggedRef,
        session: &BuildSession,
        run_tests: bool,
    ) -> Result<()> {
        let picked: Vec<&ProjectChunk> = chunks
            .iter()
            .map(|name| self.find_chunk(name))
            .collect::<Result<_>>()?;

        let (base_ref, base_manifest, base_config) = session.base_metadata()?;

        let mut chunk_manifests = Vec::with_capacity(picked.len());
        let mut chunk_configs = Vec::with_capacity(picked.len());
        let mut layer_sources: Vec<(Reference, OciDescriptor)> = Vec::new();
        for layer in &base_manifest.layers {
            layer_sources.push((base_ref.to_oci(), layer.clone()));
        }

        for chunk in &picked {
            let reference = match &chunk.prebuilt {
                Some(prebuilt) => prebuilt.to_oci(),
                None => chunk_image_name(chunk, ChunkImageType::Chunked, session)?.to_oci(),
            };
            info!(reference = %reference, "pulling chunk metadata");
            let (manifest, _, config) =
                pull_image(session.registry.as_ref(), &reference).await?;
            for layer in &manifest.layers {
                layer_sources.push((reference.clone(), layer.clone()));
            }
            chunk_manifests.push(manifest);
            chunk_configs.push(config);
        }

        let (manifest, config_bytes) = assemble_combined(
            base_manifest,
            base_config,
            &chunk_manifests,
            &chunk_configs,
            &self.config.env_vars,
            Utc::now(),
        )?;

        // Blobs must exist in the destination repository before the manifest
        // referencing them is committed.
        for (source, descriptor) in &layer_sources {
            session
                .registry
                .copy_blob(source, &dest.to_oci(), descriptor)
                .await?;
        }

        info!(dest = %dest, "pushing combined image");
        match session
            .registry
            .push(
                &dest.to_oci(),
                PushOptions {
                    config: Some(BlobContent {
                        data: config_bytes,
                        media_type: MEDIA_TYPE_IMAGE_CONFIG.to_string(),
                    }),
                    manifest: Some(manifest),
                },
            )
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }

        if run_tests {
            for chunk in &picked {
                if chunk.tests.is_empty() {
                    continue;
                }
                info!(chunk = %chunk.name, "running chunk tests against the combined image");
                let executor = ContainerExecutor::new(
                    session.solver.clone(),
                    dest.to_string(),
                    session.cancellation_token(),
                );
                let suite = run_suite(&executor, &chunk.tests).await;
                if !suite.success {
                    if let Ok(report) = serde_yaml::to_string(&suite) {
                        warn!(chunk = %chunk.name, "test report:\n{report}");
                    }
                    return Err(DazzleError::TestsFailed {
                        chunk: chunk.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Pure combination step: produce the combined manifest and serialized
/// config. `created` is a parameter so tests can freeze it; combining is
/// otherwise deterministic in its inputs.
pub(crate) fn assemble_combined(
    base_manifest: &OciImageManifest,
    base_config: &ImageConfiguration,
    chunk_manifests: &[OciImageManifest],
    chunk_configs: &[ImageConfiguration],
    env_policies: &[EnvVarCombination],
    created: DateTime<Utc>,
) -> Result<(OciImageManifest, Vec<u8>)> {
    let mut layers = base_manifest.layers.clone();
    let mut diff_ids = base_config.rootfs().diff_ids().clone();
    let mut history = base_config.history().clone();
    for (manifest, config) in chunk_manifests.iter().zip(chunk_configs) {
        layers.extend(manifest.layers.iter().cloned());
        diff_ids.extend(config.rootfs().diff_ids().iter().cloned());
        history.extend(config.history().iter().cloned());
    }

    let env = merge_env(base_config, chunk_configs, env_policies)?;
    let exposed_ports = merge_exposed_ports(base_config, chunk_configs);

    let mut container = ConfigBuilder::default();
    container = container.env(env);
    if !exposed_ports.is_empty() {
        container = container.exposed_ports(exposed_ports);
    }
    if let Some(base) = base_config.config() {
        if let Some(entrypoint) = base.entrypoint() {
            container = container.entrypoint(entrypoint.clone());
        }
        if let Some(cmd) = base.cmd() {
            container = container.cmd(cmd.clone());
        }
        if let Some(working_dir) = base.working_dir() {
            container = container.working_dir(working_dir.clone());
        }
        if let Some(stop_signal) = base.stop_signal() {
            container = container.stop_signal(stop_signal.clone());
        }
        if let Some(user) = base.user() {
            container = container.user(user.clone());
        }
    }
    let container = container
        .build()
        .map_err(|e| DazzleError::Internal(format!("cannot build container config: {e}")))?;

    let mut rootfs = RootFsBuilder::default();
    rootfs = rootfs.typ(base_config.rootfs().typ().clone());
    rootfs = rootfs.diff_ids(diff_ids);
    let rootfs = rootfs
        .build()
        .map_err(|e| DazzleError::Internal(format!("cannot build rootfs: {e}")))?;

    let mut config = ImageConfigurationBuilder::default();
    config = config.created(created.to_rfc3339_opts(SecondsFormat::Nanos, true));
    config = config.architecture(base_config.architecture().clone());
    config = config.os(base_config.os().clone());
    config = config.config(container);
    config = config.rootfs(rootfs);
    config = config.history(history);
    let config = config
        .build()
        .map_err(|e| DazzleError::Internal(format!("cannot build image config: {e}")))?;

    let config_bytes = canonical_json(&config)?;
    let config_descriptor = new_descriptor(
        MEDIA_TYPE_IMAGE_CONFIG,
        config_bytes.len() as i64,
        &content_digest(&config_bytes),
    )?;
    debug!(config = %String::from_utf8_lossy(&config_bytes), "produced combined config");

    let mut manifest = base_manifest.clone();
    manifest.config = config_descriptor;
    manifest.layers = layers;
    merge_annotations(&mut manifest, chunk_manifests);

    Ok((manifest, config_bytes))
}

/// Fold the chunks' annotations into the combined manifest (which starts
/// with the base's). Earlier writers win, the base first.
fn merge_annotations(manifest: &mut OciImageManifest, chunks: &[OciImageManifest]) {
    for chunk in chunks {
        if let Some(annotations) = &chunk.annotations {
            let merged = manifest.annotations.get_or_insert_with(Default::default);
            for (key, value) in annotations {
                merged.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }
}

/// Union of exposed ports across base and chunks, base values first.
fn merge_exposed_ports(
    base: &ImageConfiguration,
    chunks: &[ImageConfiguration],
) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    let sources = std::iter::once(base).chain(chunks.iter());
    for config in sources {
        if let Some(container) = config.config() {
            if let Some(ports) = container.exposed_ports() {
                for port in ports {
                    if seen.insert(port.clone()) {
                        merged.push(port.clone());
                    }
                }
            }
        }
    }
    merged
}

/// Merge `NAME=VALUE` env lists according to the per-name combination
/// policies. Names absent from the policy map use the `merge` action. The
/// output is sorted by name so combining stays deterministic.
pub(crate) fn merge_env(
    base: &ImageConfiguration,
    chunks: &[ImageConfiguration],
    policies: &[EnvVarCombination],
) -> Result<Vec<String>> {
    // values per name: (contributed by a chunk, value), in base..chunk order
    let mut values: BTreeMap<String, Vec<(bool, String)>> = BTreeMap::new();
    let mut collect = |config: &ImageConfiguration, from_chunk: bool| -> Result<()> {
        let Some(container) = config.config() else {
            return Ok(());
        };
        let Some(env) = container.env() else {
            return Ok(());
        };
        for entry in env {
            let fields: Vec<&str> = entry.split('=').collect();
            if fields.len() != 2 {
                return Err(DazzleError::MalformedEnv {
                    entry: entry.clone(),
                });
            }
            values
                .entry(fields[0].to_string())
                .or_default()
                .push((from_chunk, fields[1].to_string()));
        }
        Ok(())
    };
    collect(base, false)?;
    for chunk in chunks {
        collect(chunk, true)?;
    }

    let mut result = Vec::with_capacity(values.len());
    for (name, contributions) in values {
        let action = policies
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.action)
            .unwrap_or(EnvVarAction::Merge);

        let merged = match action {
            EnvVarAction::Merge => contributions
                .iter()
                .map(|(_, v)| v.as_str())
                .collect::<Vec<_>>()
                .join(":"),
            EnvVarAction::MergeUnique => {
                let mut seen = std::collections::HashSet::new();
                let mut segments = Vec::new();
                for (_, value) in &contributions {
                    for segment in value.split(':') {
                        if seen.insert(segment.to_string()) {
                            segments.push(segment);
                        }
                    }
                }
                segments.join(":")
            }
            EnvVarAction::UseLast => contributions
                .iter()
                .rev()
                .find(|(from_chunk, _)| *from_chunk)
                .or_else(|| contributions.first())
                .map(|(_, v)| v.clone())
                .unwrap_or_default(),
            EnvVarAction::UseFirst => contributions
                .first()
                .map(|(_, v)| v.clone())
                .unwrap_or_default(),
        };
        result.push(format!("{name}={merged}"));
    }
    Ok(result)
}
