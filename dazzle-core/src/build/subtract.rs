//! Base-layer subtraction.
//!
//! Transforms a freshly built *full* chunk image into the *chunked* image:
//! the prefix of layers, diff-IDs and history entries identical to the base
//! image is stripped, the config and manifest are rewritten and re-digested,
//! and the result is pushed under the chunked tag. The rewritten manifest is
//! annotated with the base reference so combinations can later verify chunk
//! compatibility without a project directory.

use crate::error::{DazzleError, Result};
use crate::reference::{DigestedRef, TaggedRef};
use crate::registry::{
    canonical_json, content_digest, new_descriptor, pull_image, BlobContent, PushOptions,
    Registry, ANNOTATION_BASE_REF, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_LAYER_GZIP,
};
use oci_client::manifest::OciImageManifest;
use oci_spec::image::ImageConfiguration;
use tracing::{debug, info, instrument};

pub struct SubtractInput<'a> {
    pub base_ref: &'a DigestedRef,
    pub base_manifest: &'a OciImageManifest,
    pub base_config: &'a ImageConfiguration,
    /// The full chunk image as produced by the solver.
    pub full_ref: &'a DigestedRef,
    /// Where the chunked image is pushed.
    pub dest: &'a TaggedRef,
}

/// Remove the base layers from the full chunk image at `input.full_ref` and
/// push the result to `input.dest`. Returns the chunked manifest and whether
/// anything was actually pushed (`false` when an identical chunked image
/// already exists).
#[instrument(skip_all, fields(full = %input.full_ref, dest = %input.dest))]
pub async fn remove_base_layers(
    registry: &dyn Registry,
    input: SubtractInput<'_>,
) -> Result<(OciImageManifest, bool)> {
    let (full_manifest, _, full_config) =
        pull_image(registry, &input.full_ref.to_oci()).await?;

    let (chunked_manifest, config_bytes) = subtract_metadata(
        input.base_manifest,
        input.base_config,
        &full_manifest,
        &full_config,
        &input.base_ref.to_string(),
    )?;

    // A previous run may have pushed the identical chunked image already;
    // the config digest identifies it.
    match pull_image(registry, &input.dest.to_oci()).await {
        Ok((existing, _, _)) if existing.config.digest == chunked_manifest.config.digest => {
            debug!("chunked image is up to date");
            return Ok((existing, false));
        }
        Ok(_) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    info!(dest = %input.dest, "pushing chunked image");
    for (step, layer) in chunked_manifest.layers.iter().enumerate() {
        debug!(layer = %layer.digest, step, "copying layer");
        registry
            .copy_blob(&input.full_ref.to_oci(), &input.dest.to_oci(), layer)
            .await?;
    }

    match registry
        .push(
            &input.dest.to_oci(),
            PushOptions {
                config: Some(BlobContent {
                    data: config_bytes,
                    media_type: MEDIA_TYPE_IMAGE_CONFIG.to_string(),
                }),
                manifest: Some(chunked_manifest.clone()),
            },
        )
        .await
    {
        Ok(_) => {}
        Err(e) if e.is_already_exists() => {}
        Err(e) => return Err(e),
    }

    Ok((chunked_manifest, true))
}

/// Pure metadata transformation: verify the base prefix and produce the
/// rewritten (manifest, serialized config) pair.
pub(crate) fn subtract_metadata(
    base_manifest: &OciImageManifest,
    base_config: &ImageConfiguration,
    full_manifest: &OciImageManifest,
    full_config: &ImageConfiguration,
    base_ref: &str,
) -> Result<(OciImageManifest, Vec<u8>)> {
    let base_layers = &base_manifest.layers;
    let base_diff_ids = base_config.rootfs().diff_ids();
    let full_diff_ids = full_config.rootfs().diff_ids();

    for i in 0..base_layers.len() {
        let Some(chunk_layer) = full_manifest.layers.get(i) else {
            return Err(DazzleError::NotBuiltFromBase {
                index: i,
                base_digest: base_layers[i].digest.clone(),
                chunk_digest: "(missing layer)".to_string(),
            });
        };
        if base_layers[i].digest != chunk_layer.digest {
            return Err(DazzleError::NotBuiltFromBase {
                index: i,
                base_digest: base_layers[i].digest.clone(),
                chunk_digest: chunk_layer.digest.clone(),
            });
        }
    }
    for i in 0..base_diff_ids.len() {
        let Some(chunk_diff) = full_diff_ids.get(i) else {
            return Err(DazzleError::NotBuiltFromBase {
                index: i,
                base_digest: base_diff_ids[i].clone(),
                chunk_digest: "(missing diff id)".to_string(),
            });
        };
        if &base_diff_ids[i] != chunk_diff {
            return Err(DazzleError::NotBuiltFromBase {
                index: i,
                base_digest: base_diff_ids[i].clone(),
                chunk_digest: chunk_diff.clone(),
            });
        }
    }

    let diff_prefix = base_diff_ids.len();
    let history_prefix = base_config.history().len();
    if full_config.history().len() < history_prefix {
        return Err(DazzleError::MalformedConfig {
            reference: base_ref.to_string(),
            source: "full image has fewer history entries than the base".into(),
        });
    }

    let mut chunk_config = full_config.clone();
    chunk_config
        .rootfs_mut()
        .set_diff_ids(full_diff_ids[diff_prefix..].to_vec());
    chunk_config.set_history(full_config.history()[history_prefix..].to_vec());

    let config_bytes = canonical_json(&chunk_config)?;
    let config_descriptor = new_descriptor(
        MEDIA_TYPE_IMAGE_CONFIG,
        config_bytes.len() as i64,
        &content_digest(&config_bytes),
    )?;

    let mut chunk_manifest = full_manifest.clone();
    chunk_manifest.config = config_descriptor;
    chunk_manifest.layers = full_manifest.layers[base_layers.len()..].to_vec();
    for layer in &mut chunk_manifest.layers {
        layer.media_type = MEDIA_TYPE_LAYER_GZIP.to_string();
    }
    chunk_manifest
        .annotations
        .get_or_insert_with(Default::default)
        .insert(ANNOTATION_BASE_REF.to_string(), base_ref.to_string());

    Ok((chunk_manifest, config_bytes))
}
