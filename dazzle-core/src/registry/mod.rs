//! Registry port.
//!
//! A narrow interface over the OCI distribution protocol: resolve a manifest
//! digest, pull a manifest plus its config blob, push a (config, manifest)
//! pair, and copy a blob between repositories. Everything else - tags,
//! naming, idempotence policy - lives with the callers.
//!
//! Manifest pushes upload locally serialized canonical JSON so the digests
//! recorded by the build engine always match the bytes the registry stores.

use crate::error::{DazzleError, Result};
use async_trait::async_trait;
use docker_credential::{CredentialRetrievalError, DockerCredential};
use oci_client::client::{Client, ClientConfig};
use oci_client::errors::OciDistributionError;
use oci_client::manifest::{OciDescriptor, OciImageManifest, OciManifest};
use oci_client::secrets::RegistryAuth;
use oci_client::RegistryOperation;
use oci_spec::image::ImageConfiguration;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

pub use oci_client::Reference;

/// Media type of the test-result artifact config blob.
pub const MEDIA_TYPE_TEST_RESULT: &str = "application/vnd.gitpod.dazzle.tests.v1+json";

pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Manifest annotation naming the base image a chunked image was built from.
pub const ANNOTATION_BASE_REF: &str = "dazzle.gitpod.io/base-ref";

/// Prefix of the base-manifest annotations that carry env var combination
/// policies, `dazzle.gitpod.io/env-<NAME> = <action>`.
pub const ANNOTATION_ENV_PREFIX: &str = "dazzle.gitpod.io/env-";

const MANIFEST_ACCEPT: &[&str] = &[MEDIA_TYPE_IMAGE_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST];

/// Persistent record that a chunk's tests passed for a given fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTestResult {
    pub passed: bool,
}

/// A config blob to push alongside a manifest.
#[derive(Debug, Clone)]
pub struct BlobContent {
    pub data: Vec<u8>,
    pub media_type: String,
}

/// What [`Registry::push`] uploads. When `manifest` is absent, a minimal
/// schema-version-2 manifest referencing only the config is synthesized;
/// when `config` is absent, the manifest must reference blobs that already
/// exist in the repository.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub config: Option<BlobContent>,
    pub manifest: Option<OciImageManifest>,
}

/// Result of pulling a manifest plus its config blob. The config stays raw;
/// callers deserialize it into an image configuration or a typed artifact.
#[derive(Debug, Clone)]
pub struct PulledImage {
    pub manifest: OciImageManifest,
    pub manifest_digest: String,
    pub config: Vec<u8>,
}

/// Narrow registry interface used by the build engine.
#[async_trait]
pub trait Registry: Send + Sync {
    /// HEAD the manifest at `reference`, returning its digest.
    async fn resolve(&self, reference: &Reference) -> Result<String>;

    /// Fetch the manifest and its config blob.
    async fn pull(&self, reference: &Reference) -> Result<PulledImage>;

    /// Upload a (config, manifest) pair; returns the manifest digest.
    /// Duplicate pushes are success.
    async fn push(&self, reference: &Reference, opts: PushOptions) -> Result<String>;

    /// Copy a blob between repositories. Must complete before a manifest
    /// referencing the blob is pushed to `to`'s repository.
    async fn copy_blob(
        &self,
        from: &Reference,
        to: &Reference,
        descriptor: &OciDescriptor,
    ) -> Result<()>;
}

/// Serialize to canonical JSON. Round-tripping through `serde_json::Value`
/// orders all object keys, making re-encoded documents byte-stable - the
/// config digest embedded in manifests depends on this.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)
        .map_err(|e| DazzleError::Internal(format!("cannot serialize document: {e}")))?;
    serde_json::to_vec(&value)
        .map_err(|e| DazzleError::Internal(format!("cannot serialize document: {e}")))
}

/// SHA-256 content digest in OCI notation.
pub fn content_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", const_hex::encode(Sha256::digest(bytes)))
}

/// Build an [`OciDescriptor`] from its wire fields.
pub fn new_descriptor(media_type: &str, size: i64, digest: &str) -> Result<OciDescriptor> {
    serde_json::from_value(serde_json::json!({
        "mediaType": media_type,
        "size": size,
        "digest": digest,
    }))
    .map_err(|e| DazzleError::Internal(format!("cannot build descriptor: {e}")))
}

fn minimal_manifest(config: &OciDescriptor) -> Result<OciImageManifest> {
    serde_json::from_value(serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_IMAGE_MANIFEST,
        "config": config,
        "layers": [],
    }))
    .map_err(|e| DazzleError::Internal(format!("cannot build manifest: {e}")))
}

/// Registry implementation over the OCI distribution HTTP protocol.
pub struct OciRegistry {
    client: Client,
}

impl Default for OciRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OciRegistry {
    pub fn new() -> Self {
        Self {
            client: Client::new(ClientConfig::default()),
        }
    }

    fn auth_for(&self, reference: &Reference) -> RegistryAuth {
        credential_auth(reference.resolve_registry())
    }
}

/// Look up credentials for a registry host in the standard Docker credential
/// store; anonymous access when none are configured.
pub fn credential_auth(host: &str) -> RegistryAuth {
    let server = host.strip_suffix('/').unwrap_or(host);
    match docker_credential::get_credential(server) {
        Ok(DockerCredential::UsernamePassword(username, password)) => {
            debug!(host = %server, "using docker credentials");
            RegistryAuth::Basic(username, password)
        }
        Ok(DockerCredential::IdentityToken(_)) => {
            warn!(host = %server, "identity tokens are not supported, falling back to anonymous auth");
            RegistryAuth::Anonymous
        }
        Err(CredentialRetrievalError::HelperFailure { stdout, stderr, .. }) => {
            warn!(
                host = %server,
                detail = %[stdout.trim(), stderr.trim()].join(" - "),
                "credential helper failed, falling back to anonymous auth"
            );
            RegistryAuth::Anonymous
        }
        Err(e) => {
            debug!(host = %server, error = %e, "no credentials found, using anonymous auth");
            RegistryAuth::Anonymous
        }
    }
}

/// Plain username/secret pair for handing to the solver as a session
/// attachable.
pub fn credential_pair(host: &str) -> Option<(String, String)> {
    match credential_auth(host) {
        RegistryAuth::Basic(user, secret) => Some((user, secret)),
        _ => None,
    }
}

fn map_registry_error(reference: &Reference, err: OciDistributionError) -> DazzleError {
    match err {
        OciDistributionError::ImageManifestNotFoundError(_) => DazzleError::NotFound {
            reference: reference.whole(),
        },
        OciDistributionError::UnauthorizedError { .. } => DazzleError::Unauthorized {
            reference: reference.whole(),
        },
        other => {
            let reason = other.to_string();
            if reason.contains("MANIFEST_UNKNOWN")
                || reason.contains("NAME_UNKNOWN")
                || reason.contains("status code 404")
            {
                DazzleError::NotFound {
                    reference: reference.whole(),
                }
            } else if reason.contains("BLOB_UPLOAD_INVALID") && reason.contains("exists") {
                DazzleError::AlreadyExists {
                    reference: reference.whole(),
                }
            } else {
                DazzleError::Registry {
                    reference: reference.whole(),
                    reason,
                }
            }
        }
    }
}

#[async_trait]
impl Registry for OciRegistry {
    #[instrument(skip(self), fields(reference = %reference))]
    async fn resolve(&self, reference: &Reference) -> Result<String> {
        let auth = self.auth_for(reference);
        self.client
            .fetch_manifest_digest(reference, &auth)
            .await
            .map_err(|e| map_registry_error(reference, e))
    }

    #[instrument(skip(self), fields(reference = %reference))]
    async fn pull(&self, reference: &Reference) -> Result<PulledImage> {
        let auth = self.auth_for(reference);
        let (raw, manifest_digest) = self
            .client
            .pull_manifest_raw(reference, &auth, MANIFEST_ACCEPT)
            .await
            .map_err(|e| map_registry_error(reference, e))?;

        let manifest: OciManifest =
            serde_json::from_slice(&raw).map_err(|e| DazzleError::MalformedManifest {
                reference: reference.whole(),
                source: e,
            })?;
        let manifest = match manifest {
            OciManifest::Image(manifest) => manifest,
            OciManifest::ImageIndex(index) => {
                return Err(DazzleError::UnsupportedMediaType {
                    reference: reference.whole(),
                    media_type: index
                        .media_type
                        .unwrap_or_else(|| "image index".to_string()),
                });
            }
        };

        let mut config = Vec::new();
        self.client
            .pull_blob(reference, &manifest.config, &mut config)
            .await
            .map_err(|e| map_registry_error(reference, e))?;

        Ok(PulledImage {
            manifest,
            manifest_digest,
            config,
        })
    }

    #[instrument(skip(self, opts), fields(reference = %reference))]
    async fn push(&self, reference: &Reference, opts: PushOptions) -> Result<String> {
        let auth = self.auth_for(reference);
        self.client
            .auth(reference, &auth, RegistryOperation::Push)
            .await
            .map_err(|e| map_registry_error(reference, e))?;

        let config_descriptor = match &opts.config {
            Some(config) => {
                let digest = content_digest(&config.data);
                debug!(digest = %digest, "pushing config blob");
                self.client
                    .push_blob(reference, &config.data, &digest)
                    .await
                    .map_err(|e| map_registry_error(reference, e))?;
                Some(new_descriptor(
                    &config.media_type,
                    config.data.len() as i64,
                    &digest,
                )?)
            }
            None => None,
        };

        let manifest = match (opts.manifest, config_descriptor) {
            (Some(mut manifest), Some(descriptor)) => {
                manifest.config = descriptor;
                manifest
            }
            (Some(manifest), None) => manifest,
            (None, Some(descriptor)) => minimal_manifest(&descriptor)?,
            (None, None) => {
                return Err(DazzleError::Internal(
                    "push requires a config or a manifest".to_string(),
                ));
            }
        };

        let body = canonical_json(&manifest)?;
        let digest = content_digest(&body);
        let content_type = manifest
            .media_type
            .clone()
            .unwrap_or_else(|| MEDIA_TYPE_IMAGE_MANIFEST.to_string());
        let content_type: http::HeaderValue = content_type
            .parse()
            .map_err(|_| DazzleError::Internal("invalid manifest media type".to_string()))?;

        debug!(digest = %digest, "pushing manifest");
        self.client
            .push_manifest_raw(reference, body, content_type)
            .await
            .map_err(|e| map_registry_error(reference, e))?;

        Ok(digest)
    }

    #[instrument(skip(self, descriptor), fields(from = %from, to = %to, digest = %descriptor.digest))]
    async fn copy_blob(
        &self,
        from: &Reference,
        to: &Reference,
        descriptor: &OciDescriptor,
    ) -> Result<()> {
        if from.resolve_registry() == to.resolve_registry()
            && from.repository() == to.repository()
        {
            // Same repository, nothing to do.
            return Ok(());
        }

        let from_auth = self.auth_for(from);
        self.client
            .auth(from, &from_auth, RegistryOperation::Pull)
            .await
            .map_err(|e| map_registry_error(from, e))?;
        let mut data = Vec::new();
        self.client
            .pull_blob(from, descriptor, &mut data)
            .await
            .map_err(|e| map_registry_error(from, e))?;

        let to_auth = self.auth_for(to);
        self.client
            .auth(to, &to_auth, RegistryOperation::Push)
            .await
            .map_err(|e| map_registry_error(to, e))?;
        match self.client.push_blob(to, &data, &descriptor.digest).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let mapped = map_registry_error(to, e);
                if mapped.is_already_exists() {
                    Ok(())
                } else {
                    Err(mapped)
                }
            }
        }
    }
}

/// Pull a manifest and deserialize its config blob into `T`.
pub async fn pull_as<T: DeserializeOwned>(
    registry: &dyn Registry,
    reference: &Reference,
) -> Result<(OciImageManifest, String, T)> {
    let pulled = registry.pull(reference).await?;
    let config: T =
        serde_json::from_slice(&pulled.config).map_err(|e| DazzleError::MalformedConfig {
            reference: reference.whole(),
            source: e.into(),
        })?;
    Ok((pulled.manifest, pulled.manifest_digest, config))
}

/// Pull manifest and image configuration for a regular image.
pub async fn pull_image(
    registry: &dyn Registry,
    reference: &Reference,
) -> Result<(OciImageManifest, String, ImageConfiguration)> {
    pull_as::<ImageConfiguration>(registry, reference).await
}

/// Pull a stored test result artifact.
pub async fn pull_test_result(
    registry: &dyn Registry,
    reference: &Reference,
) -> Result<StoredTestResult> {
    let (_, _, result) = pull_as::<StoredTestResult>(registry, reference).await?;
    Ok(result)
}

/// Push a test result artifact at `reference`.
pub async fn push_test_result(
    registry: &dyn Registry,
    reference: &Reference,
    result: StoredTestResult,
) -> Result<String> {
    let data = serde_json::to_vec(&result)
        .map_err(|e| DazzleError::Internal(format!("cannot serialize test result: {e}")))?;
    registry
        .push(
            reference,
            PushOptions {
                config: Some(BlobContent {
                    data,
                    media_type: MEDIA_TYPE_TEST_RESULT.to_string(),
                }),
                manifest: None,
            },
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_digest_of_empty_input() {
        assert_eq!(
            content_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_canonical_json_orders_keys() {
        #[derive(Serialize)]
        struct Doc {
            zeta: u32,
            alpha: u32,
        }
        let bytes = canonical_json(&Doc { zeta: 1, alpha: 2 }).unwrap();
        assert_eq!(bytes, br#"{"alpha":2,"zeta":1}"#);
    }

    #[test]
    fn test_canonical_json_is_stable_for_maps() {
        let mut map = std::collections::HashMap::new();
        for key in ["b", "a", "z", "m"] {
            map.insert(key.to_string(), "v".to_string());
        }
        let first = canonical_json(&map).unwrap();
        for _ in 0..16 {
            assert_eq!(canonical_json(&map).unwrap(), first);
        }
        assert_eq!(first, br#"{"a":"v","b":"v","m":"v","z":"v"}"#);
    }

    #[test]
    fn test_minimal_manifest_shape() {
        let descriptor = new_descriptor(MEDIA_TYPE_TEST_RESULT, 16, "sha256:abc").unwrap();
        let manifest = minimal_manifest(&descriptor).unwrap();
        assert_eq!(manifest.schema_version, 2);
        assert!(manifest.layers.is_empty());
        assert_eq!(manifest.config.media_type, MEDIA_TYPE_TEST_RESULT);
        assert_eq!(manifest.config.size, 16);
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let descriptor =
            new_descriptor(MEDIA_TYPE_LAYER_GZIP, 1234, "sha256:0011").unwrap();
        assert_eq!(descriptor.media_type, MEDIA_TYPE_LAYER_GZIP);
        assert_eq!(descriptor.size, 1234);
        assert_eq!(descriptor.digest, "sha256:0011");
    }
}
