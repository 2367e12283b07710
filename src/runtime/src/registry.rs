//! Base images pulled from OCI registries.
//!
//! Uses the `oci-distribution` crate to fetch the manifest and layer blobs
//! of the base image, then replays the layers in order into an in-memory
//! rootfs.

use a3s_bake_core::error::Result;
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::ImageIndexEntry;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};

use crate::layer::{apply_layer_blob, apply_layer_tar};
use crate::reference::ImageReference;
use crate::resolve::{resolution, BaseResolver};
use crate::rootfs::Rootfs;

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`, anonymous unless
    /// both are set.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() || self.password.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Resolves base images by pulling them from their registry.
pub struct RegistryResolver {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryResolver {
    pub fn new() -> Self {
        Self::with_auth(RegistryAuth::from_env())
    }

    pub fn with_auth(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }
}

impl Default for RegistryResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseResolver for RegistryResolver {
    async fn resolve(&self, reference: &ImageReference) -> Result<Rootfs> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();

        tracing::info!(reference = %reference, "Pulling base image from registry");

        let (manifest, manifest_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &auth)
            .await
            .map_err(|e| resolution(reference, &format!("failed to pull manifest: {}", e)))?;

        let mut rootfs = Rootfs::new();
        for layer in &manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "Pulling layer");

            let mut data: Vec<u8> = Vec::new();
            self.client
                .pull_blob(&oci_ref, layer, &mut data)
                .await
                .map_err(|e| {
                    resolution(
                        reference,
                        &format!("failed to pull layer {}: {}", layer.digest, e),
                    )
                })?;

            let applied = if layer.media_type.contains("gzip") {
                apply_layer_blob(&mut rootfs, &data)
            } else {
                apply_layer_tar(&mut rootfs, data.as_slice())
            };
            applied.map_err(|e| {
                resolution(
                    reference,
                    &format!("failed to unpack layer {}: {}", layer.digest, e),
                )
            })?;
        }

        tracing::info!(
            reference = %reference,
            digest = %manifest_digest,
            layers = manifest.layers.len(),
            entries = rootfs.len(),
            "Base image pulled"
        );

        Ok(rootfs)
    }
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = match (&reference.digest, &reference.tag) {
        (Some(digest), _) => format!("{}/{}@{}", reference.registry, reference.repository, digest),
        (None, Some(tag)) => format!("{}/{}:{}", reference.registry, reference.repository, tag),
        (None, None) => format!("{}/{}:latest", reference.registry, reference.repository),
    };

    ref_str
        .parse::<Reference>()
        .map_err(|e| resolution(reference, &format!("invalid OCI reference '{}': {}", ref_str, e)))
}

/// Pick the linux manifest matching the host architecture from an index.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
