//! OCI image layout export.
//!
//! Writes a built image as an OCI image layout directory (`oci-layout`,
//! `index.json`, `blobs/sha256/*`) that container tooling can load.

use std::path::{Path, PathBuf};

use a3s_bake_core::error::{BakeError, Result};

use crate::layer::sha256_bytes;
use crate::pipeline::BuiltImage;

const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Result of an export.
#[derive(Debug, Clone)]
pub struct ExportedImage {
    pub path: PathBuf,
    /// Manifest digest with "sha256:" prefix
    pub manifest_digest: String,
    /// Config digest with "sha256:" prefix
    pub config_digest: String,
    pub layer_count: usize,
}

/// Write `image` as an OCI image layout under `output_dir`.
///
/// Metadata-only layers carry no blob; they appear in the history with
/// `empty_layer` set.
pub fn export_oci(image: &BuiltImage, output_dir: &Path) -> Result<ExportedImage> {
    let blobs_dir = output_dir.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs_dir)
        .map_err(|e| export_error("Failed to create blobs directory", e))?;

    let mut layer_descriptors = Vec::new();
    let mut diff_ids = Vec::new();
    for layer in image.layers.non_empty() {
        write_blob(&blobs_dir, &layer.digest, layer.blob())?;
        layer_descriptors.push(serde_json::json!({
            "mediaType": LAYER_MEDIA_TYPE,
            "digest": layer.prefixed_digest(),
            "size": layer.size
        }));
        diff_ids.push(layer.prefixed_diff_id());
    }

    let created = image.created.to_rfc3339();
    let runtime = &image.runtime_config;
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    let mut exposed = serde_json::Map::new();
    exposed.insert(
        format!("{}/tcp", runtime.listening_port),
        serde_json::json!({}),
    );
    let mut config_section = serde_json::json!({
        "ExposedPorts": exposed,
        "WorkingDir": runtime.working_directory,
        "Entrypoint": [runtime.entrypoint_command],
    });
    if !runtime.entrypoint_args.is_empty() {
        config_section["Cmd"] = serde_json::json!(runtime.entrypoint_args);
    }
    if !runtime.env.is_empty() {
        config_section["Env"] = serde_json::json!(runtime.env_list());
    }

    let history: Vec<serde_json::Value> = image
        .layers
        .iter()
        .map(|layer| {
            let mut entry = serde_json::json!({
                "created": created,
                "created_by": layer.created_by
            });
            if layer.is_empty() {
                entry["empty_layer"] = serde_json::json!(true);
            }
            entry
        })
        .collect();

    let config = serde_json::json!({
        "architecture": arch,
        "os": "linux",
        "created": created,
        "config": config_section,
        "rootfs": {
            "type": "layers",
            "diff_ids": diff_ids
        },
        "history": history
    });
    let config_bytes = serde_json::to_vec_pretty(&config)?;
    let config_digest = sha256_bytes(&config_bytes);
    write_blob(&blobs_dir, &config_digest, &config_bytes)?;

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_MEDIA_TYPE,
        "config": {
            "mediaType": CONFIG_MEDIA_TYPE,
            "digest": format!("sha256:{}", config_digest),
            "size": config_bytes.len()
        },
        "layers": layer_descriptors
    });
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
    let manifest_digest = sha256_bytes(&manifest_bytes);
    write_blob(&blobs_dir, &manifest_digest, &manifest_bytes)?;

    let mut manifest_entry = serde_json::json!({
        "mediaType": MANIFEST_MEDIA_TYPE,
        "digest": format!("sha256:{}", manifest_digest),
        "size": manifest_bytes.len()
    });
    if let Some(tag) = &image.tag {
        manifest_entry["annotations"] = serde_json::json!({
            "org.opencontainers.image.ref.name": tag
        });
    }
    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": INDEX_MEDIA_TYPE,
        "manifests": [manifest_entry]
    });
    std::fs::write(
        output_dir.join("index.json"),
        serde_json::to_string_pretty(&index)?,
    )
    .map_err(|e| export_error("Failed to write index.json", e))?;

    std::fs::write(
        output_dir.join("oci-layout"),
        r#"{"imageLayoutVersion":"1.0.0"}"#,
    )
    .map_err(|e| export_error("Failed to write oci-layout", e))?;

    tracing::info!(
        path = %output_dir.display(),
        manifest = %manifest_digest,
        layers = layer_descriptors.len(),
        "Image exported"
    );

    Ok(ExportedImage {
        path: output_dir.to_path_buf(),
        manifest_digest: format!("sha256:{}", manifest_digest),
        config_digest: format!("sha256:{}", config_digest),
        layer_count: layer_descriptors.len(),
    })
}

fn write_blob(blobs_dir: &Path, digest: &str, data: &[u8]) -> Result<()> {
    let path = blobs_dir.join(digest);
    if path.exists() {
        return Ok(());
    }
    std::fs::write(&path, data).map_err(|e| export_error(&format!("Failed to write blob {}", digest), e))
}

fn export_error(context: &str, err: std::io::Error) -> BakeError {
    BakeError::Export(format!("{}: {}", context, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::layer::{apply_layer_blob, LayerChain};
    use crate::rootfs::{Rootfs, DEFAULT_FILE_MODE};
    use a3s_bake_core::RuntimeConfig;
    use tempfile::TempDir;

    fn image() -> BuiltImage {
        let mut chain = LayerChain::new();
        let mut base = Rootfs::new();
        base.write_file("/ports.conf", "Listen 8080\n", DEFAULT_FILE_MODE).unwrap();
        chain.push("FROM base-os:20.04", base.clone()).unwrap();
        let mut app = base;
        app.write_file("/srv/www/index.php", "<?php", DEFAULT_FILE_MODE).unwrap();
        chain.push("COPY index.php /srv/www/index.php", app.clone()).unwrap();
        chain.push("EXPOSE 8080", app).unwrap();

        BuiltImage {
            build_id: "test".to_string(),
            tag: Some("php-app:latest".to_string()),
            base: "docker.io/library/base-os:20.04".to_string(),
            layers: chain,
            runtime_config: RuntimeConfig {
                listening_port: 8080,
                working_directory: "/srv/www".to_string(),
                entrypoint_command: "httpd-ctl".to_string(),
                entrypoint_args: vec!["-D".to_string(), "FOREGROUND".to_string()],
                env: BTreeMap::from([("TZ".to_string(), "UTC".to_string())]),
            },
            created: chrono::Utc::now(),
        }
    }

    fn read_json(path: &Path) -> serde_json::Value {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn test_export_layout() {
        let tmp = TempDir::new().unwrap();
        let image = image();
        let exported = export_oci(&image, tmp.path()).unwrap();
        assert_eq!(exported.layer_count, 2);
        assert!(tmp.path().join("oci-layout").exists());

        let index = read_json(&tmp.path().join("index.json"));
        assert_eq!(index["manifests"][0]["digest"], exported.manifest_digest);
        assert_eq!(
            index["manifests"][0]["annotations"]["org.opencontainers.image.ref.name"],
            "php-app:latest"
        );

        let blobs = tmp.path().join("blobs/sha256");
        let manifest = read_json(&blobs.join(exported.manifest_digest.trim_start_matches("sha256:")));
        assert_eq!(manifest["layers"].as_array().unwrap().len(), 2);
        assert_eq!(manifest["config"]["digest"], exported.config_digest);

        let config = read_json(&blobs.join(exported.config_digest.trim_start_matches("sha256:")));
        assert_eq!(config["config"]["WorkingDir"], "/srv/www");
        assert_eq!(config["config"]["Entrypoint"][0], "httpd-ctl");
        assert_eq!(config["config"]["Cmd"][1], "FOREGROUND");
        assert_eq!(config["config"]["Env"][0], "TZ=UTC");
        assert!(config["config"]["ExposedPorts"]["8080/tcp"].is_object());
        assert_eq!(config["rootfs"]["diff_ids"].as_array().unwrap().len(), 2);
        assert_eq!(config["history"].as_array().unwrap().len(), 3);
        assert_eq!(config["history"][2]["empty_layer"], true);
    }

    #[test]
    fn test_exported_layers_replay_to_final_rootfs() {
        let tmp = TempDir::new().unwrap();
        let image = image();
        export_oci(&image, tmp.path()).unwrap();

        let mut replayed = Rootfs::new();
        for layer in image.layers.non_empty() {
            let blob = std::fs::read(tmp.path().join("blobs/sha256").join(&layer.digest)).unwrap();
            apply_layer_blob(&mut replayed, &blob).unwrap();
        }
        assert_eq!(replayed, *image.rootfs());
    }
}
