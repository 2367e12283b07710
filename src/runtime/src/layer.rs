//! Layer chain for image building.
//!
//! Each build step turns the previous layer's rootfs into a new one. The
//! chain keeps every snapshot, indexed by step position, together with the
//! diff against its parent encoded as a deterministic tar layer.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::sync::Arc;

use a3s_bake_core::error::{BakeError, Result};
use sha2::{Digest, Sha256};

use crate::rootfs::{file_name, normalize, parent_of, Node, Rootfs};

/// Prefix of whiteout entries marking deleted paths.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Whiteout entry hiding every lower-layer entry of its directory.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Paths changed between two snapshots, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl LayerDiff {
    /// Compute the diff between `before` and `after`.
    pub fn between(before: &Rootfs, after: &Rootfs) -> Self {
        let mut diff = LayerDiff::default();

        for (path, node) in after.iter() {
            match before.get(path) {
                None => diff.added.push(path.clone()),
                Some(old) if !old.same_as(node) => diff.modified.push(path.clone()),
                Some(_) => {}
            }
        }

        for (path, _) in before.iter() {
            if after.get(path).is_none() {
                diff.removed.push(path.clone());
            }
        }

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Added and modified paths, sorted.
    pub fn changed(&self) -> Vec<&str> {
        let mut changed: Vec<&str> = self
            .added
            .iter()
            .chain(self.modified.iter())
            .map(String::as_str)
            .collect();
        changed.sort_unstable();
        changed
    }

    /// Topmost removed paths; descendants of a removed directory are implied.
    pub fn removed_roots(&self) -> Vec<&str> {
        let removed: BTreeSet<&str> = self.removed.iter().map(String::as_str).collect();
        removed
            .iter()
            .copied()
            .filter(|path| {
                let mut parent = parent_of(path);
                while parent != "/" {
                    if removed.contains(parent) {
                        return false;
                    }
                    parent = parent_of(parent);
                }
                true
            })
            .collect()
    }
}

/// One immutable layer of the image.
#[derive(Debug, Clone)]
pub struct ImageLayer {
    /// Position in the chain (0-based, equals the step index)
    pub index: usize,
    /// Step that produced this layer
    pub created_by: String,
    /// Complete filesystem after the step
    pub rootfs: Arc<Rootfs>,
    /// Changes relative to the parent layer
    pub diff: LayerDiff,
    /// SHA256 of the uncompressed tar (empty for metadata-only layers)
    pub diff_id: String,
    /// SHA256 of the compressed blob (empty for metadata-only layers)
    pub digest: String,
    /// OCI chain ID over all non-empty layers up to this one
    pub chain_id: String,
    /// Compressed blob size in bytes
    pub size: u64,
    blob: Arc<Vec<u8>>,
}

impl ImageLayer {
    /// Whether the step changed no files.
    pub fn is_empty(&self) -> bool {
        self.diff.is_empty()
    }

    /// Compressed tar.gz blob of the diff.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Get the digest with "sha256:" prefix.
    pub fn prefixed_digest(&self) -> String {
        format!("sha256:{}", self.digest)
    }

    pub fn prefixed_diff_id(&self) -> String {
        format!("sha256:{}", self.diff_id)
    }
}

/// Append-only chain of layers, one per build step.
#[derive(Debug, Clone, Default)]
pub struct LayerChain {
    layers: Vec<ImageLayer>,
}

impl LayerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filesystem of the newest layer (empty before the first push).
    pub fn rootfs(&self) -> Arc<Rootfs> {
        self.layers
            .last()
            .map(|l| l.rootfs.clone())
            .unwrap_or_default()
    }

    /// Append the layer produced by one step.
    pub fn push(&mut self, created_by: impl Into<String>, rootfs: Rootfs) -> Result<&ImageLayer> {
        let parent = self.rootfs();
        let diff = LayerDiff::between(&parent, &rootfs);
        let parent_chain = self.chain_id().to_string();

        let (diff_id, digest, blob, chain_id) = if diff.is_empty() {
            (String::new(), String::new(), Vec::new(), parent_chain)
        } else {
            let tar = encode_diff(&rootfs, &diff)
                .map_err(|e| BakeError::Export(format!("Failed to encode layer: {}", e)))?;
            let diff_id = sha256_bytes(&tar);
            let blob = gzip(&tar)
                .map_err(|e| BakeError::Export(format!("Failed to compress layer: {}", e)))?;
            let digest = sha256_bytes(&blob);
            let chain_id = if parent_chain.is_empty() {
                diff_id.clone()
            } else {
                sha256_bytes(format!("sha256:{} sha256:{}", parent_chain, diff_id).as_bytes())
            };
            (diff_id, digest, blob, chain_id)
        };

        let layer = ImageLayer {
            index: self.layers.len(),
            created_by: created_by.into(),
            rootfs: Arc::new(rootfs),
            diff,
            diff_id,
            digest,
            chain_id,
            size: blob.len() as u64,
            blob: Arc::new(blob),
        };

        tracing::debug!(
            index = layer.index,
            created_by = %layer.created_by,
            added = layer.diff.added.len(),
            modified = layer.diff.modified.len(),
            removed = layer.diff.removed.len(),
            size = layer.size,
            "Layer created"
        );

        self.layers.push(layer);
        Ok(&self.layers[self.layers.len() - 1])
    }

    /// Chain ID of the newest layer (empty when no files were ever added).
    pub fn chain_id(&self) -> &str {
        self.layers.last().map(|l| l.chain_id.as_str()).unwrap_or("")
    }

    pub fn top(&self) -> Option<&ImageLayer> {
        self.layers.last()
    }

    pub fn get(&self, index: usize) -> Option<&ImageLayer> {
        self.layers.get(index)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageLayer> {
        self.layers.iter()
    }

    /// Layers that carry a blob.
    pub fn non_empty(&self) -> impl Iterator<Item = &ImageLayer> {
        self.layers.iter().filter(|l| !l.is_empty())
    }
}

/// Encode a diff as an uncompressed tar with fixed ownership and mtime.
pub fn encode_diff(rootfs: &Rootfs, diff: &LayerDiff) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    for path in diff.changed() {
        let Some(node) = rootfs.get(path) else {
            continue;
        };
        let name = path.trim_start_matches('/');
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        match node {
            Node::Dir { mode } => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(*mode);
                header.set_size(0);
                builder.append_data(&mut header, format!("{}/", name), std::io::empty())?;
            }
            Node::File { data, mode } => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(*mode);
                header.set_size(data.len() as u64);
                builder.append_data(&mut header, name, data.as_slice())?;
            }
            Node::Symlink { target } => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                builder.append_link(&mut header, name, target)?;
            }
        }
    }

    for path in diff.removed_roots() {
        let parent = parent_of(path).trim_start_matches('/');
        let whiteout = if parent.is_empty() {
            format!("{}{}", WHITEOUT_PREFIX, file_name(path))
        } else {
            format!("{}/{}{}", parent, WHITEOUT_PREFIX, file_name(path))
        };
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mtime(0);
        header.set_mode(0o644);
        header.set_size(0);
        builder.append_data(&mut header, whiteout, std::io::empty())?;
    }

    builder.into_inner()
}

/// Gzip-compress a layer tar.
pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Apply an uncompressed layer tar on top of `rootfs`, honouring whiteouts.
pub fn apply_layer_tar<R: Read>(rootfs: &mut Rootfs, reader: R) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(reader);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = normalize(&entry.path()?.to_string_lossy());
        let name = file_name(&path);

        if name == OPAQUE_WHITEOUT {
            rootfs.clear_dir(parent_of(&path));
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            let parent = parent_of(&path);
            let target = if parent == "/" {
                format!("/{}", hidden)
            } else {
                format!("{}/{}", parent, hidden)
            };
            rootfs.remove(&target);
            continue;
        }

        let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
        let node = match entry.header().entry_type() {
            tar::EntryType::Directory => Node::Dir { mode },
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .map(|t| t.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Node::Symlink { target }
            }
            tar::EntryType::Link => {
                let source = entry
                    .link_name()?
                    .map(|t| normalize(&t.to_string_lossy()))
                    .unwrap_or_default();
                match rootfs.get(&source) {
                    Some(node) => node.clone(),
                    None => continue,
                }
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut data)?;
                Node::File {
                    data: Arc::new(data),
                    mode,
                }
            }
            // Device nodes and FIFOs have no meaning in an image snapshot.
            _ => continue,
        };

        rootfs
            .insert(&path, node)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    }

    Ok(())
}

/// Apply a gzip-compressed layer blob on top of `rootfs`.
pub fn apply_layer_blob(rootfs: &mut Rootfs, blob: &[u8]) -> std::io::Result<()> {
    apply_layer_tar(rootfs, flate2::read::GzDecoder::new(blob))
}

/// Compute SHA256 hex digest of bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
