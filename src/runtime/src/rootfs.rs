//! In-memory root filesystem.
//!
//! Every image layer owns a complete snapshot of the image filesystem. Paths
//! are normalized absolute strings (`/etc/apache2/ports.conf`); the root
//! directory itself is implicit. File contents are reference-counted so that
//! deriving the next layer from the previous one only copies the map.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

/// Default permission bits for regular files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Default permission bits for directories.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Symlink hops allowed while resolving one path.
const MAX_SYMLINK_HOPS: usize = 40;

/// Filesystem errors inside a rootfs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("too many levels of symbolic links: {0}")]
    SymlinkLoop(String),
}

/// A filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir { mode: u32 },
    File { data: Arc<Vec<u8>>, mode: u32 },
    Symlink { target: String },
}

impl Node {
    pub fn file(data: impl Into<Vec<u8>>) -> Self {
        Node::File {
            data: Arc::new(data.into()),
            mode: DEFAULT_FILE_MODE,
        }
    }

    pub fn dir() -> Self {
        Node::Dir {
            mode: DEFAULT_DIR_MODE,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Dir { .. })
    }

    /// Content size in bytes (0 for directories and symlinks).
    pub fn size(&self) -> u64 {
        match self {
            Node::File { data, .. } => data.len() as u64,
            _ => 0,
        }
    }

    /// Cheap equality: shared file contents are compared by pointer first.
    pub(crate) fn same_as(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::File { data: a, mode: ma }, Node::File { data: b, mode: mb }) => {
                ma == mb && (Arc::ptr_eq(a, b) || a == b)
            }
            _ => self == other,
        }
    }
}

/// Normalize a path into its absolute form. Relative paths are taken
/// relative to `/`; `..` never climbs above the root.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    join_components(&parts)
}

/// Resolve `path` against a working directory, like the `WORKDIR`-relative
/// paths of `COPY`.
pub fn resolve_path(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        normalize(path)
    } else {
        normalize(&format!("{}/{}", workdir, path))
    }
}

/// Parent directory of a normalized path (`/` for top-level entries).
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

/// Final component of a normalized path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn join_components<S: AsRef<str>>(parts: &[S]) -> String {
    if parts.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for part in parts {
        out.push('/');
        out.push_str(part.as_ref());
    }
    out
}

/// Complete filesystem snapshot of one image layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rootfs {
    entries: BTreeMap<String, Node>,
}

impl Rootfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.entries.iter()
    }

    /// Sum of all file sizes.
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(Node::size).sum()
    }

    /// Entry at `path` without following a final symlink.
    pub fn get(&self, path: &str) -> Option<&Node> {
        self.entries.get(&normalize(path))
    }

    /// Resolve every symlink along `path`.
    pub fn canonical(&self, path: &str) -> Result<String, FsError> {
        let mut pending: VecDeque<String> = normalize(path)
            .split('/')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        let mut resolved: Vec<String> = Vec::new();
        let mut hops = 0;

        while let Some(component) = pending.pop_front() {
            if component == ".." {
                resolved.pop();
                continue;
            }
            if component == "." {
                continue;
            }
            resolved.push(component);
            let current = join_components(&resolved);
            if let Some(Node::Symlink { target }) = self.entries.get(&current) {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(FsError::SymlinkLoop(normalize(path)));
                }
                resolved.pop();
                if target.starts_with('/') {
                    resolved.clear();
                }
                for part in target.split('/').filter(|c| !c.is_empty()).rev() {
                    pending.push_front(part.to_string());
                }
            }
        }

        Ok(join_components(&resolved))
    }

    pub fn exists(&self, path: &str) -> bool {
        match self.canonical(path) {
            Ok(p) => p == "/" || self.entries.contains_key(&p),
            Err(_) => false,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        match self.canonical(path) {
            Ok(p) => p == "/" || self.entries.get(&p).map_or(false, Node::is_dir),
            Err(_) => false,
        }
    }

    /// Contents of a regular file, following symlinks.
    pub fn read_file(&self, path: &str) -> Result<&[u8], FsError> {
        let canonical = self.canonical(path)?;
        match self.entries.get(&canonical) {
            Some(Node::File { data, .. }) => Ok(data.as_slice()),
            Some(_) => Err(FsError::IsADirectory(canonical)),
            None if canonical == "/" => Err(FsError::IsADirectory(canonical)),
            None => Err(FsError::NotFound(normalize(path))),
        }
    }

    /// Create `path` and any missing parents. Returns the canonical path.
    pub fn mkdir_p(&mut self, path: &str) -> Result<String, FsError> {
        let canonical = self.canonical(path)?;
        let parts: Vec<&str> = canonical.split('/').filter(|c| !c.is_empty()).collect();
        for end in 1..=parts.len() {
            let prefix = join_components(&parts[..end]);
            match self.entries.get(&prefix) {
                Some(Node::Dir { .. }) => {}
                Some(_) => return Err(FsError::NotADirectory(prefix)),
                None => {
                    self.entries.insert(prefix, Node::dir());
                }
            }
        }
        Ok(canonical)
    }

    /// Write a regular file, creating parent directories. An existing file
    /// (or the target of a symlink) is replaced.
    pub fn write_file(&mut self, path: &str, data: impl Into<Vec<u8>>, mode: u32) -> Result<(), FsError> {
        let canonical = self.canonical(path)?;
        if canonical == "/" {
            return Err(FsError::IsADirectory(canonical));
        }
        self.mkdir_p(parent_of(&canonical))?;
        if let Some(Node::Dir { .. }) = self.entries.get(&canonical) {
            return Err(FsError::IsADirectory(canonical));
        }
        self.entries.insert(
            canonical,
            Node::File {
                data: Arc::new(data.into()),
                mode,
            },
        );
        Ok(())
    }

    /// Place `node` at `path`, following symlinks in the parent only. A
    /// directory replaced by a non-directory loses its subtree.
    pub fn insert(&mut self, path: &str, node: Node) -> Result<(), FsError> {
        let normalized = normalize(path);
        if normalized == "/" {
            return Ok(());
        }
        let parent = self.mkdir_p(parent_of(&normalized))?;
        let key = if parent == "/" {
            format!("/{}", file_name(&normalized))
        } else {
            format!("{}/{}", parent, file_name(&normalized))
        };

        if let Some(existing) = self.entries.get(&key) {
            if existing.is_dir() && !node.is_dir() {
                self.remove(&key);
            }
        }
        self.entries.insert(key, node);
        Ok(())
    }

    /// Remove `path` and everything below it. Returns whether anything was
    /// removed.
    pub fn remove(&mut self, path: &str) -> bool {
        let normalized = normalize(path);
        let removed_children = self.clear_dir(&normalized);
        self.entries.remove(&normalized).is_some() || removed_children
    }

    /// Remove everything below `path`, keeping `path` itself.
    pub fn clear_dir(&mut self, path: &str) -> bool {
        let normalized = normalize(path);
        let prefix = if normalized == "/" {
            "/".to_string()
        } else {
            format!("{}/", normalized)
        };
        let doomed: Vec<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.entries.remove(key);
        }
        !doomed.is_empty()
    }

    /// Load a host directory tree as a rootfs.
    pub fn from_dir(root: &Path) -> std::io::Result<Self> {
        let mut rootfs = Rootfs::new();
        walk_dir(root, root, &mut rootfs)?;
        Ok(rootfs)
    }
}

/// Recursively walk a host directory and collect its entries.
fn walk_dir(root: &Path, current: &Path, rootfs: &mut Rootfs) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(current)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let key = normalize(&relative.to_string_lossy());
        let metadata = std::fs::symlink_metadata(&path)?;
        let mode = permission_bits(&metadata);

        if metadata.file_type().is_symlink() {
            let target = std::fs::read_link(&path)?;
            rootfs.entries.insert(
                key,
                Node::Symlink {
                    target: target.to_string_lossy().into_owned(),
                },
            );
        } else if metadata.is_dir() {
            rootfs.entries.insert(key, Node::Dir { mode });
            walk_dir(root, &path, rootfs)?;
        } else {
            let data = std::fs::read(&path)?;
            rootfs.entries.insert(
                key,
                Node::File {
                    data: Arc::new(data),
                    mode,
                },
            );
        }
    }

    Ok(())
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        DEFAULT_DIR_MODE
    } else {
        DEFAULT_FILE_MODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/etc/apache2/"), "/etc/apache2");
        assert_eq!(normalize("ports.conf"), "/ports.conf");
        assert_eq!(normalize("/a/./b/../c"), "/a/c");
        assert_eq!(normalize("/../../etc"), "/etc");
        assert_eq!(normalize(""), "/");
    }

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("/srv/www", "index.php"), "/srv/www/index.php");
        assert_eq!(resolve_path("/srv/www", "/etc/hosts"), "/etc/hosts");
        assert_eq!(resolve_path("/", "."), "/");
        assert_eq!(resolve_path("/srv/www", "../data"), "/srv/data");
    }

    #[test]
    fn test_parent_and_file_name() {
        assert_eq!(parent_of("/etc/apache2/ports.conf"), "/etc/apache2");
        assert_eq!(parent_of("/etc"), "/");
        assert_eq!(file_name("/etc/apache2/ports.conf"), "ports.conf");
    }

    #[test]
    fn test_write_creates_parents() {
        let mut fs = Rootfs::new();
        fs.write_file("/srv/www/index.php", "<?php", DEFAULT_FILE_MODE)
            .unwrap();
        assert!(fs.is_dir("/srv"));
        assert!(fs.is_dir("/srv/www"));
        assert_eq!(fs.read_file("/srv/www/index.php").unwrap(), b"<?php");
        assert_eq!(fs.len(), 3);
    }

    #[test]
    fn test_write_under_file_fails() {
        let mut fs = Rootfs::new();
        fs.write_file("/etc", "x", DEFAULT_FILE_MODE).unwrap();
        let err = fs.write_file("/etc/hosts", "y", DEFAULT_FILE_MODE).unwrap_err();
        assert_eq!(err, FsError::NotADirectory("/etc".to_string()));
    }

    #[test]
    fn test_write_over_directory_fails() {
        let mut fs = Rootfs::new();
        fs.mkdir_p("/etc/apache2").unwrap();
        let err = fs.write_file("/etc/apache2", "x", DEFAULT_FILE_MODE).unwrap_err();
        assert!(matches!(err, FsError::IsADirectory(_)));
    }

    #[test]
    fn test_read_missing() {
        let fs = Rootfs::new();
        assert_eq!(
            fs.read_file("/etc/hosts").unwrap_err(),
            FsError::NotFound("/etc/hosts".to_string())
        );
    }

    #[test]
    fn test_symlinked_directory_is_followed() {
        let mut fs = Rootfs::new();
        fs.mkdir_p("/usr/bin").unwrap();
        fs.insert(
            "/bin",
            Node::Symlink {
                target: "usr/bin".to_string(),
            },
        )
        .unwrap();
        fs.write_file("/bin/httpd-ctl", "#!/bin/sh", 0o755).unwrap();

        assert!(fs.get("/usr/bin/httpd-ctl").is_some());
        assert!(fs.get("/bin/httpd-ctl").is_none());
        assert_eq!(fs.read_file("/bin/httpd-ctl").unwrap(), b"#!/bin/sh");
    }

    #[test]
    fn test_symlinked_file_is_followed() {
        let mut fs = Rootfs::new();
        fs.write_file("/etc/apache2/sites-available/000-default.conf", "a", DEFAULT_FILE_MODE)
            .unwrap();
        fs.insert(
            "/etc/apache2/sites-enabled/000-default.conf",
            Node::Symlink {
                target: "../sites-available/000-default.conf".to_string(),
            },
        )
        .unwrap();
        assert_eq!(
            fs.canonical("/etc/apache2/sites-enabled/000-default.conf").unwrap(),
            "/etc/apache2/sites-available/000-default.conf"
        );
    }

    #[test]
    fn test_symlink_loop_detected() {
        let mut fs = Rootfs::new();
        fs.insert("/a", Node::Symlink { target: "/b".to_string() }).unwrap();
        fs.insert("/b", Node::Symlink { target: "/a".to_string() }).unwrap();
        assert!(matches!(fs.canonical("/a/x"), Err(FsError::SymlinkLoop(_))));
        assert!(!fs.exists("/a"));
    }

    #[test]
    fn test_remove_subtree() {
        let mut fs = Rootfs::new();
        fs.write_file("/var/www/html/index.html", "hi", DEFAULT_FILE_MODE).unwrap();
        fs.write_file("/var/www.bak", "keep", DEFAULT_FILE_MODE).unwrap();
        assert!(fs.remove("/var/www"));
        assert!(!fs.exists("/var/www/html/index.html"));
        assert!(fs.exists("/var/www.bak"));
        assert!(!fs.remove("/var/www"));
    }

    #[test]
    fn test_insert_file_over_directory_drops_subtree() {
        let mut fs = Rootfs::new();
        fs.write_file("/opt/app/bin", "x", DEFAULT_FILE_MODE).unwrap();
        fs.insert("/opt/app", Node::file("replaced")).unwrap();
        assert!(fs.get("/opt/app/bin").is_none());
        assert_eq!(fs.read_file("/opt/app").unwrap(), b"replaced");
    }

    #[test]
    fn test_clones_share_contents() {
        let mut fs = Rootfs::new();
        fs.write_file("/big", vec![0u8; 1024], DEFAULT_FILE_MODE).unwrap();
        let copy = fs.clone();
        let a = fs.get("/big").unwrap();
        let b = copy.get("/big").unwrap();
        assert!(a.same_as(b));
        assert_eq!(copy.total_size(), 1024);
    }

    #[test]
    fn test_from_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("etc/apache2")).unwrap();
        std::fs::write(dir.path().join("etc/apache2/ports.conf"), "Listen 80\n").unwrap();

        let fs = Rootfs::from_dir(dir.path()).unwrap();
        assert!(fs.is_dir("/etc"));
        assert_eq!(fs.read_file("/etc/apache2/ports.conf").unwrap(), b"Listen 80\n");
    }
}
