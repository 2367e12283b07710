//! Build context and artifact placement.
//!
//! Artifacts are opaque files named relative to the build context. They are
//! copied into the image, never interpreted.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use a3s_bake_core::error::{BakeError, Result};

use crate::rootfs::{file_name, resolve_path, Rootfs, DEFAULT_FILE_MODE};

/// A named file read from the build context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub data: Vec<u8>,
    pub mode: u32,
}

/// Files available to `CopyArtifact` steps.
pub trait BuildContext: Send + Sync {
    /// Whether `name` exists as a regular file.
    fn contains(&self, name: &str) -> bool;

    /// Read artifact `name`.
    fn read(&self, name: &str) -> Result<Artifact>;
}

/// Build context backed by a host directory.
#[derive(Debug, Clone)]
pub struct DirContext {
    root: PathBuf,
}

impl DirContext {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host file behind `name`. Names that are absolute or climb out of
    /// the context are rejected, as are symlinks resolving outside it.
    fn locate(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        if name.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        let root = self.root.canonicalize().ok()?;
        let path = root.join(relative).canonicalize().ok()?;
        if !path.starts_with(&root) {
            tracing::warn!(name, target = %path.display(), "Artifact resolves outside the build context");
            return None;
        }
        path.is_file().then_some(path)
    }
}

impl BuildContext for DirContext {
    fn contains(&self, name: &str) -> bool {
        self.locate(name).is_some()
    }

    fn read(&self, name: &str) -> Result<Artifact> {
        let path = self.locate(name).ok_or_else(|| missing(name))?;
        let data = std::fs::read(&path)?;
        Ok(Artifact {
            data,
            mode: host_mode(&path),
        })
    }
}

#[cfg(unix)]
fn host_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o7777)
        .unwrap_or(DEFAULT_FILE_MODE)
}

#[cfg(not(unix))]
fn host_mode(_path: &Path) -> u32 {
    DEFAULT_FILE_MODE
}

/// In-memory build context.
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.files.insert(name.into(), data.into());
        self
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.files.remove(name).is_some()
    }
}

impl BuildContext for MemoryContext {
    fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    fn read(&self, name: &str) -> Result<Artifact> {
        self.files
            .get(name)
            .map(|data| Artifact {
                data: data.clone(),
                mode: DEFAULT_FILE_MODE,
            })
            .ok_or_else(|| missing(name))
    }
}

/// Fail on the first source absent from `context`, before anything is
/// copied.
pub fn check_artifacts<'a>(
    context: &dyn BuildContext,
    sources: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    for source in sources {
        if !context.contains(source) {
            tracing::warn!(source, "Artifact missing from build context");
            return Err(missing(source));
        }
    }
    Ok(())
}

/// Image path a copy of `source` to `dest` lands on. A destination ending
/// in `/`, or naming an existing directory, keeps the source file name.
pub fn destination(rootfs: &Rootfs, workdir: &str, source: &str, dest: &str) -> String {
    let resolved = resolve_path(workdir, dest);
    if dest.ends_with('/') || rootfs.is_dir(&resolved) {
        let name = file_name(source.trim_end_matches('/'));
        resolve_path(&resolved, name)
    } else {
        resolved
    }
}

/// Copy artifact `source` into `rootfs`, creating parent directories.
/// Returns the image path written.
pub fn place_artifact(
    rootfs: &mut Rootfs,
    context: &dyn BuildContext,
    source: &str,
    dest: &str,
    workdir: &str,
) -> Result<String> {
    let artifact = context.read(source)?;
    let target = destination(rootfs, workdir, source, dest);
    let size = artifact.data.len();

    rootfs
        .write_file(&target, artifact.data, artifact.mode)
        .map_err(|e| {
            BakeError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("cannot place {} at {}: {}", source, target, e),
            ))
        })?;

    tracing::debug!(source, dest = %target, size, "Artifact placed");
    Ok(target)
}

/// Create the working directory `path` (relative to the current one) and
/// return its absolute form.
pub fn set_working_directory(rootfs: &mut Rootfs, workdir: &str, path: &str) -> Result<String> {
    let resolved = resolve_path(workdir, path);
    rootfs.mkdir_p(&resolved).map_err(|e| {
        BakeError::IoError(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("cannot create working directory {}: {}", resolved, e),
        ))
    })?;
    Ok(resolved)
}

fn missing(name: &str) -> BakeError {
    BakeError::ArtifactMissing {
        source_name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a3s_bake_core::ErrorKind;
    use tempfile::TempDir;

    fn context() -> MemoryContext {
        MemoryContext::new()
            .with_file("index.php", "<?php echo 'hi';")
            .with_file("register.php", "<?php register();")
    }

    #[test]
    fn test_check_artifacts_all_present() {
        check_artifacts(&context(), ["index.php", "register.php"]).unwrap();
    }

    #[test]
    fn test_check_artifacts_reports_missing() {
        let mut ctx = context();
        ctx.remove("register.php");
        let err = check_artifacts(&ctx, ["index.php", "register.php"]).unwrap_err();
        match err {
            BakeError::ArtifactMissing { source_name } => assert_eq!(source_name, "register.php"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_place_artifact_creates_parents() {
        let mut fs = Rootfs::new();
        let placed =
            place_artifact(&mut fs, &context(), "index.php", "/srv/www/index.php", "/").unwrap();
        assert_eq!(placed, "/srv/www/index.php");
        assert!(fs.is_dir("/srv/www"));
        assert_eq!(fs.read_file("/srv/www/index.php").unwrap(), b"<?php echo 'hi';");
    }

    #[test]
    fn test_place_into_directory() {
        let mut fs = Rootfs::new();
        let placed =
            place_artifact(&mut fs, &context(), "index.php", "/var/www/html/", "/").unwrap();
        assert_eq!(placed, "/var/www/html/index.php");

        let placed = place_artifact(&mut fs, &context(), "register.php", "/var/www/html", "/").unwrap();
        assert_eq!(placed, "/var/www/html/register.php");
    }

    #[test]
    fn test_relative_destination_uses_workdir() {
        let mut fs = Rootfs::new();
        let placed = place_artifact(&mut fs, &context(), "index.php", "index.php", "/srv/www").unwrap();
        assert_eq!(placed, "/srv/www/index.php");
    }

    #[test]
    fn test_set_working_directory() {
        let mut fs = Rootfs::new();
        let dir = set_working_directory(&mut fs, "/", "/srv/www").unwrap();
        assert_eq!(dir, "/srv/www");
        assert!(fs.is_dir("/srv/www"));

        let nested = set_working_directory(&mut fs, &dir, "public").unwrap();
        assert_eq!(nested, "/srv/www/public");
    }

    #[test]
    fn test_dir_context() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("index.php"), "<?php").unwrap();
        std::fs::create_dir(tmp.path().join("assets")).unwrap();
        let ctx = DirContext::new(tmp.path());

        assert!(ctx.contains("index.php"));
        assert!(!ctx.contains("register.php"));
        assert!(!ctx.contains("assets"));
        assert!(!ctx.contains("../index.php"));
        assert!(!ctx.contains("/etc/passwd"));
        assert_eq!(ctx.read("index.php").unwrap().data, b"<?php");

        let err = ctx.read("register.php").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArtifactMissing);
    }

    #[cfg(unix)]
    #[test]
    fn test_dir_context_symlinks() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), "TOP SECRET").unwrap();

        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("index.php"), "<?php").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), tmp.path().join("leak.php"))
            .unwrap();
        std::os::unix::fs::symlink("index.php", tmp.path().join("home.php")).unwrap();
        let ctx = DirContext::new(tmp.path());

        assert!(!ctx.contains("leak.php"));
        let err = ctx.read("leak.php").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArtifactMissing);

        assert!(ctx.contains("home.php"));
        assert_eq!(ctx.read("home.php").unwrap().data, b"<?php");
    }
}
