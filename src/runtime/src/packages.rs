//! System package installation.
//!
//! Packages come from a [`PackageRepository`]. Installing a set resolves
//! dependencies, checks conflicts and prompts, and only then unpacks files,
//! so a failed install leaves the filesystem untouched. Installed packages
//! are recorded inside the image, which makes re-installing the same set a
//! no-op.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use a3s_bake_core::error::{BakeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::resolve::with_deadline;
use crate::rootfs::{Node, Rootfs, DEFAULT_FILE_MODE};

/// Installed-package database inside the image.
pub const STATUS_PATH: &str = "/var/lib/a3s-bake/status";

/// Answers given to package prompts during non-interactive installs.
pub const ANSWERS_PATH: &str = "/var/lib/a3s-bake/answers";

/// Question a package asks while being installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub question: String,
    pub default: String,
}

/// `package.json` of a repository package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub prompts: Vec<Prompt>,
}

/// A package: its manifest and the files it unpacks into the image.
#[derive(Debug, Clone)]
pub struct Package {
    pub manifest: PackageManifest,
    pub files: Rootfs,
}

impl Package {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            manifest: PackageManifest {
                name: name.into(),
                version: version.into(),
                depends: Vec::new(),
                conflicts: Vec::new(),
                prompts: Vec::new(),
            },
            files: Rootfs::new(),
        }
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.manifest.depends.push(name.into());
        self
    }

    pub fn conflicts_with(mut self, name: impl Into<String>) -> Self {
        self.manifest.conflicts.push(name.into());
        self
    }

    pub fn prompt(mut self, question: impl Into<String>, default: impl Into<String>) -> Self {
        self.manifest.prompts.push(Prompt {
            question: question.into(),
            default: default.into(),
        });
        self
    }

    /// Add a file unpacked at `path`.
    pub fn file(mut self, path: &str, content: impl Into<Vec<u8>>) -> Result<Self> {
        self.files
            .write_file(path, content, DEFAULT_FILE_MODE)
            .map_err(|e| install_error(&self.manifest.name, e.to_string()))?;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }
}

/// Source of installable packages.
#[async_trait]
pub trait PackageRepository: Send + Sync {
    /// Fetch package `name`.
    async fn fetch(&self, name: &str) -> Result<Package>;
}

/// In-process package repository.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    packages: RwLock<BTreeMap<String, Arc<Package>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, package: Package) {
        if let Ok(mut packages) = self.packages.write() {
            packages.insert(package.name().to_string(), Arc::new(package));
        }
    }

    pub fn with_package(self, package: Package) -> Self {
        self.add(package);
        self
    }
}

#[async_trait]
impl PackageRepository for MemoryRepository {
    async fn fetch(&self, name: &str) -> Result<Package> {
        let packages = self
            .packages
            .read()
            .map_err(|_| install_error(name, "repository lock poisoned"))?;
        packages
            .get(name)
            .map(|p| p.as_ref().clone())
            .ok_or_else(|| install_error(name, "package not found in repository"))
    }
}

/// Packages stored on disk as `<root>/<name>/package.json` plus a
/// `<root>/<name>/files/` tree unpacked at `/`.
#[derive(Debug, Clone)]
pub struct DirRepository {
    root: PathBuf,
}

impl DirRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl PackageRepository for DirRepository {
    async fn fetch(&self, name: &str) -> Result<Package> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(install_error(name, "invalid package name"));
        }

        let dir = self.root.join(name);
        let manifest_path = dir.join("package.json");
        let content = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    install_error(name, "package not found in repository")
                }
                _ => install_error(
                    name,
                    format!("failed to read {}: {}", manifest_path.display(), e),
                ),
            })?;
        let mut manifest: PackageManifest = serde_json::from_str(&content)
            .map_err(|e| install_error(name, format!("invalid package.json: {}", e)))?;
        if manifest.name.is_empty() {
            manifest.name = name.to_string();
        } else if manifest.name != name {
            return Err(install_error(
                name,
                format!("package.json names package '{}'", manifest.name),
            ));
        }

        let files_dir = dir.join("files");
        let files = if files_dir.is_dir() {
            tokio::task::spawn_blocking(move || Rootfs::from_dir(&files_dir))
                .await
                .map_err(|e| install_error(name, format!("loader task failed: {}", e)))?
                .map_err(|e| install_error(name, format!("failed to load files: {}", e)))?
        } else {
            Rootfs::new()
        };

        Ok(Package { manifest, files })
    }
}

/// Outcome of one install step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Newly installed packages in install order, with versions
    pub installed: Vec<(String, String)>,
    /// Requested or required packages that were already installed
    pub skipped: Vec<String>,
}

/// Installs package sets into a rootfs.
pub struct PackageInstaller<'a> {
    repository: &'a dyn PackageRepository,
    deadline: Duration,
}

impl<'a> PackageInstaller<'a> {
    pub fn new(repository: &'a dyn PackageRepository, deadline: Duration) -> Self {
        Self {
            repository,
            deadline,
        }
    }

    /// Install `names` and their dependencies into `rootfs`.
    ///
    /// Interactive installs fail on packages that ask questions; otherwise
    /// every question takes its default answer.
    pub async fn install(
        &self,
        rootfs: &mut Rootfs,
        names: &BTreeSet<String>,
        interactive: bool,
    ) -> Result<InstallReport> {
        let status = read_status(rootfs)?;
        let requested: Vec<&str> = names.iter().map(String::as_str).collect();

        let plan = with_deadline(
            format!("fetching packages {}", requested.join(", ")),
            self.deadline,
            self.plan(names, &status),
        )
        .await?;

        check_conflicts(&plan.packages, &status)?;

        let mut answers = Vec::new();
        for package in &plan.packages {
            if package.manifest.prompts.is_empty() {
                continue;
            }
            if interactive {
                return Err(install_error(
                    package.name(),
                    format!(
                        "package asks '{}' but builds have no terminal; install non-interactively",
                        package.manifest.prompts[0].question
                    ),
                ));
            }
            for prompt in &package.manifest.prompts {
                tracing::debug!(
                    package = package.name(),
                    question = %prompt.question,
                    answer = %prompt.default,
                    "Answering prompt with default"
                );
                answers.push((package.name().to_string(), prompt.clone()));
            }
        }

        let mut report = InstallReport {
            installed: Vec::new(),
            skipped: plan.skipped,
        };
        if plan.packages.is_empty() {
            tracing::info!(packages = ?requested, "Packages already installed");
            return Ok(report);
        }

        let mut status = status;
        for package in &plan.packages {
            unpack(rootfs, package)?;
            status.insert(package.name().to_string(), package.version().to_string());
            report
                .installed
                .push((package.name().to_string(), package.version().to_string()));
            tracing::info!(
                package = package.name(),
                version = package.version(),
                files = package.files.len(),
                "Package installed"
            );
        }

        write_status(rootfs, &status)?;
        if !answers.is_empty() {
            append_answers(rootfs, &answers)?;
        }

        Ok(report)
    }

    /// Fetch every package that needs installing, dependencies first.
    async fn plan(
        &self,
        names: &BTreeSet<String>,
        status: &BTreeMap<String, String>,
    ) -> Result<InstallPlan> {
        let mut plan = InstallPlan::default();
        let mut seen: HashSet<String> = HashSet::new();
        // (name, package once its dependencies are queued)
        for root in names {
            let mut stack: Vec<(String, Option<Package>)> = vec![(root.clone(), None)];
            while let Some((name, fetched)) = stack.pop() {
                match fetched {
                    Some(package) => plan.packages.push(package),
                    None => {
                        if !seen.insert(name.clone()) {
                            continue;
                        }
                        let package = self.repository.fetch(&name).await?;
                        if let Some(installed) = status.get(&name) {
                            if installed == package.version() {
                                plan.skipped.push(name);
                                continue;
                            }
                            return Err(install_error(
                                &name,
                                format!(
                                    "version conflict: {} is installed, repository provides {}",
                                    installed,
                                    package.version()
                                ),
                            ));
                        }
                        let mut depends: Vec<String> = package.manifest.depends.clone();
                        depends.sort();
                        depends.dedup();
                        stack.push((name, Some(package)));
                        for dep in depends.into_iter().rev() {
                            if !seen.contains(&dep) {
                                stack.push((dep, None));
                            }
                        }
                    }
                }
            }
        }
        Ok(plan)
    }
}

#[derive(Default)]
struct InstallPlan {
    packages: Vec<Package>,
    skipped: Vec<String>,
}

fn check_conflicts(plan: &[Package], status: &BTreeMap<String, String>) -> Result<()> {
    let planned: BTreeSet<&str> = plan.iter().map(Package::name).collect();
    for package in plan {
        for other in &package.manifest.conflicts {
            if status.contains_key(other) || planned.contains(other.as_str()) {
                return Err(install_error(
                    package.name(),
                    format!("conflicts with {}", other),
                ));
            }
        }
    }
    Ok(())
}

fn unpack(rootfs: &mut Rootfs, package: &Package) -> Result<()> {
    for (path, node) in package.files.iter() {
        let placed = match node {
            Node::Dir { .. } => rootfs.mkdir_p(path).map(|_| ()),
            _ => rootfs.insert(path, node.clone()),
        };
        placed.map_err(|e| install_error(package.name(), format!("cannot unpack {}: {}", path, e)))?;
    }
    Ok(())
}

/// Installed packages recorded in the image, by name.
pub fn read_status(rootfs: &Rootfs) -> Result<BTreeMap<String, String>> {
    let mut status = BTreeMap::new();
    let data = match rootfs.read_file(STATUS_PATH) {
        Ok(data) => data,
        Err(_) => return Ok(status),
    };
    let text = std::str::from_utf8(data)
        .map_err(|_| install_error("status", format!("{} is not valid UTF-8", STATUS_PATH)))?;

    for stanza in text.split("\n\n") {
        let mut name = None;
        let mut version = None;
        for line in stanza.lines() {
            if let Some(value) = line.strip_prefix("Package:") {
                name = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("Version:") {
                version = Some(value.trim().to_string());
            }
        }
        if let (Some(name), Some(version)) = (name, version) {
            status.insert(name, version);
        }
    }
    Ok(status)
}

fn write_status(rootfs: &mut Rootfs, status: &BTreeMap<String, String>) -> Result<()> {
    let mut out = String::new();
    for (name, version) in status {
        out.push_str(&format!(
            "Package: {}\nVersion: {}\nStatus: install ok installed\n\n",
            name, version
        ));
    }
    rootfs
        .write_file(STATUS_PATH, out, DEFAULT_FILE_MODE)
        .map_err(|e| install_error("status", e.to_string()))
}

fn append_answers(rootfs: &mut Rootfs, answers: &[(String, Prompt)]) -> Result<()> {
    let mut out = rootfs
        .read_file(ANSWERS_PATH)
        .map(|d| d.to_vec())
        .unwrap_or_default();
    for (package, prompt) in answers {
        out.extend_from_slice(
            format!(
                "Package: {}\nQuestion: {}\nAnswer: {}\n\n",
                package, prompt.question, prompt.default
            )
            .as_bytes(),
        );
    }
    rootfs
        .write_file(ANSWERS_PATH, out, DEFAULT_FILE_MODE)
        .map_err(|e| install_error("answers", e.to_string()))
}

fn install_error(package: &str, cause: impl Into<String>) -> BakeError {
    BakeError::Install {
        package: package.to_string(),
        cause: cause.into(),
    }
}
