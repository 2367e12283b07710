//! Build directives: the ordered list of steps that produces one image.
//!
//! A directive is authored once and consumed by the build engine. Step
//! identity is its position in the list; layer *n* of the built image is the
//! result of applying step *n* to layer *n - 1*.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{BakeError, Result};
use crate::state::BuildState;

/// Default keyword introducing a listening-port declaration.
pub const DEFAULT_LISTEN_KEYWORD: &str = "Listen";

/// Which occurrences of a pattern a patch rewrites.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchScope {
    /// Every occurrence in the file
    #[default]
    All,
    /// Only the first occurrence
    First,
    /// Every occurrence on lines that contain the given text
    LinesContaining(String),
}

/// A single environment-mutating build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// Resolve the base image (`name[:tag]`)
    FetchBase { reference: String },
    /// Install system packages
    InstallPackages {
        packages: BTreeSet<String>,
        #[serde(default)]
        interactive: bool,
    },
    /// Textual substitution inside a file of the image
    PatchFile {
        path: String,
        pattern: String,
        replacement: String,
        #[serde(default)]
        scope: PatchScope,
    },
    /// Overwrite (or create) a file with fixed content
    WriteFile { path: String, content: String },
    /// Copy a build-context artifact into the image
    CopyArtifact { source: String, dest: String },
    /// Set (and create) the working directory
    SetWorkingDirectory { path: String },
    /// Environment variable recorded on the image
    SetEnv { key: String, value: String },
    /// TCP port the image advertises
    ExposePort { port: u16 },
    /// Foreground process of the image
    SetEntrypoint {
        command: Vec<String>,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Pipeline stage a step belongs to. Stages only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Base,
    Packages,
    Configuration,
    Artifacts,
    Entrypoint,
}

impl Stage {
    /// Build state reached once a step of this stage completes.
    ///
    /// The entrypoint stage is descriptive only; the chain becomes `Ready`
    /// after the final consistency checks, not after its steps.
    pub fn reached_state(self) -> Option<BuildState> {
        match self {
            Stage::Base => Some(BuildState::Based),
            Stage::Packages => Some(BuildState::PackagesInstalled),
            Stage::Configuration => Some(BuildState::Patched),
            Stage::Artifacts => Some(BuildState::ArtifactsPlaced),
            Stage::Entrypoint => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Base => "base",
            Stage::Packages => "packages",
            Stage::Configuration => "configuration",
            Stage::Artifacts => "artifacts",
            Stage::Entrypoint => "entrypoint",
        };
        f.write_str(name)
    }
}

impl Step {
    pub fn fetch_base(reference: impl Into<String>) -> Self {
        Step::FetchBase {
            reference: reference.into(),
        }
    }

    pub fn install<I, S>(packages: I, interactive: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Step::InstallPackages {
            packages: packages.into_iter().map(Into::into).collect(),
            interactive,
        }
    }

    pub fn patch(
        path: impl Into<String>,
        pattern: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Self {
        Step::PatchFile {
            path: path.into(),
            pattern: pattern.into(),
            replacement: replacement.into(),
            scope: PatchScope::All,
        }
    }

    pub fn copy(source: impl Into<String>, dest: impl Into<String>) -> Self {
        Step::CopyArtifact {
            source: source.into(),
            dest: dest.into(),
        }
    }

    pub fn workdir(path: impl Into<String>) -> Self {
        Step::SetWorkingDirectory { path: path.into() }
    }

    pub fn expose(port: u16) -> Self {
        Step::ExposePort { port }
    }

    pub fn entrypoint<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Step::SetEntrypoint {
            command: command.into_iter().map(Into::into).collect(),
            args: Vec::new(),
        }
    }

    /// Stage this step belongs to; `None` for steps allowed anywhere after
    /// the base.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Step::FetchBase { .. } => Some(Stage::Base),
            Step::InstallPackages { .. } => Some(Stage::Packages),
            Step::PatchFile { .. } | Step::WriteFile { .. } => Some(Stage::Configuration),
            Step::CopyArtifact { .. } | Step::SetWorkingDirectory { .. } => {
                Some(Stage::Artifacts)
            }
            Step::ExposePort { .. } | Step::SetEntrypoint { .. } => Some(Stage::Entrypoint),
            Step::SetEnv { .. } => None,
        }
    }

    /// Whether the step only touches image metadata, not the filesystem.
    pub fn is_metadata_only(&self) -> bool {
        matches!(
            self,
            Step::SetEnv { .. } | Step::ExposePort { .. } | Step::SetEntrypoint { .. }
        )
    }

    /// Whether the step reaches out to a base store or package repository.
    pub fn is_network_bound(&self) -> bool {
        matches!(self, Step::FetchBase { .. } | Step::InstallPackages { .. })
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Step::FetchBase { reference } => non_empty("base reference", reference),
            Step::InstallPackages { packages, .. } => {
                if packages.is_empty() {
                    return Err("package set is empty".to_string());
                }
                if packages.iter().any(|p| p.trim().is_empty()) {
                    return Err("package names must not be empty".to_string());
                }
                Ok(())
            }
            Step::PatchFile {
                path,
                pattern,
                scope,
                ..
            } => {
                non_empty("patch path", path)?;
                if pattern.is_empty() {
                    return Err(format!("patch pattern for {} is empty", path));
                }
                if let PatchScope::LinesContaining(filter) = scope {
                    if filter.is_empty() {
                        return Err(format!("line filter for {} is empty", path));
                    }
                }
                Ok(())
            }
            Step::WriteFile { path, .. } => non_empty("write path", path),
            Step::CopyArtifact { source, dest } => {
                non_empty("artifact source", source)?;
                non_empty("artifact destination", dest)
            }
            Step::SetWorkingDirectory { path } => non_empty("working directory", path),
            Step::SetEnv { key, .. } => {
                non_empty("environment key", key)?;
                if key.contains('=') {
                    return Err(format!("environment key '{}' contains '='", key));
                }
                Ok(())
            }
            Step::ExposePort { port } => {
                if *port == 0 {
                    return Err("exposed port must be in 1-65535".to_string());
                }
                Ok(())
            }
            Step::SetEntrypoint { command, .. } => match command.first() {
                Some(program) if !program.trim().is_empty() => Ok(()),
                _ => Err("entrypoint command is empty".to_string()),
            },
        }
    }
}

fn non_empty(what: &str, value: &str) -> std::result::Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{} is empty", what))
    } else {
        Ok(())
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::FetchBase { reference } => write!(f, "FROM {}", reference),
            Step::InstallPackages {
                packages,
                interactive,
            } => {
                let names: Vec<&str> = packages.iter().map(String::as_str).collect();
                if *interactive {
                    write!(f, "INSTALL --interactive {}", names.join(" "))
                } else {
                    write!(f, "INSTALL {}", names.join(" "))
                }
            }
            Step::PatchFile {
                path,
                pattern,
                replacement,
                scope,
            } => match scope {
                PatchScope::All => write!(f, "PATCH {} {:?} {:?}", path, pattern, replacement),
                PatchScope::First => {
                    write!(f, "PATCH --first {} {:?} {:?}", path, pattern, replacement)
                }
                PatchScope::LinesContaining(filter) => write!(
                    f,
                    "PATCH --lines-containing={:?} {} {:?} {:?}",
                    filter, path, pattern, replacement
                ),
            },
            Step::WriteFile { path, content } => {
                write!(f, "WRITE {} ({} bytes)", path, content.len())
            }
            Step::CopyArtifact { source, dest } => write!(f, "COPY {} {}", source, dest),
            Step::SetWorkingDirectory { path } => write!(f, "WORKDIR {}", path),
            Step::SetEnv { key, value } => write!(f, "ENV {}={}", key, value),
            Step::ExposePort { port } => write!(f, "EXPOSE {}", port),
            Step::SetEntrypoint { command, args } => {
                let exec: Vec<&String> = command.iter().chain(args.iter()).collect();
                write!(f, "CMD {:?}", exec)
            }
        }
    }
}

/// Where the consistency check reads the configured listening port from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    /// File inside the image (relative paths resolve against the final
    /// working directory)
    pub path: String,
    /// Directive keyword, e.g. `Listen`
    #[serde(default = "default_listen_keyword")]
    pub keyword: String,
}

fn default_listen_keyword() -> String {
    DEFAULT_LISTEN_KEYWORD.to_string()
}

impl ListenConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            keyword: default_listen_keyword(),
        }
    }
}

/// Ordered sequence of build steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDirective {
    pub steps: Vec<Step>,
    /// Listening-port declaration checked against the exposed port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<ListenConfig>,
}

impl BuildDirective {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            listen: None,
        }
    }

    /// Check the exposed port against `path` once the image is built.
    pub fn with_listen(mut self, listen: ListenConfig) -> Self {
        self.listen = Some(listen);
        self
    }

    /// Load a directive from its JSON form.
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load a directive from its YAML form.
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn base_reference(&self) -> Option<&str> {
        self.steps.iter().find_map(|s| match s {
            Step::FetchBase { reference } => Some(reference.as_str()),
            _ => None,
        })
    }

    pub fn exposed_port(&self) -> Option<u16> {
        self.steps.iter().find_map(|s| match s {
            Step::ExposePort { port } => Some(*port),
            _ => None,
        })
    }

    /// Names of every artifact the directive copies, in step order.
    pub fn artifact_sources(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|s| match s {
                Step::CopyArtifact { source, .. } => Some(source.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Structural validation, run before anything is fetched.
    pub fn validate(&self) -> Result<()> {
        let first = self
            .steps
            .first()
            .ok_or_else(|| BakeError::InvalidDirective("directive has no steps".to_string()))?;
        if !matches!(first, Step::FetchBase { .. }) {
            return Err(BakeError::InvalidDirective(format!(
                "first step must fetch the base image, found '{}'",
                first
            )));
        }

        let mut furthest = Stage::Base;
        let mut bases = 0;
        let mut ports = 0;
        let mut entrypoints = 0;

        for (idx, step) in self.steps.iter().enumerate() {
            let position = idx + 1;
            step.validate().map_err(|reason| {
                BakeError::InvalidDirective(format!("step {} ({}): {}", position, step, reason))
            })?;

            match step {
                Step::FetchBase { .. } => bases += 1,
                Step::ExposePort { .. } => ports += 1,
                Step::SetEntrypoint { .. } => entrypoints += 1,
                _ => {}
            }

            if let Some(stage) = step.stage() {
                if stage < furthest {
                    return Err(BakeError::InvalidDirective(format!(
                        "step {} ({}) belongs to the {} stage but the build already reached the {} stage",
                        position, step, stage, furthest
                    )));
                }
                furthest = stage;
            }
        }

        if bases != 1 {
            return Err(BakeError::InvalidDirective(format!(
                "expected exactly one base image, found {}",
                bases
            )));
        }
        if ports != 1 {
            return Err(BakeError::InvalidDirective(format!(
                "expected exactly one exposed port, found {}",
                ports
            )));
        }
        if entrypoints != 1 {
            return Err(BakeError::InvalidDirective(format!(
                "expected exactly one entrypoint, found {}",
                entrypoints
            )));
        }

        if let Some(listen) = &self.listen {
            if listen.path.trim().is_empty() || listen.keyword.trim().is_empty() {
                return Err(BakeError::InvalidDirective(
                    "listen config needs a path and a keyword".to_string(),
                ));
            }
        }

        Ok(())
    }
}
