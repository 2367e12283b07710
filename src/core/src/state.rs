//! Build state machine.
//!
//! A build moves strictly forward through
//! `Unbuilt → Based → PackagesInstalled → Patched → ArtifactsPlaced → Ready`.
//! A failing step leaves the chain in the state it had reached; there is no
//! way back and no way to resume.

use serde::{Deserialize, Serialize};

/// Progress of a single image build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    /// Nothing has been fetched yet
    Unbuilt,
    /// Base image resolved
    Based,
    /// System packages installed
    PackagesInstalled,
    /// Configuration files rewritten
    Patched,
    /// Build-context artifacts placed into the image
    ArtifactsPlaced,
    /// All checks passed; the image is immutable
    Ready,
}

impl BuildState {
    /// Move forward to `target`, never backward.
    ///
    /// Stages without steps are skipped, so the target may be more than one
    /// state ahead. A target behind the current state leaves it unchanged.
    pub fn advance(self, target: BuildState) -> BuildState {
        self.max(target)
    }

    /// Whether the build produced a usable image.
    pub fn is_ready(self) -> bool {
        self == BuildState::Ready
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildState::Unbuilt => "unbuilt",
            BuildState::Based => "based",
            BuildState::PackagesInstalled => "packages_installed",
            BuildState::Patched => "patched",
            BuildState::ArtifactsPlaced => "artifacts_placed",
            BuildState::Ready => "ready",
        }
    }
}

impl Default for BuildState {
    fn default() -> Self {
        BuildState::Unbuilt
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
