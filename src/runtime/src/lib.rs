//! A3S Bake Runtime - image build engine.
//!
//! This module provides the build pipeline behind A3S Bake: base image
//! resolution, package installation, configuration patching, artifact
//! placement, the entrypoint contract, the immutable layer chain, the
//! Bakefile parser and OCI layout export.

#![allow(clippy::result_large_err)]

pub mod artifact;
pub mod entrypoint;
pub mod export;
pub mod layer;
pub mod packages;
pub mod patch;
pub mod pipeline;
pub mod recipe;
pub mod reference;
#[cfg(feature = "registry")]
pub mod registry;
pub mod resolve;
pub mod rootfs;

// Re-export common types
pub use artifact::{Artifact, BuildContext, DirContext, MemoryContext};
pub use export::{export_oci, ExportedImage};
pub use layer::{ImageLayer, LayerChain, LayerDiff};
pub use packages::{
    DirRepository, InstallReport, MemoryRepository, Package, PackageInstaller, PackageManifest,
    PackageRepository,
};
pub use patch::substitute;
pub use pipeline::{BuildConfig, BuiltImage, Pipeline};
pub use reference::ImageReference;
#[cfg(feature = "registry")]
pub use registry::{RegistryAuth, RegistryResolver};
pub use resolve::{BaseResolver, DirBaseStore, MemoryBaseStore};
pub use rootfs::{Node, Rootfs};

/// A3S Bake Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
