//! A3S Bake Core - Foundational Types and Abstractions
//!
//! This module provides the data model shared by the build engine and the
//! CLI: build directives and their steps, the build state machine, the
//! runtime contract of a built image, build events, configuration and the
//! error taxonomy.

pub mod config;
pub mod directive;
pub mod error;
pub mod event;
pub mod runtime_config;
pub mod state;

// Re-export commonly used types
pub use config::{BakeConfig, LogLevel};
pub use directive::{BuildDirective, ListenConfig, PatchScope, Stage, Step};
pub use error::{BakeError, ErrorKind, Result};
pub use event::{BuildEvent, BuildEventKind, EventEmitter};
pub use runtime_config::RuntimeConfig;
pub use state::BuildState;

/// A3S Bake version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
