//! CLI command definitions and dispatch.

mod build;
mod history;
mod validate;
mod version;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use a3s_bake_core::{BakeConfig, BuildDirective};
use a3s_bake_runtime::{
    BaseResolver, BuildConfig, DirBaseStore, DirContext, DirRepository, Pipeline,
    RegistryResolver,
};
use clap::{Args, Parser, Subcommand};

pub use build::BuildArgs;
pub use history::HistoryArgs;
pub use validate::ValidateArgs;

/// Default recipe file name inside a build context.
const DEFAULT_RECIPE: &str = "Bakefile";

/// A3S Bake - layered image builder for web application images.
#[derive(Parser)]
#[command(name = "a3s-bake", version, about)]
pub struct Cli {
    /// Configuration file (default: ~/.a3s/bake/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Load the configuration named by `--config`, or the user default.
    pub fn load_config(&self) -> a3s_bake_core::Result<BakeConfig> {
        match &self.config {
            Some(path) => BakeConfig::load(path),
            None => BakeConfig::load_or_default(),
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a recipe
    Build(build::BuildArgs),
    /// Check a recipe without building it
    Validate(validate::ValidateArgs),
    /// Build an image and show its layer history
    History(history::HistoryArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Where a recipe and its artifacts come from.
#[derive(Args, Clone)]
pub struct RecipeArgs {
    /// Build context directory (contains the recipe and artifacts)
    #[arg(default_value = ".")]
    pub path: String,

    /// Path to the recipe (default: <PATH>/Bakefile). `.json`, `.yaml` and
    /// `.yml` files are read as build directives.
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,
}

impl RecipeArgs {
    /// Canonical build context directory.
    pub fn context_dir(&self) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let context_dir = PathBuf::from(&self.path)
            .canonicalize()
            .map_err(|e| format!("Invalid build context path '{}': {}", self.path, e))?;
        if !context_dir.is_dir() {
            return Err(format!(
                "Build context '{}' is not a directory",
                context_dir.display()
            )
            .into());
        }
        Ok(context_dir)
    }

    /// Recipe path, relative paths resolved against the context.
    pub fn recipe_path(&self, context_dir: &Path) -> PathBuf {
        match &self.file {
            Some(f) => {
                let p = PathBuf::from(f);
                if p.is_absolute() {
                    p
                } else {
                    context_dir.join(p)
                }
            }
            None => context_dir.join(DEFAULT_RECIPE),
        }
    }

    /// Load and validate the recipe.
    pub fn load(&self) -> Result<(PathBuf, BuildDirective), Box<dyn std::error::Error>> {
        let context_dir = self.context_dir()?;
        let recipe_path = self.recipe_path(&context_dir);
        if !recipe_path.exists() {
            return Err(format!("Recipe not found at {}", recipe_path.display()).into());
        }
        let directive = a3s_bake_runtime::recipe::load_directive(&recipe_path)?;
        directive.validate()?;
        Ok((context_dir, directive))
    }
}

/// Overrides for the configured base store, package repository and deadline.
#[derive(Args, Clone, Default)]
pub struct SourceArgs {
    /// Local base image store (overrides config)
    #[arg(long = "base-store")]
    pub base_store: Option<PathBuf>,

    /// Local package repository (overrides config)
    #[arg(long = "repo")]
    pub repo: Option<PathBuf>,

    /// Deadline for network-bound steps, in seconds (overrides config)
    #[arg(long = "timeout")]
    pub timeout: Option<u64>,

    /// Pull base images from OCI registries
    #[arg(long = "registry")]
    pub registry: bool,
}

impl SourceArgs {
    /// Apply the overrides on top of `config`.
    pub fn apply(&self, mut config: BakeConfig) -> Result<BakeConfig, Box<dyn std::error::Error>> {
        if let Some(path) = &self.base_store {
            config.base_store = path.clone();
        }
        if let Some(path) = &self.repo {
            config.package_repo = path.clone();
        }
        if let Some(secs) = self.timeout {
            config.fetch_timeout_secs = secs;
        }
        if self.registry {
            config.use_registry = true;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Assemble a pipeline over the configured sources and `context_dir`.
pub(crate) fn pipeline(config: &BakeConfig, context_dir: &Path, tag: Option<String>) -> Pipeline {
    let bases: Arc<dyn BaseResolver> = if config.use_registry {
        Arc::new(RegistryResolver::new())
    } else {
        Arc::new(DirBaseStore::new(&config.base_store))
    };
    tracing::debug!(
        base_store = %config.base_store.display(),
        package_repo = %config.package_repo.display(),
        registry = config.use_registry,
        "Assembling pipeline"
    );

    Pipeline::new(
        bases,
        Arc::new(DirRepository::new(&config.package_repo)),
        Arc::new(DirContext::new(context_dir)),
    )
    .with_config(BuildConfig {
        tag,
        ..BuildConfig::from(config)
    })
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.load_config()?;
    match cli.command {
        Command::Build(args) => build::execute(args, config).await,
        Command::Validate(args) => validate::execute(args).await,
        Command::History(args) => history::execute(args, config).await,
        Command::Version(args) => version::execute(args).await,
    }
}
