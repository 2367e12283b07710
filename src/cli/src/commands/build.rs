//! `a3s-bake build` command - Build an image from a recipe.
//!
//! Loads the recipe, runs the pipeline against the configured base store
//! and package repository, and prints the resulting runtime contract.
//! With `--output` the image is also written as an OCI image layout.

use std::path::PathBuf;

use a3s_bake_core::{BakeConfig, BuildEvent, BuildEventKind};
use a3s_bake_runtime::{export_oci, BuiltImage};
use clap::Args;
use tokio::sync::broadcast::{self, error::RecvError};

use super::{RecipeArgs, SourceArgs};
use crate::output::short_digest;

#[derive(Args)]
pub struct BuildArgs {
    #[command(flatten)]
    pub recipe: RecipeArgs,

    #[command(flatten)]
    pub sources: SourceArgs,

    /// Name and optionally tag for the image (e.g., "php-app:latest")
    #[arg(short = 't', long = "tag")]
    pub tag: Option<String>,

    /// Write the image as an OCI image layout to this directory
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Suppress build output and print only the chain id
    #[arg(short, long)]
    pub quiet: bool,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(
    args: BuildArgs,
    config: BakeConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.sources.apply(config)?;
    let (context_dir, directive) = args.recipe.load()?;

    let pipeline = super::pipeline(&config, &context_dir, args.tag.clone());
    let events = pipeline.events().subscribe();
    let printer = (!args.quiet && !args.json).then(|| tokio::spawn(print_progress(events)));

    let result = pipeline.build(&directive).await;
    // Closes the event channel so the printer drains and exits.
    drop(pipeline);
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    let image = result?;

    let exported = match &args.output {
        Some(dir) => Some(export_oci(&image, dir)?),
        None => None,
    };

    if args.json {
        let mut value = summary_json(&image);
        if let Some(exported) = &exported {
            value["exported"] = serde_json::json!({
                "path": exported.path,
                "manifestDigest": exported.manifest_digest,
            });
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else if args.quiet {
        println!("sha256:{}", image.chain_id());
    } else {
        print_summary(&image);
        if let Some(exported) = &exported {
            println!(
                "Exported {} layer(s) to {} ({})",
                exported.layer_count,
                exported.path.display(),
                exported.manifest_digest
            );
        }
    }

    Ok(())
}

/// Follow build events until the build finishes.
async fn print_progress(mut events: broadcast::Receiver<BuildEvent>) {
    let mut total = 0;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        match &event.kind {
            BuildEventKind::Started { steps } => total = *steps,
            BuildEventKind::StepStarted { index, step } => {
                println!("Step {}/{} : {}", index, total, step);
            }
            BuildEventKind::StepCompleted {
                digest,
                empty_layer,
                ..
            } => {
                if *empty_layer {
                    println!(" ---> (no filesystem changes)");
                } else {
                    println!(" ---> {}", short_digest(digest));
                }
            }
            BuildEventKind::Completed { chain_id } => {
                println!("Successfully built {}", short_digest(chain_id));
            }
            BuildEventKind::Failed { .. } => {}
        }
        if event.is_terminal() {
            break;
        }
    }
}

fn summary_json(image: &BuiltImage) -> serde_json::Value {
    serde_json::json!({
        "buildId": image.build_id,
        "tag": image.tag,
        "base": image.base,
        "chainId": format!("sha256:{}", image.chain_id()),
        "layers": image.layers.len(),
        "size": image.size(),
        "runtimeConfig": image.runtime_config,
    })
}

fn print_summary(image: &BuiltImage) {
    let runtime = &image.runtime_config;
    if let Some(tag) = &image.tag {
        println!("Tagged {}", tag);
    }
    println!("Base:        {}", image.base);
    println!(
        "Layers:      {} ({} with content, {})",
        image.layers.len(),
        image.layers.non_empty().count(),
        crate::output::format_bytes(image.size())
    );
    println!("Port:        {}/tcp", runtime.listening_port);
    println!("Workdir:     {}", runtime.working_directory);
    println!("Entrypoint:  {}", runtime.argv().join(" "));
    for entry in runtime.env_list() {
        println!("Env:         {}", entry);
    }
}
