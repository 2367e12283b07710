//! `a3s-bake history` command - Show the layer chain of a build.

use a3s_bake_core::BakeConfig;
use clap::Args;

use super::{RecipeArgs, SourceArgs};
use crate::output::{format_bytes, new_table, short_digest, truncate};

/// Width of the CREATED BY column unless `--no-trunc` is given.
const CREATED_BY_WIDTH: usize = 45;

#[derive(Args)]
pub struct HistoryArgs {
    #[command(flatten)]
    pub recipe: RecipeArgs,

    #[command(flatten)]
    pub sources: SourceArgs,

    /// Don't truncate output
    #[arg(long)]
    pub no_trunc: bool,

    /// Only show layer digests
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(
    args: HistoryArgs,
    config: BakeConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.sources.apply(config)?;
    let (context_dir, directive) = args.recipe.load()?;
    let image = super::pipeline(&config, &context_dir, None)
        .build(&directive)
        .await?;

    if args.quiet {
        for layer in image.layers.iter() {
            println!("sha256:{}", layer.digest);
        }
        return Ok(());
    }

    let mut table = new_table(&["#", "CREATED BY", "SIZE", "DIGEST"]);
    for layer in image.layers.iter() {
        let created_by = if args.no_trunc {
            layer.created_by.clone()
        } else {
            truncate(&layer.created_by, CREATED_BY_WIDTH)
        };
        let digest = if layer.is_empty() {
            "<empty>".to_string()
        } else if args.no_trunc {
            layer.prefixed_digest()
        } else {
            short_digest(&layer.digest)
        };
        table.add_row(vec![
            (layer.index + 1).to_string(),
            created_by,
            format_bytes(layer.size),
            digest,
        ]);
    }
    println!("{table}");
    println!("chain id: sha256:{}", image.chain_id());
    Ok(())
}
