//! `a3s-bake validate` command - Check a recipe without building it.

use clap::Args;

use super::RecipeArgs;
use crate::output::new_table;

#[derive(Args)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub recipe: RecipeArgs,

    /// Print the directive as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: ValidateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (_, directive) = args.recipe.load()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&directive)?);
        return Ok(());
    }

    let mut table = new_table(&["#", "STAGE", "STEP"]);
    for (idx, step) in directive.steps.iter().enumerate() {
        let stage = step
            .stage()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![(idx + 1).to_string(), stage, step.to_string()]);
    }
    println!("{table}");

    match &directive.listen {
        Some(listen) => println!(
            "Listening port checked against '{}' lines in {}",
            listen.keyword, listen.path
        ),
        None => println!("No listen configuration; port consistency will not be checked"),
    }
    Ok(())
}
