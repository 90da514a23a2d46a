//! `lxbake create` command - Build a template and import it as a new image.

use std::path::PathBuf;

use clap::Args;
use lxbake_runtime::BuiltImageState;

use super::Context;
use crate::output;

#[derive(Args)]
pub struct CreateArgs {
    /// Resource name
    pub name: String,

    /// Builder definition file
    #[arg(short, long)]
    pub template: PathBuf,

    /// Remote to import into (defaults to the configured default remote)
    #[arg(short, long)]
    pub remote: Option<String>,

    /// Alias to bind to the new image (repeatable)
    #[arg(short, long = "alias")]
    pub aliases: Vec<String>,
}

pub async fn execute(ctx: &Context, args: CreateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut state = ctx.load_state()?;
    if state.get(&args.name).is_some_and(|r| r.id.is_some()) {
        return Err(format!("Built image {} already exists. Delete it first.", args.name).into());
    }

    let template = std::fs::read_to_string(&args.template)
        .map_err(|e| format!("Failed to read template {}: {}", args.template.display(), e))?;

    let mut record = BuiltImageState::new(template)
        .with_remote(args.remote.unwrap_or_default())
        .with_aliases(args.aliases);

    let report = ctx.resource.create(&mut record, &ctx.cancel).await?;
    output::print_alias_failures(&report);

    let id = record.id.clone().unwrap_or_default();
    state.upsert(&args.name, record)?;
    println!("{id}");

    Ok(())
}
