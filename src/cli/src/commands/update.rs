//! `lxbake update` command - Change the aliases of a built image.

use clap::Args;

use super::Context;
use crate::output;

#[derive(Args)]
pub struct UpdateArgs {
    /// Resource name
    pub name: String,

    /// Desired alias (repeatable); omit all to remove every alias
    #[arg(short, long = "alias")]
    pub aliases: Vec<String>,
}

pub async fn execute(ctx: &Context, args: UpdateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut state = ctx.load_state()?;
    let mut record = state.require(&args.name)?;

    let report = ctx.resource.update(&mut record, args.aliases).await?;
    output::print_alias_failures(&report);

    state.upsert(&args.name, record)?;
    println!("{}", args.name);

    Ok(())
}
