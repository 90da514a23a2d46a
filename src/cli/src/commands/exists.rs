//! `lxbake exists` command - Check whether a built image still exists.

use clap::Args;

use super::Context;

#[derive(Args)]
pub struct ExistsArgs {
    /// Resource name
    pub name: String,
}

pub async fn execute(ctx: &Context, args: ExistsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let state = ctx.load_state()?;
    let record = state.require(&args.name)?;

    let exists = ctx.resource.exists(&record).await?;
    println!("{exists}");

    Ok(())
}
