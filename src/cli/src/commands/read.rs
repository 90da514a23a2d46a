//! `lxbake read` command - Refresh a built image from its store.

use clap::Args;

use super::Context;

#[derive(Args)]
pub struct ReadArgs {
    /// Resource name
    pub name: String,
}

pub async fn execute(ctx: &Context, args: ReadArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut state = ctx.load_state()?;
    let mut record = state.require(&args.name)?;

    ctx.resource.read(&mut record).await?;
    if record.id.is_none() {
        eprintln!("Built image {} no longer exists on its store", args.name);
    }

    println!("{}", serde_json::to_string_pretty(&record)?);
    state.upsert(&args.name, record)?;

    Ok(())
}
