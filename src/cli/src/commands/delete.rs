//! `lxbake delete` command - Delete a built image from its store.

use clap::Args;

use super::Context;

#[derive(Args)]
pub struct DeleteArgs {
    /// Resource name
    pub name: String,

    /// Remove the record even if the image is already gone from its store
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(ctx: &Context, args: DeleteArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut state = ctx.load_state()?;
    let mut record = state.require(&args.name)?;

    match ctx.resource.delete(&mut record, &ctx.cancel).await {
        Ok(()) => {}
        Err(e) if args.force && e.is_not_found() => {
            tracing::warn!(name = %args.name, "Image already gone, removing record");
        }
        Err(e) => return Err(e.into()),
    }

    state.remove(&args.name)?;
    println!("{}", args.name);

    Ok(())
}
