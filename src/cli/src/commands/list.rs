//! `lxbake list` command - List built images.

use clap::Args;

use super::Context;
use crate::output;

#[derive(Args)]
pub struct ListArgs {
    /// Only display resource names
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(ctx: &Context, args: ListArgs) -> Result<(), Box<dyn std::error::Error>> {
    let state = ctx.load_state()?;

    if args.quiet {
        for (name, _) in state.records() {
            println!("{name}");
        }
        return Ok(());
    }

    let mut table = output::new_table(&["NAME", "REMOTE", "FINGERPRINT", "ALIASES", "CREATED"]);
    for (name, record) in state.records() {
        let id = record.built_id().ok().flatten();
        let remote = id
            .as_ref()
            .map(|id| ctx.resource.provider().select_remote(id.remote()))
            .unwrap_or_else(|| "-".to_string());
        let fingerprint = id
            .as_ref()
            .map(|id| output::short_fingerprint(id.fingerprint()).to_string())
            .unwrap_or_else(|| "<none>".to_string());

        table.add_row([
            name,
            &remote,
            &fingerprint,
            &record.aliases.join(", "),
            &output::format_created(record.created_at),
        ]);
    }

    println!("{table}");
    Ok(())
}
