//! `strata ps` command — List containers.

use clap::Args;

use crate::output::{format_ago, new_table};
use crate::state::StateFile;

#[derive(Args)]
pub struct PsArgs {
    /// Show all containers (default shows just running)
    #[arg(short, long)]
    pub all: bool,
}

pub async fn execute(args: PsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let state = StateFile::load_default()?;

    let mut table = new_table(&["CONTAINER ID", "NAME", "IMAGE", "STATUS", "PORTS", "CREATED"]);
    for record in state.records() {
        if !args.all && record.status != "running" {
            continue;
        }
        table.add_row(vec![
            record.short_id.clone(),
            record.name.clone(),
            record.image.clone(),
            record.status.clone(),
            record.ports.join(", "),
            format_ago(&record.created_at),
        ]);
    }

    println!("{table}");
    Ok(())
}
