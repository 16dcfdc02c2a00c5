//! `strata stop` command — Stop a running container.
//!
//! Sends SIGTERM to the container's entrypoint process. The foreground
//! `strata run` supervising it observes the exit and finalizes the
//! record.

use clap::Args;
use strata_runtime::runner::signal_stop;

use crate::state::StateFile;

#[derive(Args)]
pub struct StopArgs {
    /// Container name, ID, or ID prefix
    pub container: String,
}

pub async fn execute(args: StopArgs) -> Result<(), Box<dyn std::error::Error>> {
    let state = StateFile::load_default()?;
    let record = state
        .resolve(&args.container)
        .ok_or_else(|| format!("No such container: {}", args.container))?;

    if record.status != "running" {
        return Err(format!("Container '{}' is not running", args.container).into());
    }
    let Some(pid) = record.pid else {
        return Err(format!("Container '{}' has no recorded PID", args.container).into());
    };

    signal_stop(pid);
    println!("{}", record.name);
    Ok(())
}
