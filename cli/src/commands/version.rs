//! `strata version` command — Show version information.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs {}

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("strata {}", env!("CARGO_PKG_VERSION"));
    println!("runtime {}", strata_runtime::VERSION);
    println!("core {}", strata_core::VERSION);
    Ok(())
}
