//! `strata images` command — List stored images.

use clap::Args;
use strata_core::config::StrataConfig;

use crate::output::{format_ago, format_bytes, new_table, short_digest};

#[derive(Args)]
pub struct ImagesArgs {
    /// Print digests only
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ImagesArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = StrataConfig::default();
    let store = super::open_store(&config)?;
    let images = store.list().await;

    if args.quiet {
        for image in &images {
            println!("{}", image.digest);
        }
        return Ok(());
    }

    let mut table = new_table(&["REFERENCE", "DIGEST", "SIZE", "CREATED"]);
    for image in &images {
        table.add_row(vec![
            image.reference.clone(),
            short_digest(&image.digest),
            format_bytes(image.size_bytes),
            format_ago(&image.created_at),
        ]);
    }

    println!("{table}");
    Ok(())
}
