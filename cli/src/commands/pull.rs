//! `strata pull` command — Pull an image from a registry.
//!
//! Fetches the manifest for a tag, downloads any layer blobs missing
//! from the local cache, and records the manifest in the image store
//! under the same tag.

use clap::Args;
use strata_core::config::StrataConfig;

#[derive(Args)]
pub struct PullArgs {
    /// Image reference (e.g., "hello:latest")
    pub image: String,

    /// Registry endpoint (HTTP(S) URL or directory); defaults to $STRATA_REGISTRY
    #[arg(long)]
    pub registry: Option<String>,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PullArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = StrataConfig::default();
    let store = super::open_store(&config)?;
    let cache = super::open_cache(&config)?;

    if !args.quiet {
        println!("Pulling {}...", args.image);
    }

    let registry = super::open_registry(args.registry.as_deref())?;
    let manifest = registry.pull(&args.image, &cache).await?;
    let stored = store.put(&args.image, &manifest).await?;

    if args.quiet {
        println!("{}", stored.digest);
    } else {
        println!(
            "Pulled: {} ({} layers, {})",
            args.image,
            manifest.layers.len(),
            crate::output::format_bytes(stored.size_bytes)
        );
    }

    Ok(())
}
