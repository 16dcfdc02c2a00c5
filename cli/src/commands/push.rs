//! `strata push` command — Push a local image to a registry.

use clap::Args;
use strata_core::config::StrataConfig;

#[derive(Args)]
pub struct PushArgs {
    /// Image reference (e.g., "hello:latest")
    pub image: String,

    /// Registry endpoint (HTTP(S) URL or directory); defaults to $STRATA_REGISTRY
    #[arg(long)]
    pub registry: Option<String>,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PushArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = StrataConfig::default();
    let store = super::open_store(&config)?;
    let cache = super::open_cache(&config)?;

    let (_, manifest) = store.resolve(&args.image).await.map_err(|_| {
        format!(
            "Image '{}' not found locally. Build or pull it first.",
            args.image
        )
    })?;

    if !args.quiet {
        println!("Pushing {}...", args.image);
    }

    let registry = super::open_registry(args.registry.as_deref())?;
    let digest = registry.push(&manifest, &args.image, &cache).await?;

    if args.quiet {
        println!("{digest}");
    } else {
        println!("Pushed: {} ({})", args.image, digest);
    }

    Ok(())
}
