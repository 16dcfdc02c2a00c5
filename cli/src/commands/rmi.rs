//! `strata rmi` command — Remove stored images.
//!
//! After removing references, the layer cache is pruned back under its
//! byte budget; layers still referenced by remaining manifests are never
//! evicted.

use clap::Args;
use strata_core::config::StrataConfig;

#[derive(Args)]
pub struct RmiArgs {
    /// Image references to remove
    #[arg(required = true)]
    pub images: Vec<String>,
}

pub async fn execute(args: RmiArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = StrataConfig::default();
    let store = super::open_store(&config)?;
    let cache = super::open_cache(&config)?;

    for reference in &args.images {
        store.remove(reference).await?;
        println!("Removed: {reference}");
    }

    let protected = store.referenced_layers().await?;
    let evicted = cache.prune(config.layer_cache_limit, &protected)?;
    if evicted > 0 {
        println!("Pruned {evicted} unreferenced layers");
    }

    Ok(())
}
