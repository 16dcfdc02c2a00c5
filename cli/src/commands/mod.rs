//! CLI command definitions and dispatch.

mod build;
mod images;
mod ps;
mod pull;
mod push;
mod rmi;
mod run;
mod stop;
mod version;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use strata_core::config::StrataConfig;
use strata_runtime::{ImageStore, LayerCache};

/// strata: layered image builder and runner.
#[derive(Parser)]
#[command(name = "strata", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a Stratafile
    Build(build::BuildArgs),
    /// Run a container from an image
    Run(run::RunArgs),
    /// List containers
    Ps(ps::PsArgs),
    /// Stop a running container
    Stop(stop::StopArgs),
    /// List stored images
    Images(images::ImagesArgs),
    /// Remove one or more stored images
    Rmi(rmi::RmiArgs),
    /// Push an image to a registry
    Push(push::PushArgs),
    /// Pull an image from a registry
    Pull(pull::PullArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed command.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args).await,
        Command::Run(args) => run::execute(args).await,
        Command::Ps(args) => ps::execute(args).await,
        Command::Stop(args) => stop::execute(args).await,
        Command::Images(args) => images::execute(args).await,
        Command::Rmi(args) => rmi::execute(args).await,
        Command::Push(args) => push::execute(args).await,
        Command::Pull(args) => pull::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}

/// Open the shared image store.
pub(crate) fn open_store(
    config: &StrataConfig,
) -> Result<Arc<ImageStore>, Box<dyn std::error::Error>> {
    let store = ImageStore::new(&config.image_store_dir(), config.image_store_limit)?;
    Ok(Arc::new(store))
}

/// Open the shared layer cache.
pub(crate) fn open_cache(
    config: &StrataConfig,
) -> Result<Arc<LayerCache>, Box<dyn std::error::Error>> {
    let cache = LayerCache::new(&config.layer_cache_dir())?;
    Ok(Arc::new(cache))
}

/// Build the registry client for a `--registry` argument or the
/// `STRATA_REGISTRY` environment variable. HTTP(S) URLs get the HTTP
/// client; anything else is treated as a directory endpoint.
pub(crate) fn open_registry(
    explicit: Option<&str>,
) -> Result<Box<dyn strata_runtime::Registry>, Box<dyn std::error::Error>> {
    let from_env = std::env::var("STRATA_REGISTRY").ok();
    let target = explicit
        .map(|s| s.to_string())
        .or(from_env)
        .ok_or("No registry configured (use --registry or set STRATA_REGISTRY)")?;

    if target.starts_with("http://") || target.starts_with("https://") {
        Ok(Box::new(strata_runtime::HttpRegistry::new(target)))
    } else {
        Ok(Box::new(strata_runtime::DirRegistry::new(
            std::path::Path::new(&target),
        )?))
    }
}
