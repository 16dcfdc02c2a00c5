//! `strata build` command — Build an image from a Stratafile.
//!
//! Parses the Stratafile, walks its instructions against the layer
//! cache, and stores the resulting manifest in the local image store.

use std::path::PathBuf;

use clap::Args;
use strata_core::config::StrataConfig;
use strata_runtime::{BuildConfig, Builder};

#[derive(Args)]
pub struct BuildArgs {
    /// Build context directory (contains the Stratafile and source files)
    #[arg(default_value = ".")]
    pub path: String,

    /// Name and optionally tag for the image (e.g., "hello:latest")
    #[arg(short = 't', long = "tag")]
    pub tag: Option<String>,

    /// Path to the Stratafile (default: <PATH>/Stratafile)
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Suppress build output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = PathBuf::from(&args.path)
        .canonicalize()
        .map_err(|e| format!("Invalid build context path '{}': {}", args.path, e))?;

    if !context_dir.is_dir() {
        return Err(format!("Build context '{}' is not a directory", context_dir.display()).into());
    }

    let buildfile_path = match &args.file {
        Some(f) => {
            let p = PathBuf::from(f);
            if p.is_absolute() {
                p
            } else {
                context_dir.join(p)
            }
        }
        None => context_dir.join("Stratafile"),
    };

    if !buildfile_path.exists() {
        return Err(format!("Stratafile not found at {}", buildfile_path.display()).into());
    }

    let config = StrataConfig::default();
    let cache = super::open_cache(&config)?;
    let store = super::open_store(&config)?;

    let builder = Builder::new(cache, store);
    let result = builder
        .build(&BuildConfig {
            context_dir,
            buildfile_path,
            tag: args.tag.clone(),
            quiet: args.quiet,
        })
        .await?;

    if args.quiet {
        println!("{}", result.digest);
    }

    Ok(())
}
