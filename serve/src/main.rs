//! strata-hello: the service the walkthrough containerizes.
//!
//! Binds one socket and answers GET / with "Hello World!". The listen
//! port comes from `--port`, then the `PORT` environment variable,
//! then 3000. Reaching it from outside the container requires an
//! explicit port mapping at run time.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use strata_serve::{start, Routes, DEFAULT_PORT};

/// Hello-world HTTP service.
#[derive(Parser)]
#[command(name = "strata-hello", version, about)]
struct Args {
    /// Port to listen on (overrides $PORT)
    #[arg(short, long)]
    port: Option<u16>,
}

fn listen_port(args: &Args) -> u16 {
    args.port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(DEFAULT_PORT)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let port = listen_port(&args);

    if let Err(e) = start(port, Routes::hello()).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
