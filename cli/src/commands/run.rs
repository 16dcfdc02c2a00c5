//! `strata run` command — Instantiate an image as a container.
//!
//! Runs in the foreground: the container's stdio is wired to the
//! terminal, port forwarders live for as long as this process, and the
//! exit code of the entrypoint becomes the exit code of `strata run`.

use clap::Args;
use strata_core::config::StrataConfig;
use strata_runtime::{ContainerRunner, PortMapping};

use crate::state::{generate_name, ContainerRecord, StateFile};

#[derive(Args)]
pub struct RunArgs {
    /// Image reference
    pub image: String,

    /// Assign a name to the container
    #[arg(long)]
    pub name: Option<String>,

    /// Publish a port (host:container), can be repeated
    #[arg(short = 'p', long = "publish")]
    pub publish: Vec<String>,

    /// Keep stdin open (interactive)
    #[arg(short, long)]
    pub interactive: bool,

    /// Remove the container record and rootfs when it exits
    #[arg(long)]
    pub rm: bool,
}

pub async fn execute(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mappings = args
        .publish
        .iter()
        .map(|spec| PortMapping::parse(spec))
        .collect::<Result<Vec<_>, _>>()?;

    let config = StrataConfig::default();
    let cache = super::open_cache(&config)?;
    let store = super::open_store(&config)?;

    let (_, manifest) = store.resolve(&args.image).await?;

    let runner = ContainerRunner::new(cache, &config.containers_dir())?;
    let mut container = runner
        .run(&args.image, &manifest, &mappings, args.interactive)
        .await?;

    let name = args.name.unwrap_or_else(generate_name);
    let record = ContainerRecord {
        id: container.id.clone(),
        short_id: ContainerRecord::make_short_id(&container.id),
        name,
        image: args.image.clone(),
        status: "running".to_string(),
        pid: Some(container.pid),
        ports: mappings.iter().map(|m| m.to_string()).collect(),
        rootfs: container.rootfs.clone(),
        created_at: chrono::Utc::now(),
        auto_remove: args.rm,
    };

    let mut state = StateFile::load(&config.state_file())?;
    state.add(record)?;

    let code = container.wait().await?;

    // Reload: another process may have touched the state meanwhile
    let mut state = StateFile::load(&config.state_file())?;
    if args.rm {
        container.remove_rootfs()?;
        state.remove(&container.id)?;
    } else {
        if let Some(record) = state.find_by_id_mut(&container.id) {
            record.status = "exited".to_string();
            record.pid = None;
        }
        state.save()?;
    }

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
