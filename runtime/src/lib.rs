//! Strata Runtime - layered image build-and-run engine.
//!
//! This crate implements the build side (Stratafile parsing, the
//! content-addressed layer cache, the build engine, the image store and
//! registry client) and the run side (rootfs materialization, process
//! supervision, and host-to-container port forwarding).

pub mod build;
pub mod buildfile;
pub mod cache;
pub mod manifest;
pub mod net;
pub mod registry;
pub mod runner;
pub mod store;

// Re-export common types
pub use build::{BuildConfig, BuildResult, Builder, StepExecutor};
pub use buildfile::{Buildfile, Instruction};
pub use cache::{CachedLayer, LayerCache};
pub use manifest::{ImageManifest, LayerRef};
pub use net::{PortForwarder, PortMapping};
pub use registry::{DirRegistry, HttpRegistry, Registry, RegistryAuth};
pub use runner::{ContainerRunner, RunningContainer};
pub use store::{ImageStore, StoredImage};

/// Strata Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
