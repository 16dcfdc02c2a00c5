//! Image building: the Stratafile build engine and its parts.
//!
//! `engine` orchestrates the instruction loop, `layer` owns content
//! hashing and payload assembly, and `executor` is the seam through which
//! RUN steps touch the host.

pub mod engine;
pub mod executor;
pub mod layer;

pub use engine::{BuildConfig, BuildResult, Builder};
pub use executor::{
    default_executor, ChrootExecutor, ExecOutput, ExecRequest, HostExecutor, StepExecutor,
};
pub use layer::{chain_digest, extract_layer, write_layer, DirSnapshot, LayerPayload};
