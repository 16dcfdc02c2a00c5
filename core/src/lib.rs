//! Strata Core - Foundational Types and Abstractions
//!
//! This module provides the error taxonomy and shared configuration
//! used across the strata workspace.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::StrataConfig;
pub use error::{Result, StrataError};

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
