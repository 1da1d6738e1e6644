//! livemix common utilities
//!
//! Shared infrastructure for all livemix crates:
//! - Error types, lifecycle error categories, and exit codes
//! - The shared pipeline clock and frame pacing
//! - Tracing/logging initialization
//! - Configuration loading

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
