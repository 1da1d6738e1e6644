//! CLI command implementations.

pub mod broadcast;
pub mod stages;
