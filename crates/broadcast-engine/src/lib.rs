//! livemix broadcast engine
//!
//! Turns an [`AppConfig`](livemix_common::AppConfig) into a running
//! broadcast graph:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     BroadcastSession                      │
//! │  SessionConfig ──► GraphBuilder ──► LifecycleController   │
//! │                                          │                │
//! │     built-in provider (render + publish stages)           │
//! │                                          ▼                │
//! │                                     RunOutcome            │
//! └───────────────────────────────────────────────────────────┘
//! ```

pub mod provider;
pub mod session;

pub use provider::*;
pub use session::*;
