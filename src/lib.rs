//! Sharelog Relay
//!
//! Streams ckpool share submissions to WebSocket subscribers:
//! - Incremental tailing of per-round sharelog files with rotation detection
//! - Address/worker subscriptions with bounded history replay
//! - Per-IP upgrade throttling, bans and connection caps
//! - Bearer-token gated streaming endpoint

pub mod config;
pub mod error;
pub mod relay;
pub mod sharelog;
pub mod types;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Application information
pub const APP_NAME: &str = "sharelog-relay";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
