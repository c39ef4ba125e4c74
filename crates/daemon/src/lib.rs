//! hearth member daemon
//!
//! Wires the cluster store, member registry, operation engine, network
//! allocation ledger and snapshot commands behind a REST API.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// TOML configuration
pub mod config;

/// Daemon lifecycle
pub mod daemon;

/// Error types
pub mod error;

/// Response envelope
pub mod response;

/// HTTP routes
pub mod routes;

pub use config::DaemonConfig;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use response::{ApiError, ApiResponse, ApiResult};
pub use routes::{AppState, router};
