//! Error types for the daemon

use thiserror::Error;

/// Result type for daemon setup
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while configuring or starting the daemon
#[derive(Debug, Error)]
pub enum Error {
    /// The daemon has already been started
    #[error("Daemon already started")]
    AlreadyStarted,

    /// Could not bind the listen address
    #[error("Failed to bind listen address: {0}")]
    Bind(#[source] std::io::Error),

    /// Cluster setup failed
    #[error(transparent)]
    Cluster(#[from] hearth_cluster::Error),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// The network fixture could not be loaded
    #[error(transparent)]
    NetworkFixture(#[from] hearth_network_mock::Error),

    /// Could not install the tracing subscriber
    #[error(transparent)]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
}
