//! Error types for the BURROW gateways.

use thiserror::Error;

/// Operational gateway failures.
///
/// These never travel on a bus directly; the owning gateway converts them
/// into `Error` events carrying the failing request's correlation id.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Socket creation, tuning, or binding failed
    #[error("socket setup failed: {0}")]
    Socket(#[from] std::io::Error),

    /// Child process could not be spawned
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        /// Command that failed to start
        command: String,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// Child process was spawned without the expected stdio pipe
    #[error("child process is missing a {0} pipe")]
    MissingPipe(&'static str),
}
