//! Error taxonomy for the gateway control plane

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the control plane.
///
/// Recoverable conditions (a failed config fetch with a usable cache, a
/// worker that never connects) are handled inside the components and retried
/// on the next tick; everything here is reported to the operator or the
/// calling process.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Remote configuration fetch failed; the cached snapshot stays active.
    #[error("failed to fetch configuration: {0}")]
    ConfigFetch(String),

    /// Fetch failed at startup and there is no cached snapshot to fall back
    /// to. Fatal: the process cannot start without a configuration.
    #[error("cached configuration {} does not exist and remote fetch failed; exiting", .0.display())]
    NoCachedConfig(PathBuf),

    /// The configuration file exists but cannot be parsed or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A reload was rejected synchronously: the pool is already reloading or
    /// the exit-rate tracker has tripped. No state was changed.
    #[error("reload rejected: {0}")]
    ReloadRejected(String),

    /// The control socket path is already bound by another instance.
    #[error(
        "portcullis seems to be already running. If it is not, the previous start may \
         have shut down uncleanly; try removing {} and start again",
        .0.display()
    )]
    AlreadyRunning(PathBuf),

    /// No instance is listening on the control socket.
    #[error("portcullis is not running")]
    NotRunning,

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
