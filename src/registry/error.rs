//! Registry error types

use thiserror::Error;

/// Error type for registry plugins
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No instances registered under the name
    #[error("service not found: {0}")]
    NotFound(String),

    /// The backend could not be reached
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// The watcher was stopped or its source went away
    #[error("watcher stopped")]
    WatcherStopped,

    /// Any other backend failure
    #[error("registry error: {0}")]
    Other(String),
}
