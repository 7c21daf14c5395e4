use std::path::PathBuf;

use worldspace_common::{CellId, ViewerId};

/// Failure of a single revalidation cycle. The viewer's cache is left at
/// its last committed state and the next cycle runs normally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("view cell {0} is gone or not live")]
    ViewUnavailable(CellId),
    #[error("viewer {0} is not logged in")]
    NotActive(ViewerId),
    #[error("revalidation aborted: {0}")]
    Aborted(String),
}

/// Delivery failure reported by a [`crate::Transport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("viewer {0} is disconnected")]
    Disconnected(ViewerId),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid setting: {0}")]
    Invalid(String),
}
