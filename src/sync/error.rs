//! Error types for the change feed and synchronizers.

use thiserror::Error;

/// Errors yielded by a change feed transport.
#[derive(Debug, Error)]
pub enum FeedError {
    /// A single event could not be interpreted. Recoverable.
    #[error("malformed change event: {0}")]
    Malformed(String),

    /// The transport is gone. Fatal to the hub.
    #[error("change feed disconnected: {0}")]
    Disconnected(String),
}

/// Synchronization errors.
///
/// Each one ends the entity stream it reaches. Cloned into every
/// subscriber's stream, so it only carries plain data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("change feed transport closed: {0}")]
    TransportClosed(String),

    /// Change events were skipped, so cached values may be stale.
    #[error("synchronizer fell behind the change feed, {0} events skipped")]
    Lagged(u64),

    #[error("event hub was shut down")]
    ShutDown,

    #[error("event hub is already attached to a change feed")]
    AlreadyInitialized,

    #[error("synchronizer for `{0}` used before initialize()")]
    NotInitialized(String),
}
