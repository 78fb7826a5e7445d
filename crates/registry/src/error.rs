//! Error types for registry operations.

use thiserror::Error;

/// Errors surfaced by registry backends.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum RegistryError {
    /// No service matched the query.
    #[error("service not found")]
    NotFound,

    /// The watcher was stopped; the stream has ended cleanly.
    #[error("watcher stopped")]
    WatcherStopped,

    /// The operation requires at least one node on the service.
    #[error("service requires at least one node")]
    MissingNodes,

    /// A specific service cannot be watched across the wildcard domain.
    #[error("cannot watch a service across domains")]
    CrossDomainWatch,

    /// A transient backend failure, propagated to the caller.
    #[error("registry backend error: {0}")]
    Backend(String),
}
