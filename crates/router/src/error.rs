//! Error types for router operations.

use switchyard_registry::RegistryError;
use thiserror::Error;

/// Errors surfaced by the routing table and router engine.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum RouterError {
    /// A route with the same identity hash already exists.
    #[error("duplicate route")]
    DuplicateRoute,

    /// No route matched.
    #[error("route not found")]
    RouteNotFound,

    /// The watcher was stopped; the stream has ended cleanly.
    #[error("watcher stopped")]
    WatcherStopped,

    /// The operation requires a running router.
    #[error("router is not running")]
    NotRunning,

    /// A registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
