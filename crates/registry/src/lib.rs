//! Abstract service registry contract.
//!
//! A registry is a directory of services and the nodes serving them. Nodes are
//! registered with a TTL lease and disappear when their registrant stops
//! renewing. Backends implement the [`Registry`] trait; consumers observe
//! changes through a [`Watcher`] stream.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod service;

pub use error::RegistryError;
pub use service::{Endpoint, Node, Service};

use std::fmt::{self, Debug};
use std::time::Duration;

use async_trait::async_trait;

/// The domain used when none is specified.
pub const DEFAULT_DOMAIN: &str = "inf";

/// The reserved domain name matching every domain.
pub const WILDCARD_DOMAIN: &str = "*";

/// Options for [`Registry::register`].
#[derive(Clone, Debug, Default)]
pub struct RegisterOptions {
    /// Domain to register the service in. Defaults to [`DEFAULT_DOMAIN`].
    pub domain: Option<String>,

    /// Lease TTL for the registered nodes. `None` (or zero) means no expiry.
    pub ttl: Option<Duration>,
}

impl RegisterOptions {
    /// Sets the domain.
    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Sets the lease TTL.
    #[must_use]
    pub const fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Options for [`Registry::deregister`].
#[derive(Clone, Debug, Default)]
pub struct DeregisterOptions {
    /// Domain to deregister the service from. Defaults to [`DEFAULT_DOMAIN`].
    pub domain: Option<String>,
}

impl DeregisterOptions {
    /// Sets the domain.
    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// Options for [`Registry::get_service`].
#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    /// Domain to look the service up in. [`WILDCARD_DOMAIN`] scans all
    /// domains. Defaults to [`DEFAULT_DOMAIN`].
    pub domain: Option<String>,
}

impl GetOptions {
    /// Sets the domain.
    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// Options for [`Registry::list_services`].
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Domain to list. [`WILDCARD_DOMAIN`] lists every domain. Defaults to
    /// [`DEFAULT_DOMAIN`].
    pub domain: Option<String>,
}

impl ListOptions {
    /// Sets the domain.
    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// Options for [`Registry::watch`].
#[derive(Clone, Debug, Default)]
pub struct WatchOptions {
    /// Domain to watch. [`WILDCARD_DOMAIN`] watches every domain. Defaults to
    /// [`DEFAULT_DOMAIN`].
    pub domain: Option<String>,

    /// Restrict the stream to a single service. Cannot be combined with the
    /// wildcard domain.
    pub service: Option<String>,
}

impl WatchOptions {
    /// Sets the domain.
    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Restricts the watch to a single service.
    #[must_use]
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }
}

/// The change kind carried by a [`WatchResult`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WatchAction {
    /// A service node appeared.
    Create,
    /// A service node changed.
    Update,
    /// A service node was removed or its lease expired.
    Delete,
}

impl fmt::Display for WatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A single entry emitted by a registry watcher.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WatchResult {
    /// What happened.
    pub action: WatchAction,

    /// The service the change applies to.
    pub service: Service,
}

/// A stream of registry changes.
///
/// `next` yields entries in the order the backend produced them. After
/// [`Watcher::stop`], or once the backend ends the stream, `next` returns
/// [`RegistryError::WatcherStopped`].
#[async_trait]
pub trait Watcher: Send + 'static {
    /// Returns the next registry change.
    async fn next(&mut self) -> Result<WatchResult, RegistryError>;

    /// Stops the watcher. Idempotent.
    async fn stop(&mut self);
}

/// A service registry.
///
/// Implementations are cheaply cloneable handles onto shared state, safe to
/// use from many tasks at once.
#[async_trait]
pub trait Registry: Clone + Debug + Send + Sync + 'static {
    /// The watcher type produced by [`Registry::watch`].
    type Watcher: Watcher;

    /// Registers every node of `service`, renewing leases for nodes that are
    /// already present. Idempotent per `(domain, service, node id)`.
    async fn register(
        &self,
        service: &Service,
        options: RegisterOptions,
    ) -> Result<(), RegistryError>;

    /// Removes every listed node of `service`. Absent nodes are not an error.
    async fn deregister(
        &self,
        service: &Service,
        options: DeregisterOptions,
    ) -> Result<(), RegistryError>;

    /// Returns all services named `name`, grouped per `(domain, version)`.
    async fn get_service(
        &self,
        name: &str,
        options: GetOptions,
    ) -> Result<Vec<Service>, RegistryError>;

    /// Returns one entry per `(domain, service, version)` with aggregated
    /// nodes, sorted by name.
    async fn list_services(&self, options: ListOptions) -> Result<Vec<Service>, RegistryError>;

    /// Opens a change stream.
    async fn watch(&self, options: WatchOptions) -> Result<Self::Watcher, RegistryError>;
}
