//! Router configuration.

use switchyard_registry::Registry;
use uuid::Uuid;

use crate::route::Strategy;

/// The default network a router participates in.
pub const DEFAULT_NETWORK: &str = "inf";

/// Configuration for a [`Router`](crate::Router).
#[derive(Clone, Debug)]
pub struct RouterOptions<R: Registry> {
    /// Unique identity of this router; stamped onto every route it
    /// originates.
    pub id: String,

    /// Next hop for the default route. `None` means no default route is
    /// installed.
    pub gateway: Option<String>,

    /// The network this router participates in.
    pub network: String,

    /// The registry the routing table is synchronized against.
    pub registry: R,

    /// Which routes get advertised to subscribers.
    pub advertise: Strategy,

    /// Eagerly populate the table from the registry at start rather than
    /// on demand.
    pub prewarm: bool,
}

impl<R: Registry> RouterOptions<R> {
    /// Options with a random id and defaults for everything else.
    #[must_use]
    pub fn new(registry: R) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            gateway: None,
            network: DEFAULT_NETWORK.to_owned(),
            registry,
            advertise: Strategy::default(),
            prewarm: false,
        }
    }

    /// Sets the router identity.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the default-route gateway.
    #[must_use]
    pub fn gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = Some(gateway.into());
        self
    }

    /// Sets the network.
    #[must_use]
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    /// Sets the advertisement strategy.
    #[must_use]
    pub const fn advertise(mut self, strategy: Strategy) -> Self {
        self.advertise = strategy;
        self
    }

    /// Enables prewarming.
    #[must_use]
    pub const fn prewarm(mut self, prewarm: bool) -> Self {
        self.prewarm = prewarm;
        self
    }
}
