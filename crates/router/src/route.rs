//! Routes and route queries.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;

use serde::{Deserialize, Serialize};

/// Link name for routes observed in the local registry.
pub const DEFAULT_LINK: &str = "local";

/// Route cost for a directly reachable route.
pub const DEFAULT_LOCAL_METRIC: i64 = 1;

/// A unit of reachability: one way to reach a service.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Route {
    /// Destination service name.
    pub service: String,

    /// Service version tag.
    #[serde(default)]
    pub version: String,

    /// `host:port` of the terminal node, or `*` for a wildcard/gateway
    /// route.
    pub address: String,

    /// Next-hop address; empty when the route is directly reachable.
    #[serde(default)]
    pub gateway: String,

    /// Logical network the route belongs to, or `*`.
    pub network: String,

    /// Identity of the router that originated the route.
    pub router: String,

    /// Locality tag: [`DEFAULT_LINK`] for directly observed routes,
    /// otherwise the inter-router link name.
    pub link: String,

    /// Route cost; lower is better.
    pub metric: i64,

    /// Free-form route metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Route {
    /// 64-bit FNV-1a identity over the route's semantic key. Metric and
    /// metadata are deliberately excluded: routes differing only there are
    /// the same route, updated.
    #[must_use]
    pub fn hash(&self) -> u64 {
        let mut hasher = fnv::FnvHasher::default();
        hasher.write(self.service.as_bytes());
        hasher.write(self.version.as_bytes());
        hasher.write(self.address.as_bytes());
        hasher.write(self.gateway.as_bytes());
        hasher.write(self.network.as_bytes());
        hasher.write(self.router.as_bytes());
        hasher.write(self.link.as_bytes());
        hasher.finish()
    }
}

/// Filter applied when selecting routes to advertise.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum Strategy {
    /// Advertise every route.
    #[default]
    AdvertiseAll,

    /// Advertise only the lowest-metric route per service.
    AdvertiseBest,

    /// Advertise only directly observed routes.
    AdvertiseLocal,

    /// Advertise nothing.
    AdvertiseNone,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdvertiseAll => write!(f, "all"),
            Self::AdvertiseBest => write!(f, "best"),
            Self::AdvertiseLocal => write!(f, "local"),
            Self::AdvertiseNone => write!(f, "none"),
        }
    }
}

/// Predicates for querying the routing table. Unset fields match anything.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    /// Match a destination service.
    pub service: Option<String>,

    /// Match a node address.
    pub address: Option<String>,

    /// Match a gateway.
    pub gateway: Option<String>,

    /// Match a network.
    pub network: Option<String>,

    /// Match an originating router.
    pub router: Option<String>,

    /// Match a link.
    pub link: Option<String>,

    /// Advertisement filter applied after the predicates.
    pub strategy: Strategy,
}

impl QueryOptions {
    /// Matches a destination service.
    #[must_use]
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Matches a node address.
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Matches a gateway.
    #[must_use]
    pub fn gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = Some(gateway.into());
        self
    }

    /// Matches a network.
    #[must_use]
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Matches an originating router.
    #[must_use]
    pub fn router(mut self, router: impl Into<String>) -> Self {
        self.router = Some(router.into());
        self
    }

    /// Matches a link.
    #[must_use]
    pub fn link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    /// Sets the advertisement filter.
    #[must_use]
    pub const fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub(crate) fn matches(&self, route: &Route) -> bool {
        fn field(want: Option<&String>, got: &str) -> bool {
            want.is_none_or(|want| want == got)
        }

        field(self.service.as_ref(), &route.service)
            && field(self.address.as_ref(), &route.address)
            && field(self.gateway.as_ref(), &route.gateway)
            && field(self.network.as_ref(), &route.network)
            && field(self.router.as_ref(), &route.router)
            && field(self.link.as_ref(), &route.link)
    }
}
