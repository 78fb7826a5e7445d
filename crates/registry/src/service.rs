//! The registry data model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::WILDCARD_DOMAIN;

/// Metadata key under which a service records the domain it was registered
/// in, so wildcard scans can recover it.
pub const DOMAIN_METADATA_KEY: &str = "domain";

/// A service as known to the registry: a name plus the nodes serving it.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Service {
    /// Logical service name.
    pub name: String,

    /// Version tag. Multiple versions of a service coexist as separate
    /// entries.
    #[serde(default)]
    pub version: String,

    /// Free-form metadata. The registry itself records the domain here.
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Endpoints exposed by the service.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,

    /// Nodes currently serving this service.
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Service {
    /// The domain this service was registered in, falling back to the
    /// wildcard when the metadata does not record one.
    #[must_use]
    pub fn domain(&self) -> &str {
        self.metadata
            .get(DOMAIN_METADATA_KEY)
            .filter(|domain| !domain.is_empty())
            .map_or(WILDCARD_DOMAIN, String::as_str)
    }

    /// Records `domain` in the service metadata.
    pub fn set_domain(&mut self, domain: impl Into<String>) {
        self.metadata
            .insert(DOMAIN_METADATA_KEY.to_owned(), domain.into());
    }
}

/// A single node serving a service.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Node {
    /// Unique node id.
    pub id: String,

    /// Reachable `host:port` of the node.
    pub address: String,

    /// Free-form node metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A named endpoint exposed by a service.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Endpoint {
    /// Endpoint name.
    pub name: String,

    /// Free-form endpoint metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}
