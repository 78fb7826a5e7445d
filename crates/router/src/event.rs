//! Table events and the advert wire records built from them.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::route::Route;

/// The mutation kind carried by an [`Event`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// A route was inserted.
    Create,
    /// A route's metric or metadata changed.
    Update,
    /// A route was removed.
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A single routing table mutation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Event {
    /// What happened.
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// When the mutation was applied.
    pub timestamp: DateTime<Utc>,

    /// The route the mutation applies to.
    pub route: Route,
}

impl Event {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(event_type: EventType, route: Route) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            route,
        }
    }
}

/// The advert kind.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum AdvertType {
    /// Full table snapshot, sent once on subscription.
    Announce,

    /// Coalesced deltas since the previous advert.
    RouteUpdate,
}

impl fmt::Display for AdvertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Announce => write!(f, "announce"),
            Self::RouteUpdate => write!(f, "route update"),
        }
    }
}

/// A batch of route events published to advert subscribers.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Advert {
    /// Identity of the originating router.
    pub id: String,

    /// The advert kind.
    #[serde(rename = "type")]
    pub advert_type: AdvertType,

    /// How long receivers should consider the advert valid.
    pub ttl: Duration,

    /// When the advert was published.
    pub timestamp: DateTime<Utc>,

    /// The batched events.
    pub events: Vec<Event>,
}
