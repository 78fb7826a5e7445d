//! Dynamic service router.
//!
//! The router is the core of the control plane's data-plane steering: a
//! [`RoutingTable`] aggregating reachability (service name to node
//! endpoints) and a [`Router`] engine that keeps the table synchronized
//! against a service registry, suppresses flapping routes, and exchanges
//! route advertisements with peer routers.
//!
//! ```no_run
//! use switchyard_registry_memory::MemoryRegistry;
//! use switchyard_router::{QueryOptions, Router, RouterOptions};
//!
//! # async fn example() -> Result<(), switchyard_router::RouterError> {
//! let registry = MemoryRegistry::new();
//! let router = Router::new(RouterOptions::new(registry).prewarm(true)).await?;
//!
//! let routes = router
//!     .lookup(QueryOptions::default().service("greeter"))
//!     .await?;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod event;
mod options;
mod route;
mod router;
mod table;
mod watcher;

pub use error::RouterError;
pub use event::{Advert, AdvertType, Event, EventType};
pub use options::{RouterOptions, DEFAULT_NETWORK};
pub use route::{QueryOptions, Route, Strategy, DEFAULT_LINK, DEFAULT_LOCAL_METRIC};
pub use router::{Router, ADVERTISE_EVENTS_TICK, DEFAULT_ADVERT_TTL};
pub use table::{FetchRoutes, RoutingTable};
pub use watcher::{TableWatcher, WatchOptions};
