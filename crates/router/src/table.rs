//! The routing table: an in-memory map of routes with watchers and an
//! optional lookup fallback.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::error::RouterError;
use crate::event::{Event, EventType};
use crate::route::{QueryOptions, Route, Strategy};
use crate::watcher::{TableWatcher, WatchOptions, WatcherRegistry};

/// Fallback invoked when a service-specific query finds nothing: given the
/// service name, produce routes to seed the table with (typically from the
/// registry).
pub type FetchRoutes =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Vec<Route>, RouterError>> + Send + Sync>;

/// An in-memory routing table.
///
/// Routes are keyed by `(service, route hash)`: at most one route per hash
/// is stored per service, and metric or metadata changes to an existing
/// route are updates, not new routes. Every mutation emits one event to
/// every live watcher whose filter matches, before the mutation returns.
#[derive(Clone)]
pub struct RoutingTable {
    inner: Arc<TableInner>,
}

struct TableInner {
    routes: RwLock<HashMap<String, HashMap<u64, Route>>>,
    watchers: Arc<WatcherRegistry>,
    fetch: Option<FetchRoutes>,
}

impl Debug for RoutingTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("RoutingTable").finish_non_exhaustive()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    /// Creates an empty table with no lookup fallback.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates an empty table that consults `fetch` when a service-specific
    /// query finds nothing.
    #[must_use]
    pub fn with_fallback(fetch: FetchRoutes) -> Self {
        Self::build(Some(fetch))
    }

    fn build(fetch: Option<FetchRoutes>) -> Self {
        Self {
            inner: Arc::new(TableInner {
                routes: RwLock::new(HashMap::new()),
                watchers: Arc::new(WatcherRegistry::default()),
                fetch,
            }),
        }
    }

    /// Inserts a route.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateRoute`] when a route with the same
    /// hash already exists for the service.
    pub async fn create(&self, route: Route) -> Result<(), RouterError> {
        let hash = route.hash();
        let mut routes = self.inner.routes.write().await;
        let service_routes = routes.entry(route.service.clone()).or_default();
        if service_routes.contains_key(&hash) {
            return Err(RouterError::DuplicateRoute);
        }
        service_routes.insert(hash, route.clone());
        trace!(service = %route.service, address = %route.address, "route created");
        self.dispatch(Event::new(EventType::Create, route));
        Ok(())
    }

    /// Removes a route.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::RouteNotFound`] when no route with this hash
    /// exists.
    pub async fn delete(&self, route: Route) -> Result<(), RouterError> {
        let hash = route.hash();
        let mut routes = self.inner.routes.write().await;
        let Some(service_routes) = routes.get_mut(&route.service) else {
            return Err(RouterError::RouteNotFound);
        };
        if service_routes.remove(&hash).is_none() {
            return Err(RouterError::RouteNotFound);
        }
        if service_routes.is_empty() {
            routes.remove(&route.service);
        }
        trace!(service = %route.service, address = %route.address, "route deleted");
        self.dispatch(Event::new(EventType::Delete, route));
        Ok(())
    }

    /// Inserts or refreshes a route; metric and metadata changes land on the
    /// existing entry.
    pub async fn update(&self, route: Route) {
        let hash = route.hash();
        let mut routes = self.inner.routes.write().await;
        routes
            .entry(route.service.clone())
            .or_default()
            .insert(hash, route.clone());
        trace!(service = %route.service, address = %route.address, "route updated");
        self.dispatch(Event::new(EventType::Update, route));
    }

    /// Returns the routes matching `options`.
    ///
    /// A query for a specific service that finds nothing consults the
    /// fallback fetch once and re-evaluates; fallback failures are folded
    /// into the result.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::RouteNotFound`] when a specific service was
    /// asked for and no route matches. Serviceless queries return an empty
    /// vec instead.
    pub async fn query(&self, options: QueryOptions) -> Result<Vec<Route>, RouterError> {
        let routes = self.filter(&options).await;
        if !routes.is_empty() {
            return Ok(routes);
        }

        let Some(service) = &options.service else {
            return Ok(Vec::new());
        };

        if let Some(fetch) = &self.inner.fetch {
            debug!(%service, "no routes found, fetching from registry");
            match fetch(service.clone()).await {
                Ok(fetched) => {
                    for route in fetched {
                        match self.create(route).await {
                            Ok(()) | Err(RouterError::DuplicateRoute) => {}
                            Err(error) => debug!(%service, %error, "failed seeding fetched route"),
                        }
                    }
                }
                Err(error) => debug!(%service, %error, "route fetch failed"),
            }

            let routes = self.filter(&options).await;
            if !routes.is_empty() {
                return Ok(routes);
            }
        }

        Err(RouterError::RouteNotFound)
    }

    /// Opens a stream of table events.
    #[must_use]
    pub fn watch(&self, options: WatchOptions) -> TableWatcher {
        TableWatcher::register(&self.inner.watchers, options)
    }

    async fn filter(&self, options: &QueryOptions) -> Vec<Route> {
        let routes = self.inner.routes.read().await;

        let candidates: Vec<Route> = if let Some(service) = &options.service {
            routes
                .get(service)
                .map(|service_routes| {
                    service_routes
                        .values()
                        .filter(|route| options.matches(route))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        } else {
            routes
                .values()
                .flat_map(HashMap::values)
                .filter(|route| options.matches(route))
                .cloned()
                .collect()
        };

        apply_strategy(candidates, options.strategy)
    }

    fn dispatch(&self, event: Event) {
        let watchers = self
            .inner
            .watchers
            .read()
            .expect("watcher registry poisoned");
        for handle in watchers.values() {
            handle.deliver(&event);
        }
    }
}

/// Applies the advertisement strategy to an already predicate-filtered route
/// set.
fn apply_strategy(routes: Vec<Route>, strategy: Strategy) -> Vec<Route> {
    match strategy {
        Strategy::AdvertiseAll => routes,
        Strategy::AdvertiseNone => Vec::new(),
        Strategy::AdvertiseLocal => routes
            .into_iter()
            .filter(|route| route.link == crate::route::DEFAULT_LINK)
            .collect(),
        Strategy::AdvertiseBest => {
            let mut best: HashMap<String, Route> = HashMap::new();
            for route in routes {
                match best.get(&route.service) {
                    Some(current)
                        if (current.metric, current.hash()) <= (route.metric, route.hash()) => {}
                    _ => {
                        best.insert(route.service.clone(), route);
                    }
                }
            }
            best.into_values().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{DEFAULT_LINK, DEFAULT_LOCAL_METRIC};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn route(service: &str, address: &str) -> Route {
        Route {
            service: service.to_owned(),
            address: address.to_owned(),
            network: "inf".to_owned(),
            router: "r1".to_owned(),
            link: DEFAULT_LINK.to_owned(),
            metric: DEFAULT_LOCAL_METRIC,
            ..Route::default()
        }
    }

    #[tokio::test]
    async fn duplicate_creates_store_one_route() {
        let table = RoutingTable::new();
        let r = route("greeter", "10.0.0.1:8080");

        table.create(r.clone()).await.unwrap();
        for _ in 0..4 {
            let mut again = r.clone();
            again.metric = 99; // metric is not part of the identity
            assert_eq!(
                table.create(again).await,
                Err(RouterError::DuplicateRoute)
            );
        }

        let routes = table
            .query(QueryOptions::default().service("greeter"))
            .await
            .unwrap();
        assert_eq!(routes.len(), 1);
    }

    #[tokio::test]
    async fn delete_unknown_route_errors() {
        let table = RoutingTable::new();
        assert_eq!(
            table.delete(route("greeter", "10.0.0.1:8080")).await,
            Err(RouterError::RouteNotFound)
        );
    }

    #[tokio::test]
    async fn update_refreshes_metric() {
        let table = RoutingTable::new();
        let r = route("greeter", "10.0.0.1:8080");
        table.create(r.clone()).await.unwrap();

        let mut refreshed = r;
        refreshed.metric = 42;
        table.update(refreshed).await;

        let routes = table
            .query(QueryOptions::default().service("greeter"))
            .await
            .unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].metric, 42);
    }

    #[tokio::test]
    async fn every_mutation_reaches_every_matching_watcher() {
        let table = RoutingTable::new();
        let mut all = table.watch(WatchOptions::default());
        let mut filtered = table.watch(WatchOptions::default().service("greeter"));

        table.create(route("greeter", "10.0.0.1:8080")).await.unwrap();
        table.create(route("other", "10.0.0.2:8080")).await.unwrap();
        table.delete(route("greeter", "10.0.0.1:8080")).await.unwrap();

        assert_eq!(all.next().await.unwrap().event_type, EventType::Create);
        assert_eq!(all.next().await.unwrap().event_type, EventType::Create);
        assert_eq!(all.next().await.unwrap().event_type, EventType::Delete);

        let first = filtered.next().await.unwrap();
        assert_eq!(first.event_type, EventType::Create);
        assert_eq!(first.route.service, "greeter");
        let second = filtered.next().await.unwrap();
        assert_eq!(second.event_type, EventType::Delete);
        assert_eq!(second.route.service, "greeter");
    }

    #[tokio::test]
    async fn watcher_overflow_drops_oldest() {
        let table = RoutingTable::new();
        let mut watcher = table.watch(WatchOptions::default());

        for i in 0..crate::watcher::WATCHER_BUFFER + 10 {
            table
                .create(route("greeter", &format!("10.0.0.1:{i}")))
                .await
                .unwrap();
        }

        // the first ten events were dropped; the stream resumes at event 10
        let first = watcher.next().await.unwrap();
        assert_eq!(first.route.address, "10.0.0.1:10");
    }

    #[tokio::test]
    async fn stopped_watcher_ends_after_drain() {
        let table = RoutingTable::new();
        let mut watcher = table.watch(WatchOptions::default());

        table.create(route("greeter", "10.0.0.1:8080")).await.unwrap();
        watcher.stop();
        watcher.stop(); // idempotent

        assert!(watcher.next().await.is_ok());
        assert_eq!(watcher.next().await, Err(RouterError::WatcherStopped));
    }

    #[tokio::test]
    async fn strategies_filter_candidates() {
        let table = RoutingTable::new();
        let local = route("x", "10.0.0.1:8080");
        let mut peer = route("x", "10.0.0.2:8080");
        peer.link = "peer".to_owned();
        peer.metric = 5;

        table.create(local.clone()).await.unwrap();
        table.create(peer.clone()).await.unwrap();

        let best = table
            .query(
                QueryOptions::default()
                    .service("x")
                    .strategy(Strategy::AdvertiseBest),
            )
            .await
            .unwrap();
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].address, local.address);

        let only_local = table
            .query(
                QueryOptions::default()
                    .service("x")
                    .strategy(Strategy::AdvertiseLocal),
            )
            .await
            .unwrap();
        assert_eq!(only_local.len(), 1);
        assert_eq!(only_local[0].link, DEFAULT_LINK);

        let all = table
            .query(QueryOptions::default().service("x"))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        // a serviceless AdvertiseNone query is empty, not an error
        let none = table
            .query(QueryOptions::default().strategy(Strategy::AdvertiseNone))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn fallback_fetch_seeds_missing_service() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetch: FetchRoutes = Arc::new(move |service: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(vec![route(&service, "10.0.0.7:8080")]) })
        });

        let table = RoutingTable::with_fallback(fetch);
        let routes = table
            .query(QueryOptions::default().service("greeter"))
            .await
            .unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // now resident, the fallback is not consulted again
        table
            .query(QueryOptions::default().service("greeter"))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_errors_collapse_into_not_found() {
        let fetch: FetchRoutes = Arc::new(|_service: String| {
            Box::pin(async { Err(RouterError::Registry(
                switchyard_registry::RegistryError::Backend("unreachable".to_owned()),
            )) })
        });

        let table = RoutingTable::with_fallback(fetch);
        assert_eq!(
            table
                .query(QueryOptions::default().service("greeter"))
                .await,
            Err(RouterError::RouteNotFound)
        );
    }
}
