//! The router engine: keeps the routing table synchronized against a service
//! registry and advertises coalesced route changes to subscribers.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use switchyard_registry::{
    GetOptions, ListOptions, Registry, RegistryError, Service, WatchAction,
    WatchOptions as RegistryWatchOptions, Watcher, WILDCARD_DOMAIN,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::RouterError;
use crate::event::{Advert, AdvertType, Event, EventType};
use crate::options::RouterOptions;
use crate::route::{QueryOptions, Route, Strategy, DEFAULT_LINK, DEFAULT_LOCAL_METRIC};
use crate::table::{FetchRoutes, RoutingTable};
use crate::watcher::{TableWatcher, WatchOptions};

/// Interval at which coalesced route events are advertised.
pub const ADVERTISE_EVENTS_TICK: Duration = Duration::from_secs(10);

/// Validity attached to published adverts.
pub const DEFAULT_ADVERT_TTL: Duration = Duration::from_secs(120);

/// Advert subscriber channel capacity.
const ADVERT_BUFFER: usize = 128;

/// Delay before a failed watcher is reopened.
const WATCH_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Default)]
struct State {
    running: bool,
    advertising: bool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    event_tx: Option<mpsc::Sender<Event>>,
}

/// A dynamic service router.
///
/// The router watches the registry across all domains and mirrors every
/// service node as a local route. Route changes are coalesced over a
/// [tick](ADVERTISE_EVENTS_TICK) so that a route flapping within one window
/// collapses to a single edge, then published to advert subscribers. Adverts
/// received from peers are applied back onto the table, skipping routes this
/// router originated.
///
/// The router is a cheap handle onto shared state; clones drive the same
/// instance.
#[derive(Clone)]
pub struct Router<R: Registry> {
    options: Arc<RwLock<RouterOptions<R>>>,
    table: RoutingTable,
    state: Arc<Mutex<State>>,
    subscribers: Arc<StdRwLock<HashMap<Uuid, mpsc::Sender<Advert>>>>,
}

impl<R: Registry> Debug for Router<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

impl<R: Registry> Router<R> {
    /// Constructs a router and starts it.
    ///
    /// # Errors
    ///
    /// Returns an error when prewarming or the default gateway route fail.
    pub async fn new(options: RouterOptions<R>) -> Result<Self, RouterError> {
        let options = Arc::new(RwLock::new(options));

        // the table consults the registry when a lookup misses; read the
        // options at call time so `init` swaps take effect
        let fetch: FetchRoutes = {
            let options = Arc::clone(&options);
            Arc::new(move |service: String| {
                let options = Arc::clone(&options);
                async move {
                    let (registry, id) = {
                        let options = options.read().await;
                        (options.registry.clone(), options.id.clone())
                    };
                    fetch_routes(&registry, &id, &service).await
                }
                .boxed()
            })
        };

        let router = Self {
            options,
            table: RoutingTable::with_fallback(fetch),
            state: Arc::new(Mutex::new(State::default())),
            subscribers: Arc::new(StdRwLock::new(HashMap::new())),
        };

        {
            let mut state = router.state.lock().await;
            router.start(&mut state).await?;
        }
        Ok(router)
    }

    /// Stops the router and restarts it with `options`. A call on a stopped
    /// router starts it.
    ///
    /// # Errors
    ///
    /// Returns an error when the restart fails.
    pub async fn init(&self, options: RouterOptions<R>) -> Result<(), RouterError> {
        self.close().await?;
        {
            let mut current = self.options.write().await;
            *current = options;
        }
        let mut state = self.state.lock().await;
        self.start(&mut state).await
    }

    /// The routing table.
    #[must_use]
    pub const fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// A snapshot of the current options.
    pub async fn options(&self) -> RouterOptions<R> {
        self.options.read().await.clone()
    }

    /// Whether the router is running.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Queries the routing table.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::RouteNotFound`] when a specific service was
    /// asked for and nothing matches, even after the registry fallback.
    pub async fn lookup(&self, query: QueryOptions) -> Result<Vec<Route>, RouterError> {
        self.table.query(query).await
    }

    /// Opens a stream of routing table events.
    #[must_use]
    pub fn watch(&self, options: WatchOptions) -> TableWatcher {
        self.table.watch(options)
    }

    /// Subscribes to route advertisements.
    ///
    /// The first subscription starts the advertisement pipeline and receives
    /// an [`AdvertType::Announce`] advert carrying a full table snapshot;
    /// every subscription receives the coalesced [`AdvertType::RouteUpdate`]
    /// adverts that follow.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NotRunning`] when the router is stopped.
    pub async fn advertise(&self) -> Result<mpsc::Receiver<Advert>, RouterError> {
        let mut state = self.state.lock().await;
        if !state.running {
            return Err(RouterError::NotRunning);
        }

        if state.advertising {
            let (tx, rx) = mpsc::channel(ADVERT_BUFFER);
            self.add_subscriber(tx);
            return Ok(rx);
        }

        // first subscriber: snapshot the table for the announcement before
        // anything else can mutate it
        let events = self.flush_route_events(EventType::Create).await?;

        let (tx, rx) = mpsc::channel(ADVERT_BUFFER);
        self.add_subscriber(tx);

        let (event_tx, event_rx) = mpsc::channel(ADVERT_BUFFER);
        state.event_tx = Some(event_tx.clone());
        state.advertising = true;

        let token = state.shutdown.clone();
        {
            let router = self.clone();
            let token = token.clone();
            state.tasks.spawn(async move {
                router
                    .publish_advert(AdvertType::Announce, events, &token)
                    .await;
            });
        }
        {
            let router = self.clone();
            let token = token.clone();
            state.tasks.spawn(async move {
                router.table_watch_supervisor(event_tx, token).await;
            });
        }
        {
            let router = self.clone();
            let tracker = state.tasks.clone();
            state.tasks.spawn(async move {
                router.advertise_events(event_rx, token, tracker).await;
            });
        }

        Ok(rx)
    }

    /// Applies a peer's advert onto the routing table.
    ///
    /// Events are replayed in timestamp order. Events for routes this router
    /// originated are skipped, so adverts echoed back by peers cannot loop.
    ///
    /// # Errors
    ///
    /// The first non-benign table error aborts processing of the advert and
    /// is returned; the router keeps running.
    pub async fn process(&self, advert: &Advert) -> Result<(), RouterError> {
        let mut events = advert.events.clone();
        events.sort_by_key(|event| event.timestamp);

        let id = self.options.read().await.id.clone();
        trace!(router = %id, from = %advert.id, events = events.len(), "processing advert");

        for event in events {
            if event.route.router == id {
                continue;
            }
            trace!(
                action = %event.event_type,
                service = %event.route.service,
                origin = %event.route.router,
                "applying advert event"
            );
            self.manage_route(event.route, event.event_type).await?;
        }
        Ok(())
    }

    /// Stops the router: cancels every supervised task, waits for them to
    /// unwind, and closes every advert subscriber. Idempotent.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` keeps the signature stable for
    /// implementations with fallible teardown.
    pub async fn close(&self) -> Result<(), RouterError> {
        let mut state = self.state.lock().await;
        if !state.running {
            return Ok(());
        }
        let id = self.options.read().await.id.clone();
        info!(%id, "closing router");

        state.shutdown.cancel();
        state.tasks.close();
        state.tasks.wait().await;

        // drop the event pipeline and hang up on every subscriber
        state.event_tx = None;
        state.advertising = false;
        self.subscribers
            .write()
            .expect("subscriber registry poisoned")
            .clear();

        state.running = false;
        Ok(())
    }

    /// Starts the router. Must be called with the state lock held.
    async fn start(&self, state: &mut State) -> Result<(), RouterError> {
        if state.running {
            return Ok(());
        }

        let (id, gateway, prewarm) = {
            let options = self.options.read().await;
            (options.id.clone(), options.gateway.clone(), options.prewarm)
        };
        info!(%id, prewarm, "starting router");

        if prewarm {
            self.create_registry_routes().await?;
        }

        if let Some(gateway) = gateway {
            let route = Route {
                service: "*".to_owned(),
                version: String::new(),
                address: "*".to_owned(),
                gateway,
                network: "*".to_owned(),
                router: id,
                link: DEFAULT_LINK.to_owned(),
                metric: DEFAULT_LOCAL_METRIC,
                metadata: HashMap::new(),
            };
            // a restart finds the default route still resident
            match self.table.create(route).await {
                Ok(()) | Err(RouterError::DuplicateRoute) => {}
                Err(error) => return Err(error),
            }
        }

        state.shutdown = CancellationToken::new();
        state.tasks = TaskTracker::new();

        let router = self.clone();
        let token = state.shutdown.clone();
        state.tasks.spawn(async move {
            router.registry_watch_supervisor(token).await;
        });

        state.running = true;
        Ok(())
    }

    /// Mirrors every service currently in the registry as local routes.
    async fn create_registry_routes(&self) -> Result<(), RouterError> {
        let registry = self.options.read().await.registry.clone();
        let services = registry
            .list_services(ListOptions::default().domain(WILDCARD_DOMAIN))
            .await?;
        debug!(count = services.len(), "prewarming routing table");

        for service in services {
            let domain = service.domain().to_owned();
            let Ok(records) = registry
                .get_service(&service.name, GetOptions::default().domain(domain.as_str()))
                .await
            else {
                // the service vanished between listing and fetching
                continue;
            };
            for record in records {
                self.manage_routes(&record, WatchAction::Create, &domain)
                    .await?;
            }
        }
        Ok(())
    }

    /// Applies a registry change to every node of `service`.
    async fn manage_routes(
        &self,
        service: &Service,
        action: WatchAction,
        network: &str,
    ) -> Result<(), RouterError> {
        let id = self.options.read().await.id.clone();

        for node in &service.nodes {
            let route = Route {
                service: service.name.clone(),
                version: String::new(),
                address: node.address.clone(),
                gateway: String::new(),
                network: network.to_owned(),
                router: id.clone(),
                link: DEFAULT_LINK.to_owned(),
                metric: DEFAULT_LOCAL_METRIC,
                metadata: node.metadata.clone(),
            };
            let event_type = match action {
                WatchAction::Create => EventType::Create,
                WatchAction::Update => EventType::Update,
                WatchAction::Delete => EventType::Delete,
            };
            self.manage_route(route, event_type).await?;
        }
        Ok(())
    }

    /// Applies a single route action, tolerating the benign error classes:
    /// re-creating an existing route and deleting a missing one are no-ops.
    async fn manage_route(&self, route: Route, action: EventType) -> Result<(), RouterError> {
        match action {
            EventType::Create => match self.table.create(route).await {
                Ok(()) | Err(RouterError::DuplicateRoute) => Ok(()),
                Err(error) => Err(error),
            },
            EventType::Delete => match self.table.delete(route).await {
                Ok(()) | Err(RouterError::RouteNotFound) => Ok(()),
                Err(error) => Err(error),
            },
            EventType::Update => {
                self.table.update(route).await;
                Ok(())
            }
        }
    }

    /// One event per route currently advertisable under the configured
    /// strategy.
    async fn flush_route_events(&self, event_type: EventType) -> Result<Vec<Event>, RouterError> {
        let strategy = self.options.read().await.advertise;
        let routes = match self
            .table
            .query(QueryOptions::default().strategy(strategy))
            .await
        {
            Ok(routes) => routes,
            Err(RouterError::RouteNotFound) => Vec::new(),
            Err(error) => return Err(error),
        };
        debug!(count = routes.len(), %strategy, "flushing route events");

        Ok(routes
            .into_iter()
            .map(|route| Event::new(event_type, route))
            .collect())
    }

    fn add_subscriber(&self, tx: mpsc::Sender<Advert>) {
        self.subscribers
            .write()
            .expect("subscriber registry poisoned")
            .insert(Uuid::new_v4(), tx);
    }

    /// Sleeps out the watcher retry backoff; `false` when the router shut
    /// down in the meantime.
    async fn backoff(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            () = token.cancelled() => false,
            () = tokio::time::sleep(WATCH_BACKOFF) => true,
        }
    }

    /// Keeps a wildcard registry watcher open, applying its events to the
    /// table and reopening it with a backoff on failure.
    async fn registry_watch_supervisor(&self, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                return;
            }

            let registry = self.options.read().await.registry.clone();
            let watcher = tokio::select! {
                () = token.cancelled() => return,
                result = registry.watch(RegistryWatchOptions::default().domain(WILDCARD_DOMAIN)) => {
                    match result {
                        Ok(watcher) => watcher,
                        Err(error) => {
                            warn!(%error, "failed creating registry watcher");
                            if self.backoff(&token).await { continue } else { return }
                        }
                    }
                }
            };

            if let Err(error) = self.watch_registry(watcher, &token).await {
                warn!(%error, "error watching the registry");
                if !self.backoff(&token).await {
                    return;
                }
            }
            // a cleanly stopped watcher is reopened immediately
        }
    }

    /// Consumes a registry watcher until it stops or fails.
    async fn watch_registry(
        &self,
        mut watcher: R::Watcher,
        token: &CancellationToken,
    ) -> Result<(), RouterError> {
        loop {
            let result = tokio::select! {
                () = token.cancelled() => {
                    watcher.stop().await;
                    return Ok(());
                }
                result = watcher.next() => result,
            };

            match result {
                Ok(change) => {
                    trace!(
                        service = %change.service.name,
                        action = %change.action,
                        "registry watch event"
                    );
                    let domain = change.service.domain().to_owned();
                    self.manage_routes(&change.service, change.action, &domain)
                        .await?;
                }
                Err(RegistryError::WatcherStopped) => return Ok(()),
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Pipes table events into the coalescer, reopening the table watcher
    /// whenever it ends.
    async fn table_watch_supervisor(&self, event_tx: mpsc::Sender<Event>, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                return;
            }
            let mut watcher = self.table.watch(WatchOptions::default());

            loop {
                let result = tokio::select! {
                    () = token.cancelled() => {
                        watcher.stop();
                        return;
                    }
                    result = watcher.next() => result,
                };

                match result {
                    Ok(event) => {
                        let sent = tokio::select! {
                            () = token.cancelled() => return,
                            sent = event_tx.send(event) => sent,
                        };
                        if sent.is_err() {
                            return; // coalescer is gone
                        }
                    }
                    Err(_) => break, // stream ended; reopen
                }
            }
        }
    }

    /// Coalesces table events and advertises the survivors on every tick.
    ///
    /// Opposite edges for the same route collapse to the latest one, so a
    /// route flapping within a tick advertises as a single create or delete;
    /// repeats of the same edge are dropped.
    async fn advertise_events(
        &self,
        mut event_rx: mpsc::Receiver<Event>,
        token: CancellationToken,
        tracker: TaskTracker,
    ) {
        let mut pending: HashMap<u64, Event> = HashMap::new();
        let start = tokio::time::Instant::now() + ADVERTISE_EVENTS_TICK;
        let mut ticker = tokio::time::interval_at(start, ADVERTISE_EVENTS_TICK);

        loop {
            tokio::select! {
                () = token.cancelled() => return,
                _ = ticker.tick() => {
                    let strategy = self.options.read().await.advertise;
                    if strategy == Strategy::AdvertiseNone {
                        continue;
                    }

                    let mut events = Vec::new();
                    pending.retain(|_, event| {
                        // non-local routes stay parked while only local
                        // routes are advertised
                        if strategy == Strategy::AdvertiseLocal
                            && event.route.link != DEFAULT_LINK
                        {
                            return true;
                        }
                        events.push(event.clone());
                        false
                    });

                    if events.is_empty() {
                        continue;
                    }
                    debug!(count = events.len(), "publishing coalesced route events");
                    let router = self.clone();
                    let token = token.clone();
                    tracker.spawn(async move {
                        router
                            .publish_advert(AdvertType::RouteUpdate, events, &token)
                            .await;
                    });
                }
                maybe = event_rx.recv() => {
                    let Some(event) = maybe else { return };

                    let strategy = self.options.read().await.advertise;
                    if strategy == Strategy::AdvertiseNone {
                        continue;
                    }
                    if strategy == Strategy::AdvertiseLocal
                        && event.route.link != DEFAULT_LINK
                    {
                        continue;
                    }

                    trace!(
                        action = %event.event_type,
                        service = %event.route.service,
                        "coalescing table event"
                    );
                    match pending.entry(event.route.hash()) {
                        Entry::Vacant(vacant) => {
                            vacant.insert(event);
                        }
                        Entry::Occupied(mut occupied) => {
                            if occupied.get().event_type != event.event_type {
                                occupied.insert(event);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Publishes an advert to every subscriber, racing each send against the
    /// exit signal. Subscribers that hung up are pruned.
    async fn publish_advert(
        &self,
        advert_type: AdvertType,
        events: Vec<Event>,
        token: &CancellationToken,
    ) {
        let id = self.options.read().await.id.clone();
        let advert = Advert {
            id,
            advert_type,
            ttl: DEFAULT_ADVERT_TTL,
            timestamp: Utc::now(),
            events,
        };

        let subscribers: Vec<(Uuid, mpsc::Sender<Advert>)> = self
            .subscribers
            .read()
            .expect("subscriber registry poisoned")
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut closed = Vec::new();
        for (subscriber, tx) in subscribers {
            tokio::select! {
                () = token.cancelled() => return,
                result = tx.send(advert.clone()) => {
                    if result.is_err() {
                        closed.push(subscriber);
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self
                .subscribers
                .write()
                .expect("subscriber registry poisoned");
            for subscriber in closed {
                subscribers.remove(&subscriber);
            }
        }
    }
}

/// Builds local routes for `service` from the registry, for the table's
/// lookup fallback.
async fn fetch_routes<R: Registry>(
    registry: &R,
    router_id: &str,
    service: &str,
) -> Result<Vec<Route>, RouterError> {
    let services = match registry
        .get_service(service, GetOptions::default().domain(WILDCARD_DOMAIN))
        .await
    {
        Ok(services) => services,
        Err(RegistryError::NotFound) => return Ok(Vec::new()),
        Err(error) => return Err(error.into()),
    };

    let mut routes = Vec::new();
    for record in services {
        let domain = record.domain().to_owned();
        for node in &record.nodes {
            routes.push(Route {
                service: record.name.clone(),
                version: String::new(),
                address: node.address.clone(),
                gateway: String::new(),
                network: domain.clone(),
                router: router_id.to_owned(),
                link: DEFAULT_LINK.to_owned(),
                metric: DEFAULT_LOCAL_METRIC,
                metadata: node.metadata.clone(),
            });
        }
    }
    Ok(routes)
}
