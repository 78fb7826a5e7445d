//! In-memory implementation of the service registry contract.
//!
//! Nodes registered with a TTL are leased: every re-registration renews the
//! lease, and a background prune task expires nodes whose registrants went
//! away, emitting `delete` events to watchers exactly like a durable backend
//! would. The registry is a cheap handle onto shared state and can be cloned
//! across tasks freely.
//!
//! Construction spawns the prune task and therefore requires a running Tokio
//! runtime.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use switchyard_registry::{
    DeregisterOptions, GetOptions, ListOptions, Node, RegisterOptions, Registry, RegistryError,
    Service, WatchAction, WatchOptions, WatchResult, Watcher, DEFAULT_DOMAIN, WILDCARD_DOMAIN,
};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

/// Cadence of the lease-expiry sweep.
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// An in-memory service registry.
#[derive(Clone)]
pub struct MemoryRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    records: Mutex<Domains>,
    watchers: Arc<StdMutex<HashMap<Uuid, WatcherEntry>>>,
    shutdown: CancellationToken,
}

/// `domain -> service name -> version -> record`.
type Domains = HashMap<String, HashMap<String, HashMap<String, ServiceRecord>>>;

struct ServiceRecord {
    service: Service,
    nodes: HashMap<String, NodeRecord>,
}

struct NodeRecord {
    node: Node,
    ttl: Option<Duration>,
    last_renewed: Instant,
}

struct WatcherEntry {
    domain: String,
    service: Option<String>,
    tx: mpsc::UnboundedSender<WatchResult>,
}

impl NodeRecord {
    fn expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) if !ttl.is_zero() => now.duration_since(self.last_renewed) >= ttl,
            _ => false,
        }
    }
}

impl ServiceRecord {
    /// The service with its currently live nodes attached.
    fn snapshot(&self, now: Instant) -> Service {
        let mut service = self.service.clone();
        service.nodes = self
            .nodes
            .values()
            .filter(|record| !record.expired(now))
            .map(|record| record.node.clone())
            .collect();
        service
    }
}

impl MemoryRegistry {
    /// Creates an empty registry and spawns its lease-expiry task.
    #[must_use]
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            records: Mutex::new(HashMap::new()),
            watchers: Arc::new(StdMutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        });

        // the task holds a weak handle so dropping the last registry clone
        // tears it down
        let prune = Arc::downgrade(&inner);
        let token = inner.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    _ = interval.tick() => {
                        let Some(registry) = prune.upgrade() else { return };
                        registry.expire_leases().await;
                    }
                }
            }
        });

        Self { inner }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MemoryRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MemoryRegistry").finish_non_exhaustive()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Inner {
    /// Removes nodes whose lease lapsed, emitting `delete` for each batch.
    async fn expire_leases(&self) {
        let now = Instant::now();
        let mut events = Vec::new();

        let mut records = self.records.lock().await;
        for (domain, services) in records.iter_mut() {
            for versions in services.values_mut() {
                for record in versions.values_mut() {
                    let expired: Vec<String> = record
                        .nodes
                        .iter()
                        .filter(|(_, node)| node.expired(now))
                        .map(|(id, _)| id.clone())
                        .collect();
                    if expired.is_empty() {
                        continue;
                    }

                    let mut service = record.service.clone();
                    for id in expired {
                        if let Some(node) = record.nodes.remove(&id) {
                            service.nodes.push(node.node);
                        }
                    }
                    debug!(
                        %domain,
                        service = %service.name,
                        nodes = service.nodes.len(),
                        "expiring leased nodes"
                    );
                    events.push((domain.clone(), service));
                }
                versions.retain(|_, record| !record.nodes.is_empty());
            }
            services.retain(|_, versions| !versions.is_empty());
        }
        records.retain(|_, services| !services.is_empty());
        drop(records);

        for (domain, service) in events {
            self.dispatch(&domain, WatchAction::Delete, service);
        }
    }

    /// Sends a change to every watcher whose filter matches, pruning
    /// watchers whose receiving side went away.
    fn dispatch(&self, domain: &str, action: WatchAction, service: Service) {
        let mut watchers = self.watchers.lock().expect("watcher registry poisoned");
        watchers.retain(|_, entry| {
            if entry.domain != WILDCARD_DOMAIN && entry.domain != domain {
                return true;
            }
            if let Some(filter) = &entry.service {
                if filter != &service.name {
                    return true;
                }
            }
            entry
                .tx
                .send(WatchResult {
                    action,
                    service: service.clone(),
                })
                .is_ok()
        });
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    type Watcher = MemoryWatcher;

    async fn register(
        &self,
        service: &Service,
        options: RegisterOptions,
    ) -> Result<(), RegistryError> {
        if service.nodes.is_empty() {
            return Err(RegistryError::MissingNodes);
        }
        let domain = options.domain.unwrap_or_else(|| DEFAULT_DOMAIN.to_owned());
        let now = Instant::now();

        let mut records = self.inner.records.lock().await;
        let versions = records
            .entry(domain.clone())
            .or_default()
            .entry(service.name.clone())
            .or_default();

        let action = if versions.contains_key(&service.version) {
            WatchAction::Update
        } else {
            WatchAction::Create
        };

        let record = versions.entry(service.version.clone()).or_insert_with(|| {
            let mut stored = service.clone();
            stored.nodes = Vec::new();
            stored.set_domain(domain.clone());
            ServiceRecord {
                service: stored,
                nodes: HashMap::new(),
            }
        });

        for node in &service.nodes {
            record.nodes.insert(
                node.id.clone(),
                NodeRecord {
                    node: node.clone(),
                    ttl: options.ttl,
                    last_renewed: now,
                },
            );
        }

        trace!(%domain, service = %service.name, %action, "registered service nodes");
        let snapshot = record.snapshot(now);
        drop(records);

        self.inner.dispatch(&domain, action, snapshot);
        Ok(())
    }

    async fn deregister(
        &self,
        service: &Service,
        options: DeregisterOptions,
    ) -> Result<(), RegistryError> {
        if service.nodes.is_empty() {
            return Err(RegistryError::MissingNodes);
        }
        let domain = options.domain.unwrap_or_else(|| DEFAULT_DOMAIN.to_owned());
        let now = Instant::now();

        let mut records = self.inner.records.lock().await;
        let Some(versions) = records
            .get_mut(&domain)
            .and_then(|services| services.get_mut(&service.name))
        else {
            return Ok(());
        };
        let Some(record) = versions.get_mut(&service.version) else {
            return Ok(());
        };

        let mut removed = record.service.clone();
        for node in &service.nodes {
            if let Some(gone) = record.nodes.remove(&node.id) {
                removed.nodes.push(gone.node);
            }
        }
        if removed.nodes.is_empty() {
            return Ok(());
        }

        let emptied = record.nodes.is_empty();
        let snapshot = record.snapshot(now);
        let event = if emptied {
            versions.remove(&service.version);
            (WatchAction::Delete, removed)
        } else {
            (WatchAction::Update, snapshot)
        };
        trace!(%domain, service = %service.name, action = %event.0, "deregistered service nodes");
        drop(records);

        self.inner.dispatch(&domain, event.0, event.1);
        Ok(())
    }

    async fn get_service(
        &self,
        name: &str,
        options: GetOptions,
    ) -> Result<Vec<Service>, RegistryError> {
        let domain = options.domain.unwrap_or_else(|| DEFAULT_DOMAIN.to_owned());
        let now = Instant::now();

        let records = self.inner.records.lock().await;
        let mut services = Vec::new();

        let domains: Vec<&HashMap<String, HashMap<String, ServiceRecord>>> =
            if domain == WILDCARD_DOMAIN {
                records.values().collect()
            } else {
                records.get(&domain).into_iter().collect()
            };

        for domain_records in domains {
            if let Some(versions) = domain_records.get(name) {
                for record in versions.values() {
                    let snapshot = record.snapshot(now);
                    if !snapshot.nodes.is_empty() {
                        services.push(snapshot);
                    }
                }
            }
        }

        if services.is_empty() {
            return Err(RegistryError::NotFound);
        }
        Ok(services)
    }

    async fn list_services(&self, options: ListOptions) -> Result<Vec<Service>, RegistryError> {
        let domain = options.domain.unwrap_or_else(|| DEFAULT_DOMAIN.to_owned());
        let now = Instant::now();

        let records = self.inner.records.lock().await;
        let mut services = Vec::new();

        let domains: Vec<&HashMap<String, HashMap<String, ServiceRecord>>> =
            if domain == WILDCARD_DOMAIN {
                records.values().collect()
            } else {
                records.get(&domain).into_iter().collect()
            };

        for domain_records in domains {
            for versions in domain_records.values() {
                for record in versions.values() {
                    let snapshot = record.snapshot(now);
                    if !snapshot.nodes.is_empty() {
                        services.push(snapshot);
                    }
                }
            }
        }

        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    async fn watch(&self, options: WatchOptions) -> Result<Self::Watcher, RegistryError> {
        let domain = options.domain.unwrap_or_else(|| DEFAULT_DOMAIN.to_owned());
        if domain == WILDCARD_DOMAIN && options.service.is_some() {
            return Err(RegistryError::CrossDomainWatch);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.inner
            .watchers
            .lock()
            .expect("watcher registry poisoned")
            .insert(
                id,
                WatcherEntry {
                    domain,
                    service: options.service,
                    tx,
                },
            );

        Ok(MemoryWatcher {
            id,
            rx,
            watchers: Arc::downgrade(&self.inner.watchers),
            stopped: false,
        })
    }
}

/// Watcher over a [`MemoryRegistry`].
pub struct MemoryWatcher {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<WatchResult>,
    watchers: Weak<StdMutex<HashMap<Uuid, WatcherEntry>>>,
    stopped: bool,
}

impl MemoryWatcher {
    fn unregister(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(watchers) = self.watchers.upgrade() {
            watchers
                .lock()
                .expect("watcher registry poisoned")
                .remove(&self.id);
        }
        self.rx.close();
    }
}

#[async_trait]
impl Watcher for MemoryWatcher {
    async fn next(&mut self) -> Result<WatchResult, RegistryError> {
        if self.stopped {
            // drain anything delivered before the stop
            return self.rx.try_recv().map_err(|_| RegistryError::WatcherStopped);
        }
        self.rx.recv().await.ok_or(RegistryError::WatcherStopped)
    }

    async fn stop(&mut self) {
        self.unregister();
    }
}

impl Drop for MemoryWatcher {
    fn drop(&mut self) {
        self.unregister();
    }
}
