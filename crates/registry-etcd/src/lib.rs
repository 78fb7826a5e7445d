//! Etcd-backed implementation of the service registry contract.
//!
//! Every node of a service lives under its own key,
//! `/<prefix>/<domain>/<service>/<node-id>`, holding the JSON-encoded service
//! restricted to that single node. Node keys carry a lease sized to the
//! registration TTL; registrants renew the lease by re-registering, and the
//! store expires the key when they stop. Watchers observe the key space with
//! previous-KV enabled so deletions can recover the service payload.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod watcher;

pub use watcher::EtcdWatcher;

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::future::Future;
use std::hash::Hasher;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, GetOptions as EtcdGetOptions, Identity, PutOptions,
    TlsOptions, WatchOptions as EtcdWatchOptions,
};
use switchyard_registry::{
    DeregisterOptions, GetOptions, ListOptions, Node, RegisterOptions, Registry, RegistryError,
    Service, WatchOptions, DEFAULT_DOMAIN, WILDCARD_DOMAIN,
};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Default etcd endpoint when none is configured.
const DEFAULT_ENDPOINT: &str = "127.0.0.1:2379";

/// Default key prefix for registry entries.
const DEFAULT_PREFIX: &str = "/registry";

/// Default per-request deadline.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS material for mutual authentication against etcd.
#[derive(Clone, Debug, Default)]
pub struct EtcdTls {
    /// CA certificate bundle (PEM).
    pub ca_file: Option<PathBuf>,

    /// Client certificate (PEM).
    pub cert_file: Option<PathBuf>,

    /// Client private key (PEM).
    pub key_file: Option<PathBuf>,
}

/// Options for constructing an [`EtcdRegistry`].
#[derive(Clone, Debug)]
pub struct EtcdRegistryOptions {
    /// Etcd endpoints. Addresses without a port are completed with `2379`.
    pub endpoints: Vec<String>,

    /// Key prefix all registry entries live under.
    pub prefix: String,

    /// Hard deadline applied to every etcd request. There are no retries at
    /// this layer; callers supervise and retry.
    pub timeout: Duration,

    /// Optional `(username, password)` credentials.
    pub auth: Option<(String, String)>,

    /// Optional TLS material.
    pub tls: Option<EtcdTls>,
}

impl Default for EtcdRegistryOptions {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ENDPOINT.to_owned()],
            prefix: DEFAULT_PREFIX.to_owned(),
            timeout: DEFAULT_TIMEOUT,
            auth: None,
            tls: None,
        }
    }
}

impl EtcdRegistryOptions {
    /// Sets the endpoints.
    #[must_use]
    pub fn endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the per-request deadline.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets basic-auth credentials.
    #[must_use]
    pub fn auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }
}

/// `domain -> service-name + node-id -> cached value`.
type DomainCache<T> = HashMap<String, HashMap<String, T>>;

#[derive(Default)]
struct Cache {
    register: DomainCache<u64>,
    leases: DomainCache<i64>,
}

/// An etcd-backed service registry.
#[derive(Clone)]
pub struct EtcdRegistry {
    client: Client,
    prefix: String,
    timeout: Duration,
    cache: Arc<Mutex<Cache>>,
}

impl Debug for EtcdRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("EtcdRegistry")
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl EtcdRegistry {
    /// Connects to etcd and returns a registry handle.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Backend`] when the TLS material cannot be
    /// read or the client cannot be constructed.
    pub async fn new(options: EtcdRegistryOptions) -> Result<Self, RegistryError> {
        let EtcdRegistryOptions {
            endpoints,
            prefix,
            timeout,
            auth,
            tls,
        } = options;

        let endpoints: Vec<String> = endpoints
            .into_iter()
            .filter(|endpoint| !endpoint.is_empty())
            .map(normalize_endpoint)
            .collect();

        let mut connect = ConnectOptions::new().with_connect_timeout(timeout);
        if let Some((username, password)) = auth {
            connect = connect.with_user(username, password);
        }
        if let Some(tls) = tls {
            connect = connect.with_tls(tls_options(&tls)?);
        }

        let client = Client::connect(&endpoints, Some(connect))
            .await
            .map_err(backend)?;

        Ok(Self {
            client,
            prefix,
            timeout,
            cache: Arc::new(Mutex::new(Cache::default())),
        })
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, RegistryError>
    where
        F: Future<Output = Result<T, etcd_client::Error>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(backend),
            Err(_) => Err(RegistryError::Backend(format!(
                "etcd request exceeded {}s deadline",
                self.timeout.as_secs()
            ))),
        }
    }

    /// Sends a single keep-alive for `lease`. Returns `false` when the store
    /// no longer knows the lease.
    async fn keep_alive_once(&self, lease: i64) -> Result<bool, RegistryError> {
        let mut client = self.client.clone();
        let response = self
            .with_timeout(async move {
                let (mut keeper, mut stream) = client.lease_keep_alive(lease).await?;
                keeper.keep_alive().await?;
                stream.message().await
            })
            .await?;

        Ok(response.is_some_and(|resp| resp.ttl() > 0))
    }

    #[allow(clippy::too_many_lines)]
    async fn register_node(
        &self,
        service: &Service,
        node: &Node,
        domain: &str,
        ttl: Option<Duration>,
    ) -> Result<(), RegistryError> {
        let cache_key = format!("{}{}", service.name, node.id);
        let key = node_path(&self.prefix, domain, &service.name, &node.id);

        let mut lease_id = {
            let cache = self.cache.lock().await;
            cache
                .leases
                .get(domain)
                .and_then(|leases| leases.get(&cache_key))
                .copied()
        };

        if lease_id.is_none() {
            // the key may predate this process; adopt its lease rather than
            // granting a duplicate
            let mut client = self.client.clone();
            let lookup = key.clone();
            let response = self
                .with_timeout(async move {
                    client
                        .get(lookup, Some(EtcdGetOptions::new().with_serializable()))
                        .await
                })
                .await?;

            for kv in response.kvs() {
                if kv.lease() == 0 {
                    continue;
                }
                let Some(existing) = decode(kv.value()) else {
                    continue;
                };
                let Some(existing_node) = existing.nodes.first() else {
                    continue;
                };

                lease_id = Some(kv.lease());
                let hash = node_hash(existing_node);
                let mut cache = self.cache.lock().await;
                cache
                    .leases
                    .entry(domain.to_owned())
                    .or_default()
                    .insert(cache_key.clone(), kv.lease());
                cache
                    .register
                    .entry(domain.to_owned())
                    .or_default()
                    .insert(cache_key.clone(), hash);
                break;
            }
        }

        let mut lease_missing = false;
        if let Some(id) = lease_id {
            trace!(service = %service.name, lease = id, "renewing existing lease");
            if !self.keep_alive_once(id).await? {
                trace!(service = %service.name, lease = id, "lease no longer exists");
                lease_missing = true;
            }
        }

        let hash = node_hash(node);
        let unchanged = {
            let cache = self.cache.lock().await;
            cache
                .register
                .get(domain)
                .and_then(|hashes| hashes.get(&cache_key))
                == Some(&hash)
        };
        if unchanged && lease_id.is_some() && !lease_missing {
            trace!(
                service = %service.name,
                node = %node.id,
                "node unchanged, skipping registration"
            );
            return Ok(());
        }

        let mut stored = Service {
            name: service.name.clone(),
            version: service.version.clone(),
            metadata: service.metadata.clone(),
            endpoints: service.endpoints.clone(),
            nodes: vec![node.clone()],
        };
        stored.set_domain(domain);

        // a changed value is rewritten under the renewed lease when one is
        // still valid; otherwise a fresh lease is granted
        let mut client = self.client.clone();
        let mut lease_for_put = lease_id.filter(|_| !lease_missing);
        if lease_for_put.is_none() {
            if let Some(seconds) = ttl.map(|ttl| ttl.as_secs()).filter(|seconds| *seconds > 0) {
                let lease = self
                    .with_timeout(
                        client.lease_grant(i64::try_from(seconds).unwrap_or(i64::MAX), None),
                    )
                    .await?;
                lease_for_put = Some(lease.id());
            }
        }

        debug!(
            service = %service.name,
            node = %node.id,
            %domain,
            ttl = ?ttl,
            "registering node"
        );
        let put_options = lease_for_put.map(|id| PutOptions::new().with_lease(id));
        self.with_timeout(client.put(key, encode(&stored)?, put_options))
            .await?;

        let mut cache = self.cache.lock().await;
        cache
            .register
            .entry(domain.to_owned())
            .or_default()
            .insert(cache_key.clone(), hash);
        if let Some(id) = lease_for_put {
            cache
                .leases
                .entry(domain.to_owned())
                .or_default()
                .insert(cache_key, id);
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    type Watcher = EtcdWatcher;

    async fn register(
        &self,
        service: &Service,
        options: RegisterOptions,
    ) -> Result<(), RegistryError> {
        if service.nodes.is_empty() {
            return Err(RegistryError::MissingNodes);
        }
        let domain = options.domain.unwrap_or_else(|| DEFAULT_DOMAIN.to_owned());

        // register each node individually; the last failure wins
        let mut result = Ok(());
        for node in &service.nodes {
            if let Err(error) = self.register_node(service, node, &domain, options.ttl).await {
                result = Err(error);
            }
        }
        result
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

        for node in &service.nodes {
            // clear the cache first so a concurrent re-register cannot
            // resurrect state for the deleted key
            let cache_key = format!("{}{}", service.name, node.id);
            {
                let mut cache = self.cache.lock().await;
                if let Some(hashes) = cache.register.get_mut(&domain) {
                    hashes.remove(&cache_key);
                }
                if let Some(leases) = cache.leases.get_mut(&domain) {
                    leases.remove(&cache_key);
                }
            }

            debug!(service = %service.name, node = %node.id, %domain, "deregistering node");
            let mut client = self.client.clone();
            let key = node_path(&self.prefix, &domain, &service.name, &node.id);
            self.with_timeout(client.delete(key, None)).await?;
        }
        Ok(())
    }

    async fn get_service(
        &self,
        name: &str,
        options: GetOptions,
    ) -> Result<Vec<Service>, RegistryError> {
        let domain = options.domain.unwrap_or_else(|| DEFAULT_DOMAIN.to_owned());
        let mut client = self.client.clone();

        let results: Vec<(String, Service)> = if domain == WILDCARD_DOMAIN {
            let response = self
                .with_timeout(client.get(
                    self.prefix.as_str(),
                    Some(EtcdGetOptions::new().with_prefix().with_serializable()),
                ))
                .await?;

            // a service name can appear under many domains; match on the
            // path segment
            let needle = format!("/{}/", serialize_name(name));
            response
                .kvs()
                .iter()
                .filter_map(|kv| {
                    let key = String::from_utf8_lossy(kv.key()).into_owned();
                    if !key.contains(&needle) {
                        return None;
                    }
                    decode(kv.value()).map(|service| (key, service))
                })
                .collect()
        } else {
            let path = format!("{}/", service_path(&self.prefix, &domain, name));
            let response = self
                .with_timeout(client.get(
                    path,
                    Some(EtcdGetOptions::new().with_prefix().with_serializable()),
                ))
                .await?;

            response
                .kvs()
                .iter()
                .filter_map(|kv| {
                    let key = String::from_utf8_lossy(kv.key()).into_owned();
                    decode(kv.value()).map(|service| (key, service))
                })
                .collect()
        };

        if results.is_empty() {
            return Err(RegistryError::NotFound);
        }
        Ok(group_services(results))
    }

    async fn list_services(&self, options: ListOptions) -> Result<Vec<Service>, RegistryError> {
        let domain = options.domain.unwrap_or_else(|| DEFAULT_DOMAIN.to_owned());
        let path = if domain == WILDCARD_DOMAIN {
            self.prefix.clone()
        } else {
            prefix_with_domain(&self.prefix, &domain)
        };

        let mut client = self.client.clone();
        let response = self
            .with_timeout(client.get(
                path,
                Some(EtcdGetOptions::new().with_prefix().with_serializable()),
            ))
            .await?;

        let results: Vec<(String, Service)> = response
            .kvs()
            .iter()
            .filter_map(|kv| {
                let key = String::from_utf8_lossy(kv.key()).into_owned();
                decode(kv.value()).map(|service| (key, service))
            })
            .collect();

        let mut services = group_services(results);
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    async fn watch(&self, options: WatchOptions) -> Result<Self::Watcher, RegistryError> {
        let domain = options.domain.unwrap_or_else(|| DEFAULT_DOMAIN.to_owned());
        if domain == WILDCARD_DOMAIN && options.service.is_some() {
            return Err(RegistryError::CrossDomainWatch);
        }

        let watch_path = if domain == WILDCARD_DOMAIN {
            self.prefix.clone()
        } else if let Some(service) = &options.service {
            format!("{}/", service_path(&self.prefix, &domain, service))
        } else {
            prefix_with_domain(&self.prefix, &domain)
        };

        let mut client = self.client.clone();
        let (watcher, stream) = self
            .with_timeout(client.watch(
                watch_path,
                Some(EtcdWatchOptions::new().with_prefix().with_prev_key()),
            ))
            .await?;

        Ok(EtcdWatcher::new(watcher, stream))
    }
}

fn backend(error: etcd_client::Error) -> RegistryError {
    RegistryError::Backend(error.to_string())
}

fn tls_options(tls: &EtcdTls) -> Result<TlsOptions, RegistryError> {
    let read = |path: &PathBuf| {
        std::fs::read(path).map_err(|error| {
            RegistryError::Backend(format!("reading {}: {error}", path.display()))
        })
    };

    let mut options = TlsOptions::new();
    if let Some(ca) = &tls.ca_file {
        options = options.ca_certificate(Certificate::from_pem(read(ca)?));
    }
    if let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) {
        options = options.identity(Identity::from_pem(read(cert)?, read(key)?));
    }
    Ok(options)
}

/// Completes a bare `host` endpoint with the default etcd port.
fn normalize_endpoint(endpoint: String) -> String {
    if endpoint.contains(':') {
        endpoint
    } else {
        format!("{endpoint}:2379")
    }
}

/// Service and node names may contain `/`, which would corrupt the key
/// hierarchy.
fn serialize_name(name: &str) -> String {
    name.replace('/', "-")
}

fn prefix_with_domain(prefix: &str, domain: &str) -> String {
    format!("{prefix}/{domain}")
}

fn service_path(prefix: &str, domain: &str, service: &str) -> String {
    format!(
        "{}/{}",
        prefix_with_domain(prefix, domain),
        serialize_name(service)
    )
}

fn node_path(prefix: &str, domain: &str, service: &str, node_id: &str) -> String {
    format!(
        "{}/{}",
        service_path(prefix, domain, service),
        serialize_name(node_id)
    )
}

fn encode(service: &Service) -> Result<String, RegistryError> {
    serde_json::to_string(service)
        .map_err(|error| RegistryError::Backend(format!("encoding service: {error}")))
}

pub(crate) fn decode(value: &[u8]) -> Option<Service> {
    serde_json::from_slice(value).ok()
}

/// Structural hash of a node, used to detect whether a re-registration
/// actually changed anything. Only needs to be stable within this process;
/// the lease-adoption path recomputes it from the fetched value.
fn node_hash(node: &Node) -> u64 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(node.id.as_bytes());
    hasher.write(&[0xff]);
    hasher.write(node.address.as_bytes());
    let mut metadata: Vec<(&String, &String)> = node.metadata.iter().collect();
    metadata.sort();
    for (key, value) in metadata {
        hasher.write(&[0xff]);
        hasher.write(key.as_bytes());
        hasher.write(&[0xff]);
        hasher.write(value.as_bytes());
    }
    hasher.finish()
}

/// Groups single-node KVs by the directory portion of their key, i.e. per
/// `(domain, service, version)` slot, concatenating the nodes of each group.
fn group_services(results: Vec<(String, Service)>) -> Vec<Service> {
    let mut groups: BTreeMap<String, Service> = BTreeMap::new();

    for (key, decoded) in results {
        let directory = key.rfind('/').map_or(key.clone(), |idx| key[..idx].to_owned());
        let entry = groups.entry(directory).or_insert_with(|| Service {
            name: decoded.name.clone(),
            version: decoded.version.clone(),
            metadata: decoded.metadata.clone(),
            endpoints: decoded.endpoints.clone(),
            nodes: Vec::new(),
        });
        entry.nodes.extend(decoded.nodes);
    }

    groups.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn single_node_service(name: &str, version: &str, node_id: &str, address: &str) -> Service {
        Service {
            name: name.to_owned(),
            version: version.to_owned(),
            nodes: vec![Node {
                id: node_id.to_owned(),
                address: address.to_owned(),
                metadata: HashMap::new(),
            }],
            ..Service::default()
        }
    }

    #[test]
    fn key_layout_replaces_slashes() {
        assert_eq!(
            node_path("/registry", "inf", "acme/greeter", "node/1"),
            "/registry/inf/acme-greeter/node-1"
        );
        assert_eq!(
            service_path("/registry", "staging", "greeter"),
            "/registry/staging/greeter"
        );
    }

    #[test]
    fn bare_endpoints_get_default_port() {
        assert_eq!(normalize_endpoint("10.0.0.1".into()), "10.0.0.1:2379");
        assert_eq!(normalize_endpoint("10.0.0.1:2380".into()), "10.0.0.1:2380");
    }

    #[test]
    fn node_hash_ignores_metadata_order() {
        let mut a = Node {
            id: "n1".to_owned(),
            address: "10.0.0.1:8080".to_owned(),
            metadata: HashMap::new(),
        };
        a.metadata.insert("zone".to_owned(), "a".to_owned());
        a.metadata.insert("rack".to_owned(), "7".to_owned());

        let mut b = a.clone();
        b.metadata = HashMap::new();
        b.metadata.insert("rack".to_owned(), "7".to_owned());
        b.metadata.insert("zone".to_owned(), "a".to_owned());

        assert_eq!(node_hash(&a), node_hash(&b));

        b.address = "10.0.0.2:8080".to_owned();
        assert_ne!(node_hash(&a), node_hash(&b));
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut service = single_node_service("greeter", "1.0.0", "n1", "10.0.0.1:8080");
        service.set_domain("inf");

        let encoded = encode(&service).unwrap();
        let decoded = decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded, service);

        assert!(decode(b"not json").is_none());
    }

    #[test]
    fn grouping_merges_nodes_per_version_slot() {
        let results = vec![
            (
                "/registry/inf/greeter/n1".to_owned(),
                single_node_service("greeter", "1.0.0", "n1", "10.0.0.1:8080"),
            ),
            (
                "/registry/inf/greeter/n2".to_owned(),
                single_node_service("greeter", "1.0.0", "n2", "10.0.0.2:8080"),
            ),
            (
                "/registry/prod/greeter/n3".to_owned(),
                single_node_service("greeter", "1.0.0", "n3", "10.0.0.3:8080"),
            ),
        ];

        let services = group_services(results);
        assert_eq!(services.len(), 2);

        let inf = &services[0];
        assert_eq!(inf.nodes.len(), 2);
        let prod = &services[1];
        assert_eq!(prod.nodes.len(), 1);
        assert_eq!(prod.nodes[0].id, "n3");
    }

    #[tokio::test]
    #[ignore = "requires a live etcd endpoint on 127.0.0.1:2379"]
    async fn live_reregistration_adopts_existing_lease() {
        let options = EtcdRegistryOptions::default();
        let service = single_node_service("lease-adoption", "1.0.0", "n1", "10.0.0.1:8080");
        let register = RegisterOptions::default().ttl(Duration::from_secs(30));

        let first = EtcdRegistry::new(options.clone()).await.unwrap();
        first.register(&service, register.clone()).await.unwrap();

        // a fresh adapter has cold caches, as after a restart
        let second = EtcdRegistry::new(options).await.unwrap();
        second.register(&service, register).await.unwrap();

        let found = second
            .get_service("lease-adoption", GetOptions::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].nodes.len(), 1);

        second
            .deregister(&service, DeregisterOptions::default())
            .await
            .unwrap();
    }
}
