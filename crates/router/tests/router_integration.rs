//! End-to-end router scenarios against the in-memory registry.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use switchyard_registry::{Node, RegisterOptions, Registry, Service};
use switchyard_registry_memory::MemoryRegistry;
use switchyard_router::{
    Advert, AdvertType, Event, EventType, QueryOptions, Route, Router, RouterError, RouterOptions,
    Strategy, WatchOptions, ADVERTISE_EVENTS_TICK, DEFAULT_ADVERT_TTL, DEFAULT_LINK,
    DEFAULT_LOCAL_METRIC,
};

fn service(name: &str, node_id: &str, address: &str) -> Service {
    Service {
        name: name.to_owned(),
        nodes: vec![Node {
            id: node_id.to_owned(),
            address: address.to_owned(),
            metadata: HashMap::new(),
        }],
        ..Service::default()
    }
}

fn route(service: &str, address: &str, router: &str) -> Route {
    Route {
        service: service.to_owned(),
        address: address.to_owned(),
        network: "inf".to_owned(),
        router: router.to_owned(),
        link: DEFAULT_LINK.to_owned(),
        metric: DEFAULT_LOCAL_METRIC,
        ..Route::default()
    }
}

#[tokio::test(start_paused = true)]
async fn prewarm_mirrors_registry_services() {
    let registry = MemoryRegistry::new();
    registry
        .register(
            &service("svc-a", "n1", "10.0.0.1:80"),
            RegisterOptions::default(),
        )
        .await
        .unwrap();

    let router = Router::new(RouterOptions::new(registry).id("R1").prewarm(true))
        .await
        .unwrap();

    let routes = router
        .lookup(QueryOptions::default().service("svc-a"))
        .await
        .unwrap();
    assert_eq!(routes.len(), 1);

    let found = &routes[0];
    assert_eq!(found.service, "svc-a");
    assert_eq!(found.address, "10.0.0.1:80");
    assert_eq!(found.gateway, "");
    assert_eq!(found.network, "inf");
    assert_eq!(found.router, "R1");
    assert_eq!(found.link, DEFAULT_LINK);
    assert_eq!(found.metric, DEFAULT_LOCAL_METRIC);

    router.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn registry_changes_propagate_to_the_table() {
    let registry = MemoryRegistry::new();
    let router = Router::new(RouterOptions::new(registry.clone()).id("R1"))
        .await
        .unwrap();
    let mut events = router.watch(WatchOptions::default());

    // let the registry watcher open before producing changes
    tokio::time::sleep(Duration::from_millis(10)).await;

    let svc = service("svc-b", "n1", "1.1.1.1:9");
    registry
        .register(&svc, RegisterOptions::default())
        .await
        .unwrap();

    let created = events.next().await.unwrap();
    assert_eq!(created.event_type, EventType::Create);
    assert_eq!(created.route.service, "svc-b");
    assert_eq!(created.route.address, "1.1.1.1:9");

    let routes = router
        .lookup(QueryOptions::default().service("svc-b"))
        .await
        .unwrap();
    assert_eq!(routes.len(), 1);

    registry
        .deregister(&svc, switchyard_registry::DeregisterOptions::default())
        .await
        .unwrap();

    let deleted = events.next().await.unwrap();
    assert_eq!(deleted.event_type, EventType::Delete);
    assert_eq!(deleted.route.service, "svc-b");

    assert_eq!(
        router
            .lookup(QueryOptions::default().service("svc-b"))
            .await,
        Err(RouterError::RouteNotFound)
    );

    router.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lease_expiry_removes_routes() {
    let registry = MemoryRegistry::new();
    let router = Router::new(RouterOptions::new(registry.clone()).id("R1"))
        .await
        .unwrap();
    let mut events = router.watch(WatchOptions::default());

    // let the registry watcher open before producing changes
    tokio::time::sleep(Duration::from_millis(10)).await;

    registry
        .register(
            &service("svc-ttl", "n1", "10.0.0.5:80"),
            RegisterOptions::default().ttl(Duration::from_secs(2)),
        )
        .await
        .unwrap();
    assert_eq!(events.next().await.unwrap().event_type, EventType::Create);

    // stop renewing; the registry expires the lease and the router follows
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(events.next().await.unwrap().event_type, EventType::Delete);

    assert_eq!(
        router
            .lookup(QueryOptions::default().service("svc-ttl"))
            .await,
        Err(RouterError::RouteNotFound)
    );

    router.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn announce_carries_a_table_snapshot() {
    let registry = MemoryRegistry::new();
    registry
        .register(
            &service("svc-a", "n1", "10.0.0.1:80"),
            RegisterOptions::default(),
        )
        .await
        .unwrap();

    let router = Router::new(RouterOptions::new(registry).id("R1").prewarm(true))
        .await
        .unwrap();
    let mut adverts = router.advertise().await.unwrap();

    let announce = adverts.recv().await.unwrap();
    assert_eq!(announce.advert_type, AdvertType::Announce);
    assert_eq!(announce.id, "R1");
    assert_eq!(announce.ttl, DEFAULT_ADVERT_TTL);
    assert_eq!(announce.events.len(), 1);
    assert_eq!(announce.events[0].event_type, EventType::Create);
    assert_eq!(announce.events[0].route.service, "svc-a");

    router.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn flapping_routes_collapse_to_one_event_per_tick() {
    let registry = MemoryRegistry::new();
    let router = Router::new(RouterOptions::new(registry).id("R1"))
        .await
        .unwrap();
    let mut adverts = router.advertise().await.unwrap();

    let announce = adverts.recv().await.unwrap();
    assert_eq!(announce.advert_type, AdvertType::Announce);
    assert!(announce.events.is_empty());

    // let the table watcher open before producing events
    tokio::time::sleep(Duration::from_millis(10)).await;

    // flap a route inside one advertisement window
    let flapping = route("svc-flap", "10.0.0.9:80", "R1");
    router.table().create(flapping.clone()).await.unwrap();
    router.table().delete(flapping.clone()).await.unwrap();
    router.table().create(flapping.clone()).await.unwrap();

    tokio::time::sleep(ADVERTISE_EVENTS_TICK + Duration::from_secs(1)).await;

    let update = adverts.recv().await.unwrap();
    assert_eq!(update.advert_type, AdvertType::RouteUpdate);
    assert_eq!(update.events.len(), 1);
    assert_eq!(update.events[0].event_type, EventType::Create);
    assert_eq!(update.events[0].route.hash(), flapping.hash());

    // nothing is left pending for the next tick
    tokio::time::sleep(ADVERTISE_EVENTS_TICK + Duration::from_secs(1)).await;
    assert!(adverts.try_recv().is_err());

    router.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn create_then_delete_collapses_to_delete() {
    let registry = MemoryRegistry::new();
    let router = Router::new(RouterOptions::new(registry).id("R1"))
        .await
        .unwrap();
    let mut adverts = router.advertise().await.unwrap();
    adverts.recv().await.unwrap(); // announce

    // let the table watcher open before producing events
    tokio::time::sleep(Duration::from_millis(10)).await;

    let flapping = route("svc-flap", "10.0.0.9:80", "R1");
    router.table().create(flapping.clone()).await.unwrap();
    router.table().delete(flapping.clone()).await.unwrap();

    tokio::time::sleep(ADVERTISE_EVENTS_TICK + Duration::from_secs(1)).await;

    let update = adverts.recv().await.unwrap();
    assert_eq!(update.events.len(), 1);
    assert_eq!(update.events[0].event_type, EventType::Delete);

    router.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn processing_skips_self_originated_events() {
    let registry = MemoryRegistry::new();
    let router = Router::new(RouterOptions::new(registry).id("R1"))
        .await
        .unwrap();

    let advert = Advert {
        id: "R2".to_owned(),
        advert_type: AdvertType::RouteUpdate,
        ttl: DEFAULT_ADVERT_TTL,
        timestamp: Utc::now(),
        events: vec![
            Event::new(EventType::Create, route("svc-own", "10.0.0.1:80", "R1")),
            Event::new(EventType::Create, route("svc-peer", "10.0.0.2:80", "R2")),
        ],
    };
    router.process(&advert).await.unwrap();

    let peer = router
        .lookup(QueryOptions::default().service("svc-peer"))
        .await
        .unwrap();
    assert_eq!(peer.len(), 1);
    assert_eq!(peer[0].router, "R2");

    // the self-originated event caused no mutation
    assert_eq!(
        router
            .lookup(QueryOptions::default().service("svc-own"))
            .await,
        Err(RouterError::RouteNotFound)
    );

    router.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn advertise_strategy_filters_flushed_routes() {
    let registry = MemoryRegistry::new();
    let router = Router::new(
        RouterOptions::new(registry)
            .id("R1")
            .advertise(Strategy::AdvertiseLocal),
    )
    .await
    .unwrap();

    router
        .table()
        .create(route("svc-x", "10.0.0.1:80", "R1"))
        .await
        .unwrap();
    let mut peer = route("svc-x", "10.0.0.2:80", "R2");
    peer.link = "peer".to_owned();
    peer.metric = 5;
    router.table().create(peer).await.unwrap();

    let mut adverts = router.advertise().await.unwrap();
    let announce = adverts.recv().await.unwrap();
    assert_eq!(announce.events.len(), 1);
    assert_eq!(announce.events[0].route.link, DEFAULT_LINK);

    router.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_shuts_everything_down() {
    let registry = MemoryRegistry::new();
    let router = Router::new(RouterOptions::new(registry.clone()).id("R1"))
        .await
        .unwrap();
    let mut adverts = router.advertise().await.unwrap();
    adverts.recv().await.unwrap(); // announce

    // a continuous producer while the router shuts down
    let table = router.table().clone();
    let producer = tokio::spawn(async move {
        for i in 0..50u32 {
            let _ = table
                .create(route("svc-load", &format!("10.0.0.1:{i}"), "R1"))
                .await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    tokio::time::sleep(Duration::from_millis(120)).await;
    router.close().await.unwrap();

    // every subscriber channel closes once buffered adverts are drained
    while adverts.recv().await.is_some() {}

    assert!(!router.is_running().await);
    assert_eq!(router.advertise().await.err(), Some(RouterError::NotRunning));

    // close is idempotent
    router.close().await.unwrap();

    producer.abort();
}

#[tokio::test(start_paused = true)]
async fn init_restarts_with_new_options() {
    let registry = MemoryRegistry::new();
    let router = Router::new(
        RouterOptions::new(registry.clone())
            .id("R1")
            .gateway("10.1.1.1:8080"),
    )
    .await
    .unwrap();

    let default_route = router
        .lookup(QueryOptions::default().service("*"))
        .await
        .unwrap();
    assert_eq!(default_route.len(), 1);
    assert_eq!(default_route[0].gateway, "10.1.1.1:8080");

    // stop-and-rebuild with the same gateway; the resident default route is
    // tolerated
    router
        .init(
            RouterOptions::new(registry)
                .id("R1")
                .gateway("10.1.1.1:8080"),
        )
        .await
        .unwrap();
    assert!(router.is_running().await);

    let routes = router
        .lookup(QueryOptions::default().service("*"))
        .await
        .unwrap();
    assert_eq!(routes.len(), 1);

    router.close().await.unwrap();
}
