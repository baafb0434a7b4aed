//! End-to-end worker scenarios against a scripted network.

use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use serde_json::{json, Value};
use swcache_common::SwConfig;
use swcache_net::{Destination, Request, RouteFetcher};
use swcache_sw::{
    CacheKey, CacheStore, FileCacheStore, GenerationState, MemoryCacheStore, Outcome,
    ServiceWorker, ServiceWorkerError, ServiceWorkerEvent, ServiceWorkerState, OFFLINE_MARKER,
};
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

const ORIGIN: &str = "https://app.test/";

struct Harness {
    worker: Arc<ServiceWorker>,
    fetcher: Arc<RouteFetcher>,
    store: Arc<dyn CacheStore>,
    events: UnboundedReceiver<ServiceWorkerEvent>,
}

fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

fn config(version: &str, seeds: &[&str]) -> SwConfig {
    SwConfig {
        version: version.to_string(),
        origin: Url::parse(ORIGIN).unwrap(),
        seed_resources: seeds.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn harness_with(config: SwConfig, store: Arc<dyn CacheStore>) -> Harness {
    let fetcher = Arc::new(RouteFetcher::new(Url::parse(ORIGIN).unwrap()));
    fetcher.route("/", "<html>home</html>");
    fetcher.route("/app.css", "body { color: red }");
    let (worker, events) = ServiceWorker::new(config, store.clone(), fetcher.clone());
    Harness {
        worker: Arc::new(worker),
        fetcher,
        store,
        events,
    }
}

fn harness(seeds: &[&str]) -> Harness {
    harness_with(config("v1", seeds), Arc::new(MemoryCacheStore::new()))
}

async fn body_of(worker: &ServiceWorker, path: &str) -> (String, Outcome) {
    let interception = worker.intercept(&Request::get(url(path))).await.unwrap();
    (interception.response.text().unwrap(), interception.outcome)
}

fn drain(events: &mut UnboundedReceiver<ServiceWorkerEvent>) -> Vec<ServiceWorkerEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

// ==================== Install & Activate ====================

#[tokio::test]
async fn install_populates_exactly_the_seeds() {
    let h = harness(&["/", "/app.css"]);
    h.worker.install().await.unwrap();

    let keys = h.store.keys("v1").await.unwrap();
    assert_eq!(keys, vec![CacheKey::get(&url("/")), CacheKey::get(&url("/app.css"))]);

    // Served without touching the network first.
    let (body, outcome) = body_of(&h.worker, "/").await;
    assert_eq!(body, "<html>home</html>");
    assert_eq!(outcome, Outcome::FromCache);
}

#[tokio::test]
async fn install_is_idempotent() {
    let h = harness(&["/", "/app.css"]);
    h.worker.install().await.unwrap();
    let first = h.store.keys("v1").await.unwrap();
    let first_body = h.store.get("v1", &first[0]).await.unwrap().unwrap().body;

    h.worker.install().await.unwrap();
    let second = h.store.keys("v1").await.unwrap();
    let second_body = h.store.get("v1", &second[0]).await.unwrap().unwrap().body;

    assert_eq!(first, second);
    assert_eq!(first_body, second_body);
}

#[tokio::test]
async fn failed_install_writes_nothing() {
    let h = harness(&["/", "/missing.js"]);
    let err = h.worker.install().await.unwrap_err();

    match err {
        ServiceWorkerError::InstallFailed { url, .. } => assert!(url.ends_with("/missing.js")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.store.keys("v1").await.unwrap().is_empty());
    assert_eq!(h.worker.state().await, ServiceWorkerState::Redundant);
    assert_eq!(h.worker.activate().await.unwrap_err().category(), "state");
}

#[tokio::test]
async fn install_fails_when_offline() {
    let h = harness(&["/"]);
    h.fetcher.set_offline(true);
    assert_eq!(h.worker.install().await.unwrap_err().category(), "install");
}

#[tokio::test]
async fn cross_origin_seeds_are_skipped() {
    let h = harness(&["/", "https://cdn.test/lib.js"]);
    h.worker.install().await.unwrap();
    assert_eq!(h.store.keys("v1").await.unwrap(), vec![CacheKey::get(&url("/"))]);
    assert_eq!(h.fetcher.calls("https://cdn.test/lib.js"), 0);
}

#[tokio::test]
async fn activate_sweeps_every_other_generation() {
    let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
    for old in ["v0", "legacy-cache"] {
        store.open(old).await.unwrap();
    }
    let h = harness_with(config("v1", &["/"]), store);

    h.worker.install().await.unwrap();
    h.worker.activate().await.unwrap();

    assert_eq!(h.store.generations().await.unwrap(), vec!["v1".to_string()]);
    assert_eq!(h.worker.state().await, ServiceWorkerState::Activated);

    let generations = h.worker.generations().await.unwrap();
    assert_eq!(generations, vec![("v1".to_string(), GenerationState::Active)]);
}

#[tokio::test]
async fn lifecycle_events_are_emitted() {
    let mut h = harness(&["/"]);
    h.store.open("v0").await.unwrap();
    h.worker.install().await.unwrap();
    h.worker.activate().await.unwrap();

    let states: Vec<ServiceWorkerState> = drain(&mut h.events)
        .into_iter()
        .filter_map(|event| match event {
            ServiceWorkerEvent::StateChange { new_state, .. } => Some(new_state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ServiceWorkerState::Installing,
            ServiceWorkerState::Installed,
            ServiceWorkerState::Activating,
            ServiceWorkerState::Activated,
        ]
    );
}

#[tokio::test]
async fn activation_claims_clients_and_reports_deletions() {
    let mut h = harness(&["/"]);
    h.store.open("v0").await.unwrap();
    h.worker.install().await.unwrap();
    drain(&mut h.events);
    h.worker.activate().await.unwrap();

    let events = drain(&mut h.events);
    assert!(events.contains(&ServiceWorkerEvent::GenerationDeleted {
        name: "v0".to_string()
    }));
    assert!(events.contains(&ServiceWorkerEvent::ControllerChange {
        version: "v1".to_string()
    }));
}

#[tokio::test]
async fn quota_bounded_install_with_duplicate_seeds() {
    let h = harness_with(
        config("v1", &["/", "./", "/app.css"]),
        Arc::new(MemoryCacheStore::with_quota(1_000_000)),
    );
    h.worker.install().await.unwrap();
    h.worker.install().await.unwrap();

    assert_eq!(
        h.store.keys("v1").await.unwrap(),
        vec![CacheKey::get(&url("/")), CacheKey::get(&url("/app.css"))]
    );
    // One fetch per install for the two spellings of "/".
    assert_eq!(h.fetcher.calls("/"), 2);
}

#[tokio::test]
async fn quota_bounded_install_with_duplicate_seeds_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileCacheStore::new(dir.path()).with_quota(1_000_000));
    let h = harness_with(config("v1", &["./", "/"]), store);

    h.worker.install().await.unwrap();
    h.worker.install().await.unwrap();
    assert_eq!(h.store.keys("v1").await.unwrap(), vec![CacheKey::get(&url("/"))]);
}

// ==================== Fetch ====================

#[tokio::test]
async fn stale_while_revalidate_refreshes_in_background() {
    let h = harness(&[]);
    h.fetcher.route("/data.json", r#"{"x":1}"#);

    let (body, outcome) = body_of(&h.worker, "/data.json").await;
    assert_eq!(body, r#"{"x":1}"#);
    assert_eq!(outcome, Outcome::NetworkCached);

    h.fetcher.route("/data.json", r#"{"x":2}"#);
    let (body, outcome) = body_of(&h.worker, "/data.json").await;
    assert_eq!(body, r#"{"x":1}"#);
    assert_eq!(outcome, Outcome::FromCache);

    h.worker.settle().await;
    let (body, outcome) = body_of(&h.worker, "/data.json").await;
    assert_eq!(body, r#"{"x":2}"#);
    assert_eq!(outcome, Outcome::FromCache);
}

/// Revalidation of `/` and a miss-fill of `/` land at about the same time.
async fn race_revalidation_with_miss_fill(h: &Harness, rounds: usize) {
    h.fetcher.route("/", "<html>fresh</html>");
    h.fetcher.set_delay(Duration::from_millis(20));

    for _ in 0..rounds {
        let hit = h.worker.intercept(&Request::get(url("/"))).await.unwrap();
        assert_eq!(hit.outcome, Outcome::FromCache);

        h.worker.evict(&url("/")).await.unwrap();
        // Either way a second write for "/" is in flight.
        let fill = h.worker.intercept(&Request::get(url("/"))).await.unwrap();
        assert!(matches!(
            fill.outcome,
            Outcome::NetworkCached | Outcome::FromCache
        ));
        h.worker.settle().await;
    }
}

fn cache_updates(events: &mut UnboundedReceiver<ServiceWorkerEvent>) -> usize {
    drain(events)
        .into_iter()
        .filter(|event| matches!(event, ServiceWorkerEvent::CacheUpdated { .. }))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_race_is_last_write_wins() {
    let mut h = harness(&["/"]);
    h.worker.install().await.unwrap();
    drain(&mut h.events);

    race_revalidation_with_miss_fill(&h, 10).await;

    // Every write landed: one from each revalidation and one from each miss-fill.
    assert_eq!(cache_updates(&mut h.events), 20);
    assert_eq!(body_of(&h.worker, "/").await.0, "<html>fresh</html>");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_race_is_last_write_wins_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness_with(
        config("v1", &["/"]),
        Arc::new(FileCacheStore::new(dir.path())),
    );
    h.worker.install().await.unwrap();
    drain(&mut h.events);

    race_revalidation_with_miss_fill(&h, 50).await;

    assert_eq!(cache_updates(&mut h.events), 100);
    assert_eq!(h.worker.keys().await.unwrap(), vec![CacheKey::get(&url("/"))]);
    assert_eq!(body_of(&h.worker, "/").await.0, "<html>fresh</html>");
}

#[tokio::test]
async fn cached_reads_are_stable_until_revalidated() {
    let h = harness(&["/"]);
    h.worker.install().await.unwrap();
    h.fetcher.set_offline(true);

    for _ in 0..3 {
        let (body, outcome) = body_of(&h.worker, "/").await;
        assert_eq!(body, "<html>home</html>");
        assert_eq!(outcome, Outcome::FromCache);
    }
    h.worker.settle().await;
    assert_eq!(body_of(&h.worker, "/").await.0, "<html>home</html>");
}

#[tokio::test]
async fn failed_revalidation_keeps_entry() {
    let h = harness(&["/"]);
    h.worker.install().await.unwrap();

    h.fetcher
        .route_with("/", StatusCode::INTERNAL_SERVER_ERROR, None, "boom");
    body_of(&h.worker, "/").await;
    h.worker.settle().await;

    assert_eq!(body_of(&h.worker, "/").await.0, "<html>home</html>");
}

#[tokio::test]
async fn non_get_requests_pass_through() {
    let h = harness(&[]);
    h.fetcher.route("/api/items", r#"{"ok":true}"#);
    let post = Request::new(Method::POST, url("/api/items"));

    assert!(h.worker.handle_fetch(&post).await.unwrap().is_none());
    let err = h.worker.intercept(&post).await.unwrap_err();
    assert_eq!(err.category(), "not_intercepted");

    assert_eq!(h.fetcher.calls("/api/items"), 0);
    assert!(h.store.generations().await.unwrap().is_empty());
}

#[tokio::test]
async fn handle_fetch_intercepts_get() {
    let h = harness(&[]);
    let interception = h
        .worker
        .handle_fetch(&Request::get(url("/app.css")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(interception.outcome, Outcome::NetworkCached);
}

#[tokio::test]
async fn non_ok_and_cross_origin_responses_are_not_cached() {
    let h = harness(&[]);
    h.fetcher.route("https://cdn.test/lib.js", "lib");

    let missing = h.worker.intercept(&Request::get(url("/nope"))).await.unwrap();
    assert_eq!(missing.response.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.outcome, Outcome::NetworkUncached);

    let opaque = h
        .worker
        .intercept(&Request::get(Url::parse("https://cdn.test/lib.js").unwrap()))
        .await
        .unwrap();
    assert_eq!(opaque.outcome, Outcome::NetworkUncached);

    assert!(h.worker.keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn offline_navigation_gets_offline_page() {
    let h = harness(&[]);
    h.fetcher.set_offline(true);

    let interception = h
        .worker
        .intercept(&Request::navigate(url("/never-cached")))
        .await
        .unwrap();
    assert_eq!(interception.outcome, Outcome::OfflineFallback);
    assert_eq!(interception.response.status, StatusCode::OK);
    assert_eq!(
        interception.response.headers["content-type"],
        "text/html; charset=utf-8"
    );
    assert!(interception.response.text().unwrap().contains(OFFLINE_MARKER));
}

#[tokio::test]
async fn offline_api_call_gets_json_error() {
    let h = harness(&[]);
    h.fetcher.set_offline(true);

    let interception = h
        .worker
        .intercept(&Request::get(url("/api/users")))
        .await
        .unwrap();
    let body: Value = interception.response.json().unwrap();
    assert_eq!(body["offline"], true);
    assert_eq!(body["error"], "offline");
}

#[tokio::test]
async fn offline_asset_propagates_network_error() {
    let h = harness(&[]);
    h.fetcher.set_offline(true);

    let request = Request::get(url("/logo.png")).destination(Destination::Image);
    let err = h.worker.intercept(&request).await.unwrap_err();
    assert_eq!(err.category(), "network");
}

#[tokio::test]
async fn quota_exceeded_degrades_to_network_only() {
    let h = harness_with(config("v1", &[]), Arc::new(MemoryCacheStore::with_quota(8)));
    h.fetcher.route("/big.json", r#"{"payload":"far more than eight bytes"}"#);

    for _ in 0..2 {
        let interception = h
            .worker
            .intercept(&Request::get(url("/big.json")))
            .await
            .unwrap();
        assert_eq!(interception.outcome, Outcome::NetworkUncached);
        assert_eq!(interception.response.status, StatusCode::OK);
    }
    assert_eq!(h.fetcher.calls("/big.json"), 2);
    assert!(h.worker.keys().await.unwrap().is_empty());
}

// ==================== Administration ====================

#[tokio::test]
async fn evict_and_clear() {
    let h = harness(&["/", "/app.css"]);
    h.worker.install().await.unwrap();

    assert!(h.worker.evict(&url("/app.css")).await.unwrap());
    assert!(!h.worker.evict(&url("/app.css")).await.unwrap());
    assert_eq!(h.worker.keys().await.unwrap(), vec![CacheKey::get(&url("/"))]);

    h.store.open("v0").await.unwrap();
    assert_eq!(h.worker.clear().await.unwrap(), 2);
    assert!(h.store.generations().await.unwrap().is_empty());
}

// ==================== Messages ====================

#[tokio::test]
async fn get_version_replies_over_port() {
    let h = harness(&[]);
    let port = h.worker.connect();

    let reply = port.post_message(json!({ "type": "GET_VERSION" })).await.unwrap();
    assert_eq!(reply, Some(json!({ "version": "v1" })));
}

#[tokio::test]
async fn cache_url_message_stores_resource() {
    let h = harness(&[]);
    h.fetcher.route("/extra.js", "console.log(1)");
    let port = h.worker.connect();

    let reply = port
        .post_message(json!({ "type": "CACHE_URL", "payload": { "url": "/extra.js" } }))
        .await
        .unwrap();
    assert_eq!(reply, Some(json!({ "success": true })));
    assert_eq!(h.worker.keys().await.unwrap(), vec![CacheKey::get(&url("/extra.js"))]);

    let reply = port
        .post_message(json!({ "type": "CACHE_URL", "payload": { "url": "/gone.js" } }))
        .await
        .unwrap()
        .unwrap();
    assert!(reply["error"].is_string());
}

#[tokio::test]
async fn clean_cache_message_keeps_active_generation() {
    let h = harness(&["/"]);
    h.worker.install().await.unwrap();
    h.store.open("v0").await.unwrap();

    let reply = h
        .worker
        .handle_message(json!({ "type": "CLEAN_CACHE" }))
        .await;
    assert_eq!(reply, Some(json!({ "success": true })));
    assert_eq!(h.store.generations().await.unwrap(), vec!["v1".to_string()]);
}

#[tokio::test]
async fn unknown_messages_get_no_reply() {
    let h = harness(&[]);
    let port = h.worker.connect();

    for message in [json!({ "type": "SELF_DESTRUCT" }), json!(42)] {
        assert_eq!(port.post_message(message).await.unwrap(), None);
    }
    // The loop survives bad input.
    let reply = port.post_message(json!({ "type": "GET_VERSION" })).await.unwrap();
    assert!(reply.is_some());
}

#[tokio::test]
async fn commands_without_payload_accept_one() {
    let h = harness(&[]);
    let port = h.worker.connect();

    let reply = port
        .post_message(json!({ "type": "GET_VERSION", "payload": {} }))
        .await
        .unwrap();
    assert_eq!(reply, Some(json!({ "version": "v1" })));
}

#[tokio::test]
async fn skip_waiting_without_waiting_worker_is_a_no_op() {
    let h = harness(&["/"]);
    assert!(h
        .worker
        .handle_message(json!({ "type": "SKIP_WAITING" }))
        .await
        .is_none());
    assert_eq!(h.worker.state().await, ServiceWorkerState::Parsed);
}

#[tokio::test]
async fn install_waits_for_activation() {
    let h = harness(&["/"]);
    h.worker.install().await.unwrap();
    assert_eq!(h.worker.state().await, ServiceWorkerState::Installed);

    // Nothing holds an installed worker back.
    h.worker.activate().await.unwrap();
    assert_eq!(h.worker.state().await, ServiceWorkerState::Activated);
}

#[tokio::test]
async fn skip_waiting_message_activates() {
    let h = harness(&["/"]);
    h.worker.install().await.unwrap();
    let port = h.worker.connect();

    let reply = port.post_message(json!({ "type": "SKIP_WAITING" })).await.unwrap();
    assert_eq!(reply, None);
    assert_eq!(h.worker.state().await, ServiceWorkerState::Activated);
}

// ==================== File store ====================

#[tokio::test]
async fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Arc::new(FileCacheStore::new(dir.path()));
        let h = harness_with(config("v1", &["/", "/app.css"]), store);
        h.worker.install().await.unwrap();
        h.worker.activate().await.unwrap();
    }

    let store = Arc::new(FileCacheStore::new(dir.path()));
    let h = harness_with(config("v1", &[]), store);
    h.fetcher.set_offline(true);

    let (body, outcome) = body_of(&h.worker, "/app.css").await;
    assert_eq!(body, "body { color: red }");
    assert_eq!(outcome, Outcome::FromCache);
}

#[tokio::test]
async fn new_version_replaces_old_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    {
        let h = harness_with(
            config("v1", &["/"]),
            Arc::new(FileCacheStore::new(dir.path())),
        );
        h.worker.install().await.unwrap();
        h.worker.activate().await.unwrap();
    }

    let h = harness_with(
        config("v2", &["/"]),
        Arc::new(FileCacheStore::new(dir.path())),
    );
    h.worker.install().await.unwrap();
    assert_eq!(
        h.store.generations().await.unwrap(),
        vec!["v1".to_string(), "v2".to_string()]
    );

    h.worker.activate().await.unwrap();
    assert_eq!(h.store.generations().await.unwrap(), vec!["v2".to_string()]);
}
