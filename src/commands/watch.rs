use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::chrono::{self, Utc};
use kube::api::DynamicObject;
use kube::{Api, Client};
use kube_runtime::watcher::{watcher, Config as WatcherConfig, Event};
use prometheus::{Encoder, IntCounter, IntGaugeVec, Registry, TextEncoder};
use tokio::sync::broadcast;
use tokio::{signal, time::sleep};
use tracing::{info, warn};

use polygov::crd::{SyncConfig, SyncConfigSpec};
use polygov::inventory::{Inventory, ObjectKey, WatchEvent};
use polygov::matcher::GroupVersionKind;
use polygov::readiness::ReadinessTracker;

/* ============================= CONFIG ============================= */

const LEASE_NAME: &str = "polygov-sync-leader";
const LEASE_NAMESPACE: &str = "default";
const LEASE_DURATION_SECONDS: i32 = 15;
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static INVENTORY_EVENTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("inventory_events_total", "Total watch events applied to the inventory")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static INVENTORY_OBJECTS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("inventory_objects_total", "Objects currently tracked, per kind"),
        &["kind"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

/* ============================= ENTRY ============================= */

pub async fn run() -> Result<()> {
    println!("Starting inventory sync watcher...\n");
    info!("sync_starting");

    let client = Client::try_default().await.context("Failed to connect to Kubernetes cluster")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    print!("  Leader election .............. ");
    if !acquire_leader(&client).await? {
        println!("waiting (another instance holds the lease)");
        info!("not_leader_waiting");
        loop {
            sleep(Duration::from_secs(10)).await;
        }
    }
    println!("acquired");
    info!("leader_acquired");

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));

    println!("  HTTP server .................. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET /readyz ............... Readiness probe (503 until initial sync, then 200)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Sync watcher running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let inventory = Arc::new(Inventory::new());
    let readiness = Arc::new(ReadinessTracker::new());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let renewal_client = client.clone();
    let renewal_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move { lease_renewal_loop(renewal_client, renewal_shutdown).await });

    let sync_shutdown = shutdown_tx.subscribe();
    let sync_handle = tokio::spawn(sync_config_watch_loop(
        client.clone(),
        Arc::clone(&inventory),
        Arc::clone(&readiness),
        sync_shutdown,
    ));

    let http_handle = {
        let readiness = Arc::clone(&readiness);
        let http_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { start_http_server(readiness, http_shutdown, addr).await })
    };

    signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping sync watcher...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());

    let _ = sync_handle.await?;
    let _ = http_handle.await?;

    info!("sync_stopped");
    println!("Sync watcher stopped.");
    Ok(())
}

/* ============================= LEADER ELECTION ============================= */

async fn acquire_leader(client: &Client) -> Result<bool> {
    let leases: Api<Lease> = Api::namespaced(client.clone(), LEASE_NAMESPACE);

    let now = MicroTime(Utc::now());

    let lease = Lease {
        metadata: ObjectMeta { name: Some(LEASE_NAME.to_string()), ..Default::default() },
        spec: Some(LeaseSpec {
            holder_identity: Some("polygov-sync-instance".to_string()),
            lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            ..Default::default()
        }),
    };

    match leases.create(&Default::default(), &lease).await {
        Ok(_) => return Ok(true),
        Err(kube::Error::Api(err)) if err.code == 409 => {
            info!("lease_exists_checking_expiry");
        }
        Err(_) => return Ok(false),
    }

    let existing = leases.get(LEASE_NAME).await?;

    let can_take = match &existing.spec {
        Some(spec) => {
            let is_ours = spec.holder_identity.as_deref() == Some("polygov-sync-instance");
            let is_expired = spec.renew_time.as_ref().is_none_or(|t| {
                let duration_secs = spec.lease_duration_seconds.unwrap_or(15) as i64;
                Utc::now().signed_duration_since(t.0) > chrono::Duration::seconds(duration_secs)
            });
            is_ours || is_expired
        }
        None => true,
    };

    if !can_take {
        return Ok(false);
    }

    info!("lease_takeover");
    let now = MicroTime(Utc::now());
    let patch = serde_json::json!({
        "spec": {
            "holderIdentity": "polygov-sync-instance",
            "leaseDurationSeconds": LEASE_DURATION_SECONDS,
            "acquireTime": now,
            "renewTime": now
        }
    });

    match leases.patch(LEASE_NAME, &kube::api::PatchParams::default(), &kube::api::Patch::Merge(&patch)).await {
        Ok(_) => Ok(true),
        Err(_) => Ok(false),
    }
}

async fn lease_renewal_loop(client: Client, mut shutdown: broadcast::Receiver<()>) {
    let leases: Api<Lease> = Api::namespaced(client, LEASE_NAMESPACE);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("lease_renewal_stopped");
                return;
            }
            _ = sleep(LEASE_RENEW_INTERVAL) => {
                let now = MicroTime(Utc::now());
                let patch = serde_json::json!({ "spec": { "renewTime": now } });
                if let Err(e) = leases
                    .patch(LEASE_NAME, &kube::api::PatchParams::default(), &kube::api::Patch::Merge(&patch))
                    .await
                {
                    info!(error = %e, "lease_renewal_failed");
                }
            }
        }
    }
}

/* ============================= SYNCCONFIG-DRIVEN WATCH ============================= */

/// Watches the cluster's SyncConfig resource (by convention, a single
/// `default` object) and maintains one watcher task per synced GVK, tearing
/// down watchers for kinds dropped from `sync_only` and spinning up new ones.
async fn sync_config_watch_loop(
    client: Client,
    inventory: Arc<Inventory>,
    readiness: Arc<ReadinessTracker>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let sync_configs: Api<SyncConfig> = Api::namespaced(client.clone(), "default");
    let mut active: HashMap<GroupVersionKind, tokio::task::JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                for (_, handle) in active.drain() {
                    handle.abort();
                }
                return Ok(());
            }
            result = sync_configs.list(&kube::api::ListParams::default()) => {
                match result {
                    Ok(list) => {
                        if let Some(config) = list.items.into_iter().next() {
                            reconcile_watchers(&client, &inventory, &readiness, &config.spec, &mut active);
                        }
                    }
                    Err(e) => warn!(error = %e, "sync_config_list_failed"),
                }
                sleep(Duration::from_secs(10)).await;
            }
        }
    }
}

fn reconcile_watchers(
    client: &Client,
    inventory: &Arc<Inventory>,
    readiness: &Arc<ReadinessTracker>,
    spec: &SyncConfigSpec,
    active: &mut HashMap<GroupVersionKind, tokio::task::JoinHandle<()>>,
) {
    let diff = inventory.update_sync(spec);

    let wanted: Vec<GroupVersionKind> =
        spec.sync_only.iter().map(|g| GroupVersionKind { group: g.group.clone(), version: g.version.clone(), kind: g.kind.clone() }).collect();

    let mut expected = std::collections::BTreeMap::new();
    for gvk in &wanted {
        expected.insert(gvk.clone(), 1);
    }
    readiness.set_expected(expected);

    for gvk in &diff.to_remove {
        if let Some(handle) = active.remove(gvk) {
            handle.abort();
            info!(kind = %gvk.kind, "sync_watcher_stopped");
        }
    }

    for gvk in diff.to_add {
        let client = client.clone();
        let inventory = Arc::clone(inventory);
        let readiness = Arc::clone(readiness);
        let task_gvk = gvk.clone();
        let handle = tokio::spawn(async move { watch_one_kind(client, task_gvk, inventory, readiness).await });
        active.insert(gvk, handle);
    }
}

async fn watch_one_kind(client: Client, gvk: GroupVersionKind, inventory: Arc<Inventory>, readiness: Arc<ReadinessTracker>) {
    let kube_gvk = kube::core::GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
    let discovery = match kube::discovery::Discovery::new(client.clone()).run().await {
        Ok(d) => d,
        Err(e) => {
            warn!(kind = %gvk.kind, error = %e, "kind_discovery_failed");
            return;
        }
    };
    let resource = match discovery.resolve_gvk(&kube_gvk) {
        Some((resource, _caps)) => resource,
        None => {
            warn!(kind = %gvk.kind, "kind_not_found_in_cluster");
            return;
        }
    };

    let api: Api<DynamicObject> = Api::all_with(client, &resource);
    let mut stream = watcher(api, WatcherConfig::default()).boxed();
    let mut observed_initial = false;

    while let Some(event) = stream.next().await {
        let Ok(event) = event else { continue };
        INVENTORY_EVENTS.inc();

        match event {
            Event::Applied(obj) => {
                let value = serde_json::to_value(&obj).unwrap_or_default();
                inventory.apply_event(&gvk, WatchEvent::Added(value));
            }
            Event::Deleted(obj) => {
                if let Some(key) = dynamic_object_key(&gvk, &obj) {
                    inventory.apply_event(&gvk, WatchEvent::Deleted(key));
                }
            }
            Event::Restarted(objs) => {
                for obj in objs {
                    let value = serde_json::to_value(&obj).unwrap_or_default();
                    inventory.apply_event(&gvk, WatchEvent::Added(value));
                }
                inventory.apply_event(&gvk, WatchEvent::InitialListComplete);
                if !observed_initial {
                    observed_initial = true;
                    readiness.mark_observed(&gvk);
                    info!(kind = %gvk.kind, "initial_list_complete");
                }
            }
        }

        INVENTORY_OBJECTS.with_label_values(&[&gvk.kind]).set(inventory.snapshot().list(&gvk).count() as i64);
    }
}

fn dynamic_object_key(gvk: &GroupVersionKind, obj: &DynamicObject) -> Option<ObjectKey> {
    Some(ObjectKey {
        gvk: gvk.clone(),
        namespace: obj.metadata.namespace.clone(),
        name: obj.metadata.name.clone()?,
    })
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_router(readiness: Arc<ReadinessTracker>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let readiness = readiness.clone();
                move || ready_handler(readiness.clone())
            }),
        )
}

async fn start_http_server(readiness: Arc<ReadinessTracker>, mut shutdown: broadcast::Receiver<()>, addr: SocketAddr) -> Result<()> {
    let app = build_router(readiness);

    let listener = tokio::net::TcpListener::bind(addr).await.context("Failed to bind HTTP server on :8080")?;

    info!(addr = %addr, "http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(readiness: Arc<ReadinessTracker>) -> impl IntoResponse {
    if readiness.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let app = build_router(Arc::new(ReadinessTracker::new()));
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_readyz_vacuously_ready_with_no_expected_kinds() {
        let app = build_router(Arc::new(ReadinessTracker::new()));
        let req = Request::builder().uri("/readyz").body(Body::empty()).unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_not_ready_until_observed() {
        let readiness = Arc::new(ReadinessTracker::new());
        let mut expected = std::collections::BTreeMap::new();
        expected.insert(GroupVersionKind { group: "".into(), version: "v1".into(), kind: "Pod".into() }, 1);
        readiness.set_expected(expected);

        let app = build_router(readiness);
        let req = Request::builder().uri("/readyz").body(Body::empty()).unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_returns_ok() {
        let app = build_router(Arc::new(ReadinessTracker::new()));
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let app = build_router(Arc::new(ReadinessTracker::new()));
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_inventory_events_metric_registered() {
        LazyLock::force(&INVENTORY_EVENTS);
        let families = REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"inventory_events_total"));
    }

    #[test]
    fn test_dynamic_object_key_requires_name() {
        let gvk = GroupVersionKind { group: "".into(), version: "v1".into(), kind: "Pod".into() };
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "namespace": "default" }
        }))
        .unwrap();
        assert!(dynamic_object_key(&gvk, &obj).is_none());
    }

    #[test]
    fn test_dynamic_object_key_present() {
        let gvk = GroupVersionKind { group: "".into(), version: "v1".into(), kind: "Pod".into() };
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "namespace": "default", "name": "web-1" }
        }))
        .unwrap();
        let key = dynamic_object_key(&gvk, &obj).unwrap();
        assert_eq!(key.name, "web-1");
        assert_eq!(key.namespace.as_deref(), Some("default"));
    }
}
