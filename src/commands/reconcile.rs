use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::StreamExt;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use kube_runtime::watcher::{watcher, Config as WatcherConfig, Event};
use parking_lot::RwLock;
use prometheus::{Encoder, Histogram, IntCounter, IntGaugeVec, Registry, TextEncoder};
use reqwest::Client as HttpClient;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use polygov::audit::{self, AuditBudget};
use polygov::config::Config as PolicyConfig;
use polygov::constraint::ConstraintClient;
use polygov::crd::{
    Constraint, ConstraintTemplate, DriverKind, ExpansionRule, ExpansionRuleSpec, Mutator, Provider, SyncConfig,
};
use polygov::driver::expression::ExpressionDriver;
use polygov::driver::rule::RuleDriver;
use polygov::export::ExportFanout;
use polygov::inventory::{Inventory, WatchEvent};
use polygov::matcher::GroupVersionKind;
use polygov::mutation::NamedMutator;
use polygov::provider::{ProviderEndpoint, ProviderRegistry};

/* ============================= CONFIG ============================= */

const STATUS_MANAGER: &str = "polygov-reconcile";

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILE_CYCLES: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("reconcile_cycles_total", "Total reconcile cycles completed").expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("reconcile_errors_total", "Total reconcile errors").expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static CONSTRAINT_TEMPLATES: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(prometheus::Opts::new("constraint_templates_total", "Compiled ConstraintTemplates"), &["process"])
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

static CONSTRAINTS_ACTIVE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(prometheus::Opts::new("constraints_active_total", "Active Constraints"), &["process"])
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

static AUDIT_VIOLATIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("audit_violations_total", "Total violations produced across audit passes").expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static AUDIT_PASS_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new("audit_pass_duration_seconds", "Duration of each audit pass"))
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

/* ============================= STATE ============================= */

struct ReconcileContext {
    constraints: Arc<ConstraintClient>,
    constraint_ids: Arc<RwLock<std::collections::BTreeSet<String>>>,
    mutators: Arc<RwLock<BTreeMap<String, NamedMutator>>>,
    expansion_rules: Arc<RwLock<BTreeMap<String, ExpansionRuleSpec>>>,
    providers: Arc<RwLock<ProviderRegistry>>,
}

struct ReconcileState {
    ready: bool,
}

/* ============================= ENTRY ============================= */

pub async fn run() -> Result<()> {
    println!("Starting policy reconcile loop...\n");
    info!("reconcile_starting");

    let client = Client::try_default().await.context("Failed to connect to Kubernetes cluster")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    LazyLock::force(&RECONCILE_CYCLES);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&AUDIT_VIOLATIONS);
    LazyLock::force(&AUDIT_PASS_DURATION);

    let ctx = Arc::new(ReconcileContext {
        constraints: Arc::new(ConstraintClient::new(Arc::new(RuleDriver::new()), Arc::new(ExpressionDriver::new()))),
        constraint_ids: Arc::new(RwLock::new(std::collections::BTreeSet::new())),
        mutators: Arc::new(RwLock::new(BTreeMap::new())),
        expansion_rules: Arc::new(RwLock::new(BTreeMap::new())),
        providers: Arc::new(RwLock::new(ProviderRegistry::new())),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], 9090));

    println!("  CRD watch .................... ConstraintTemplate/Constraint/Mutator/ExpansionRule/Provider");
    println!("  Metrics server ................ http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET /readyz ............... Readiness probe (503 until first reconcile, then 200)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Reconcile loop running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let state = Arc::new(tokio::sync::Mutex::new(ReconcileState { ready: false }));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_handle = {
        let state = Arc::clone(&state);
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { start_metrics_server(state, shutdown, addr).await })
    };

    let mut watch_handles = Vec::new();
    watch_handles.push(tokio::spawn(watch_templates(client.clone(), Arc::clone(&ctx), shutdown_tx.subscribe())));
    watch_handles.push(tokio::spawn(watch_constraints(client.clone(), Arc::clone(&ctx), shutdown_tx.subscribe())));
    watch_handles.push(tokio::spawn(watch_mutators(client.clone(), Arc::clone(&ctx), shutdown_tx.subscribe())));
    watch_handles.push(tokio::spawn(watch_expansion_rules(client.clone(), Arc::clone(&ctx), shutdown_tx.subscribe())));
    watch_handles.push(tokio::spawn(watch_providers(client.clone(), Arc::clone(&ctx), shutdown_tx.subscribe())));

    let audit_handle = {
        let ctx = Arc::clone(&ctx);
        let state = Arc::clone(&state);
        let client = client.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { audit_loop(client, ctx, state, shutdown).await })
    };

    signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping reconcile loop...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());

    for handle in watch_handles {
        let _ = handle.await;
    }
    let _ = audit_handle.await;
    let _ = http_handle.await?;

    info!("reconcile_stopped");
    println!("Reconcile loop stopped.");
    Ok(())
}

/* ============================= TEMPLATE WATCH ============================= */

async fn watch_templates(client: Client, ctx: Arc<ReconcileContext>, mut shutdown: broadcast::Receiver<()>) {
    let api: Api<ConstraintTemplate> = Api::all(client.clone());
    let mut stream = watcher(api, WatcherConfig::default()).boxed();

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            event = stream.next() => {
                let Some(Ok(event)) = event else { continue };
                match event {
                    Event::Applied(template) => apply_template(&client, &ctx, &template).await,
                    Event::Deleted(template) => {
                        ctx.constraints.remove_template(&template.name_any());
                        info!(template = %template.name_any(), "template_removed");
                    }
                    Event::Restarted(templates) => {
                        for template in templates {
                            apply_template(&client, &ctx, &template).await;
                        }
                    }
                }
                CONSTRAINT_TEMPLATES.with_label_values(&["reconcile"]).set(ctx.constraints.template_names().len() as i64);
            }
        }
    }
}

async fn apply_template(client: &Client, ctx: &ReconcileContext, template: &ConstraintTemplate) {
    let name = template.name_any();
    let targets: Vec<(&str, DriverKind, &str)> =
        template.spec.targets.iter().map(|t| (t.target.as_str(), t.driver, t.source.as_str())).collect();

    match ctx.constraints.add_template(&name, &template.spec.crd_kind, template.spec.parameter_schema.clone(), &targets) {
        Ok(()) => {
            info!(template = %name, kind = %template.spec.crd_kind, "template_reconciled");
            patch_template_status(client, &name, template.namespace().as_deref(), template.metadata.generation, None).await;
        }
        Err(e) => {
            RECONCILE_ERRORS.inc();
            warn!(template = %name, error = %e, "template_compile_failed");
            patch_template_status(client, &name, template.namespace().as_deref(), template.metadata.generation, Some(vec![e.to_string()])).await;
        }
    }
}

/* ============================= CONSTRAINT WATCH ============================= */

async fn watch_constraints(client: Client, ctx: Arc<ReconcileContext>, mut shutdown: broadcast::Receiver<()>) {
    let api: Api<Constraint> = Api::all(client.clone());
    let mut stream = watcher(api, WatcherConfig::default()).boxed();

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            event = stream.next() => {
                let Some(Ok(event)) = event else { continue };
                match event {
                    Event::Applied(constraint) => apply_constraint(&client, &ctx, &constraint).await,
                    Event::Deleted(constraint) => {
                        let id = full_id(&constraint);
                        ctx.constraints.remove_constraint(&id);
                        ctx.constraint_ids.write().remove(&id);
                        info!(constraint = %id, "constraint_removed");
                    }
                    Event::Restarted(constraints) => {
                        for constraint in constraints {
                            apply_constraint(&client, &ctx, &constraint).await;
                        }
                    }
                }
                CONSTRAINTS_ACTIVE.with_label_values(&["reconcile"]).set(ctx.constraint_ids.read().len() as i64);
            }
        }
    }
}

fn full_id(constraint: &Constraint) -> String {
    format!("{}/{}", constraint.spec.kind, constraint.name_any())
}

async fn apply_constraint(client: &Client, ctx: &ReconcileContext, constraint: &Constraint) {
    let id = full_id(constraint);
    ctx.constraints.add_constraint(
        &id,
        &constraint.spec.kind,
        constraint.spec.r#match.clone(),
        constraint.spec.enforcement_action.clone(),
        constraint.spec.parameters.clone(),
    );
    ctx.constraint_ids.write().insert(id.clone());
    info!(constraint = %id, "constraint_reconciled");
    patch_constraint_status(client, &constraint.name_any(), constraint.namespace().as_deref(), constraint.metadata.generation, None).await;
}

/* ============================= MUTATOR WATCH ============================= */

async fn watch_mutators(client: Client, ctx: Arc<ReconcileContext>, mut shutdown: broadcast::Receiver<()>) {
    let api: Api<Mutator> = Api::all(client);
    let mut stream = watcher(api, WatcherConfig::default()).boxed();

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            event = stream.next() => {
                let Some(Ok(event)) = event else { continue };
                match event {
                    Event::Applied(mutator) => apply_mutator(&ctx, &mutator),
                    Event::Deleted(mutator) => {
                        ctx.mutators.write().remove(&mutator.name_any());
                        info!(mutator = %mutator.name_any(), "mutator_removed");
                    }
                    Event::Restarted(mutators) => {
                        for mutator in mutators {
                            apply_mutator(&ctx, &mutator);
                        }
                    }
                }
            }
        }
    }
}

fn apply_mutator(ctx: &ReconcileContext, mutator: &Mutator) {
    let name = mutator.name_any();
    match NamedMutator::new(name.clone(), mutator.spec.r#match.clone(), mutator.spec.variant.clone(), mutator.spec.path_tests.clone()) {
        Ok(named) => {
            ctx.mutators.write().insert(name.clone(), named);
            info!(mutator = %name, "mutator_reconciled");
        }
        Err(e) => {
            RECONCILE_ERRORS.inc();
            warn!(mutator = %name, error = %e, "mutator_validation_failed");
        }
    }
}

/* ============================= EXPANSION RULE WATCH ============================= */

async fn watch_expansion_rules(client: Client, ctx: Arc<ReconcileContext>, mut shutdown: broadcast::Receiver<()>) {
    let api: Api<ExpansionRule> = Api::all(client);
    let mut stream = watcher(api, WatcherConfig::default()).boxed();

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            event = stream.next() => {
                let Some(Ok(event)) = event else { continue };
                match event {
                    Event::Applied(rule) => {
                        ctx.expansion_rules.write().insert(rule.name_any(), rule.spec.clone());
                        info!(rule = %rule.name_any(), "expansion_rule_reconciled");
                    }
                    Event::Deleted(rule) => {
                        ctx.expansion_rules.write().remove(&rule.name_any());
                        info!(rule = %rule.name_any(), "expansion_rule_removed");
                    }
                    Event::Restarted(rules) => {
                        let mut map = ctx.expansion_rules.write();
                        map.clear();
                        for rule in rules {
                            map.insert(rule.name_any(), rule.spec.clone());
                        }
                    }
                }
            }
        }
    }
}

/* ============================= PROVIDER WATCH ============================= */

async fn watch_providers(client: Client, ctx: Arc<ReconcileContext>, mut shutdown: broadcast::Receiver<()>) {
    let api: Api<Provider> = Api::all(client);
    let mut stream = watcher(api, WatcherConfig::default()).boxed();
    let http = HttpClient::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            event = stream.next() => {
                let Some(Ok(event)) = event else { continue };
                match event {
                    Event::Applied(provider) => {
                        match ProviderEndpoint::new(&provider.spec, http.clone()) {
                            Ok(endpoint) => {
                                ctx.providers.write().register(provider.name_any(), endpoint);
                                info!(provider = %provider.name_any(), "provider_reconciled");
                            }
                            Err(e) => {
                                warn!(provider = %provider.name_any(), error = %e, "provider_rejected");
                            }
                        }
                    }
                    Event::Deleted(provider) => {
                        info!(provider = %provider.name_any(), "provider_removed");
                    }
                    Event::Restarted(providers) => {
                        let mut registry = ProviderRegistry::new();
                        for provider in providers {
                            match ProviderEndpoint::new(&provider.spec, http.clone()) {
                                Ok(endpoint) => registry.register(provider.name_any(), endpoint),
                                Err(e) => warn!(provider = %provider.name_any(), error = %e, "provider_rejected"),
                            }
                        }
                        *ctx.providers.write() = registry;
                    }
                }
            }
        }
    }
}

/* ============================= STATUS PATCH-BACK ============================= */

fn by_pod_status_patch(generation: Option<i64>, errors: Option<Vec<String>>) -> serde_json::Value {
    let pod_id = std::env::var("HOSTNAME").unwrap_or_else(|_| "reconcile".to_string());
    serde_json::json!({
        "status": {
            "byPod": {
                pod_id: {
                    "observedGeneration": generation,
                    "enforced": errors.is_none(),
                    "errors": errors,
                }
            }
        }
    })
}

async fn patch_template_status(client: &Client, name: &str, namespace: Option<&str>, generation: Option<i64>, errors: Option<Vec<String>>) {
    let namespace = namespace.unwrap_or("default");
    let api: Api<ConstraintTemplate> = Api::namespaced(client.clone(), namespace);
    let patch = by_pod_status_patch(generation, errors);
    if let Err(e) = api.patch_status(name, &PatchParams::apply(STATUS_MANAGER), &Patch::Merge(&patch)).await {
        warn!(name, error = %e, "template_status_patch_failed");
    }
}

async fn patch_constraint_status(client: &Client, name: &str, namespace: Option<&str>, generation: Option<i64>, errors: Option<Vec<String>>) {
    let namespace = namespace.unwrap_or("default");
    let api: Api<Constraint> = Api::namespaced(client.clone(), namespace);
    let patch = by_pod_status_patch(generation, errors);
    if let Err(e) = api.patch_status(name, &PatchParams::apply(STATUS_MANAGER), &Patch::Merge(&patch)).await {
        warn!(name, error = %e, "constraint_status_patch_failed");
    }
}

/* ============================= AUDIT LOOP ============================= */

async fn audit_loop(client: Client, ctx: Arc<ReconcileContext>, state: Arc<tokio::sync::Mutex<ReconcileState>>, mut shutdown: broadcast::Receiver<()>) {
    let policy_config = PolicyConfig::default();
    let budget = AuditBudget {
        workers: policy_config.audit_workers,
        chunk_size: policy_config.audit_chunk_size,
        ..AuditBudget::default()
    };
    let export = ExportFanout::new(vec![]);
    let mut ticker = tokio::time::interval(policy_config.audit_interval);

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {
                let inventory = refresh_inventory(&client).await;
                let timer = AUDIT_PASS_DURATION.start_timer();
                let outcome = audit::run_pass(Arc::clone(&ctx.constraints), &inventory, &export, &budget).await;
                timer.observe_duration();
                RECONCILE_CYCLES.inc();

                if let audit::PassOutcome::Completed { violation_count } = outcome {
                    AUDIT_VIOLATIONS.inc_by(violation_count as u64);
                    info!(violations = violation_count, "audit_pass_completed");
                } else {
                    RECONCILE_ERRORS.inc();
                    warn!(?outcome, "audit_pass_incomplete");
                }

                let mut s = state.lock().await;
                s.ready = true;
            }
        }
    }
}

/// Rebuilds a fresh, disposable Inventory by listing every currently
/// synced GVK once, used as the audit pass's reference snapshot. Audit
/// tolerates eventual consistency, so a full list per cycle is simpler
/// than maintaining a live watch stream just for this loop.
async fn refresh_inventory(client: &Client) -> Inventory {
    let inventory = Inventory::new();

    let sync_configs: Api<SyncConfig> = Api::namespaced(client.clone(), "default");
    let Ok(list) = sync_configs.list(&ListParams::default()).await else {
        return inventory;
    };
    let Some(config) = list.items.into_iter().next() else {
        return inventory;
    };

    inventory.update_sync(&config.spec);

    let Ok(discovery) = kube::discovery::Discovery::new(client.clone()).run().await else {
        return inventory;
    };

    for synced in &config.spec.sync_only {
        let gvk = GroupVersionKind { group: synced.group.clone(), version: synced.version.clone(), kind: synced.kind.clone() };
        let kube_gvk = kube::core::GroupVersionKind::gvk(&synced.group, &synced.version, &synced.kind);
        let Some((resource, _caps)) = discovery.resolve_gvk(&kube_gvk) else { continue };
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &resource);
        let Ok(list) = api.list(&ListParams::default()).await else { continue };
        for obj in list.items {
            let value = serde_json::to_value(&obj).unwrap_or_default();
            inventory.apply_event(&gvk, WatchEvent::Added(value));
        }
    }

    inventory
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_reconcile_router(state: Arc<tokio::sync::Mutex<ReconcileState>>) -> Router {
    Router::new()
        .route("/metrics", get(reconcile_metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || reconcile_ready_handler(state.clone())
            }),
        )
}

async fn start_metrics_server(state: Arc<tokio::sync::Mutex<ReconcileState>>, mut shutdown: broadcast::Receiver<()>, addr: SocketAddr) -> Result<()> {
    let app = build_reconcile_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await.context("Failed to bind metrics server on :9090")?;

    info!(addr = %addr, "reconcile_metrics_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn reconcile_ready_handler(state: Arc<tokio::sync::Mutex<ReconcileState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn reconcile_metrics_handler() -> impl IntoResponse {
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

/* ============================= TESTS ============================= */
