use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use parking_lot::RwLock;
use prometheus::{Encoder, Histogram, IntCounterVec, Registry, TextEncoder};
use tokio::sync::broadcast;
use tracing::info;

use polygov::admission::{AdmissionRequestInfo, Pipeline};
use polygov::config::Config;
use polygov::constraint::ConstraintClient;
use polygov::driver::expression::ExpressionDriver;
use polygov::driver::rule::RuleDriver;
use polygov::inventory::Inventory;
use polygov::matcher::GroupVersionKind;
use polygov::node::PatchOp;
use polygov::provider::ProviderRegistry;
use polygov::readiness::ReadinessTracker;

/* ============================= PROMETHEUS ============================= */

static WEBHOOK_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static WEBHOOK_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("webhook_requests_total", "Total admission/mutation webhook requests"),
        &["path", "allowed"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static WEBHOOK_DENIALS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("webhook_denials_total", "Total admission denials by namespace"),
        &["namespace"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static MUTATION_PATCHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("mutation_patches_total", "Total JSON-patch operations returned by /mutate"),
        &["op"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static WEBHOOK_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "webhook_request_duration_seconds",
        "Duration of webhook request processing in seconds",
    ))
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

/* ============================= STATE ============================= */

#[derive(Clone)]
pub(crate) struct WebhookState {
    pub(crate) pipeline: Pipeline,
}

/* ============================= ENTRY: SERVE ============================= */

pub async fn serve(addr_str: &str, tls_cert: &str, tls_key: &str) -> Result<()> {
    println!("Starting admission/mutation webhook server...\n");
    info!("webhook_starting");

    print!("  TLS ......................... ");
    validate_tls_files(tls_cert, tls_key)?;
    println!("loaded ({tls_cert}, {tls_key})");

    let addr: SocketAddr = addr_str.parse().context("Invalid address format")?;

    println!("  HTTPS server ................ https://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST /validate ............ Admission review handler");
    println!("    POST /mutate .............. Mutation review handler");
    println!("    GET  /healthz ............. Liveness probe");
    println!("    GET  /readyz .............. Readiness probe");
    println!("    GET  /metrics ............. Prometheus metrics");
    println!();
    println!("Webhook running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let readiness = Arc::new(ReadinessTracker::new());
    readiness.set_expected(Default::default());

    let pipeline = Pipeline {
        constraints: Arc::new(ConstraintClient::new(Arc::new(RuleDriver::new()), Arc::new(ExpressionDriver::new()))),
        inventory: Arc::new(Inventory::new()),
        readiness,
        providers: Arc::new(ProviderRegistry::new()),
        mutators: Arc::new(RwLock::new(Vec::new())),
        expansion_rules: Arc::new(RwLock::new(Vec::new())),
        config: Arc::new(Config::default()),
    };

    let state = WebhookState { pipeline };

    let tls_cert = tls_cert.to_string();
    let tls_key = tls_key.to_string();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let http_shutdown = shutdown_tx.subscribe();

    let http_handle = tokio::spawn(async move { start_https_server(state, http_shutdown, addr, &tls_cert, &tls_key).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping webhook server...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("webhook_stopped");
    println!("Webhook server stopped.");
    Ok(())
}

/* ============================= TLS ============================= */

fn validate_tls_files(cert_path: &str, key_path: &str) -> Result<()> {
    if !std::path::Path::new(cert_path).exists() {
        anyhow::bail!("TLS certificate file not found: {}", cert_path);
    }
    if !std::path::Path::new(key_path).exists() {
        anyhow::bail!("TLS key file not found: {}", key_path);
    }
    Ok(())
}

/* ============================= HTTPS SERVER ============================= */

pub(crate) fn build_webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/validate", post(validate_handler))
        .route("/mutate", post(mutate_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
        .route("/metrics", get(webhook_metrics_handler))
        .with_state(state)
}

async fn start_https_server(
    state: WebhookState,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
    tls_cert: &str,
    tls_key: &str,
) -> Result<()> {
    let app = build_webhook_router(state);

    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(tls_cert, tls_key)
        .await
        .context("Failed to load TLS configuration")?;

    info!(addr = %addr, "https_server_started");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    axum_server::bind_rustls(addr, rustls_config).handle(handle).serve(app.into_make_service()).await?;

    Ok(())
}

async fn ready_handler(state: WebhookState) -> impl IntoResponse {
    if state.pipeline.readiness.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn webhook_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = WEBHOOK_REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

/* ============================= ADMISSION REVIEW PARSING ============================= */

const DEFAULT_ADMISSION_API_VERSION: &str = "admission.k8s.io/v1";

fn parse_request(review: &serde_json::Value) -> Option<AdmissionRequestInfo> {
    let api_version = review
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_ADMISSION_API_VERSION)
        .to_string();
    let request = review.get("request")?;
    let uid = request.get("uid")?.as_str()?.to_string();
    let object = request.get("object").cloned().unwrap_or(serde_json::Value::Null);
    let kind = request.get("kind")?;
    let gvk = GroupVersionKind {
        group: kind.get("group").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        version: kind.get("version").and_then(|v| v.as_str()).unwrap_or("v1").to_string(),
        kind: kind.get("kind").and_then(|v| v.as_str()).unwrap_or("").to_string(),
    };
    let namespace = request.get("namespace").and_then(|v| v.as_str()).map(str::to_string);
    let name = object
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let labels = object
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|v| v.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default();
    let dry_run = request.get("dryRun").and_then(|v| v.as_bool()).unwrap_or(false);
    let is_namespaced = namespace.is_some();

    Some(AdmissionRequestInfo {
        uid,
        object,
        gvk,
        namespace,
        name,
        labels,
        namespace_labels: Default::default(),
        is_namespaced,
        dry_run,
        api_version,
    })
}

/* ============================= /validate ============================= */

async fn validate_handler(State(state): State<WebhookState>, body: String) -> impl IntoResponse {
    let _timer = WEBHOOK_DURATION.start_timer();

    let review: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            info!(error = %e, "invalid_admission_review");
            return (StatusCode::BAD_REQUEST, build_validate_response(DEFAULT_ADMISSION_API_VERSION, "", true, None, &[]));
        }
    };

    let Some(request) = parse_request(&review) else {
        return (StatusCode::OK, build_validate_response(DEFAULT_ADMISSION_API_VERSION, "", true, None, &[]));
    };

    let namespace = request.namespace.clone().unwrap_or_default();
    let uid = request.uid.clone();
    let api_version = request.api_version.clone();

    let outcome = match state.pipeline.validate(&request).await {
        Ok(o) => o,
        Err(e) => {
            info!(error = %e, namespace = %namespace, "pipeline_validate_error");
            WEBHOOK_REQUESTS.with_label_values(&["validate", "true"]).inc();
            return (StatusCode::OK, build_validate_response(&api_version, &uid, true, None, &[]));
        }
    };

    let allowed_str = if outcome.allowed { "true" } else { "false" };
    WEBHOOK_REQUESTS.with_label_values(&["validate", allowed_str]).inc();

    if !outcome.allowed {
        WEBHOOK_DENIALS.with_label_values(&[&namespace]).inc();
        info!(namespace = %namespace, message = ?outcome.message, "admission_denied");
    }

    (
        StatusCode::OK,
        build_validate_response(&api_version, &uid, outcome.allowed, outcome.message.as_deref(), &outcome.warnings),
    )
}

fn build_validate_response(api_version: &str, uid: &str, allowed: bool, message: Option<&str>, warnings: &[String]) -> String {
    let mut response = serde_json::json!({
        "apiVersion": api_version,
        "kind": "AdmissionReview",
        "response": {
            "uid": uid,
            "allowed": allowed
        }
    });

    if let Some(msg) = message {
        response["response"]["status"] = serde_json::json!({ "message": msg });
    }

    if !warnings.is_empty() {
        response["response"]["warnings"] = serde_json::json!(warnings);
    }

    response.to_string()
}

/* ============================= /mutate ============================= */

async fn mutate_handler(State(state): State<WebhookState>, body: String) -> impl IntoResponse {
    let _timer = WEBHOOK_DURATION.start_timer();

    let review: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            info!(error = %e, "invalid_admission_review");
            return (StatusCode::BAD_REQUEST, build_mutate_response(DEFAULT_ADMISSION_API_VERSION, "", &[]));
        }
    };

    let Some(request) = parse_request(&review) else {
        return (StatusCode::OK, build_mutate_response(DEFAULT_ADMISSION_API_VERSION, "", &[]));
    };

    let uid = request.uid.clone();
    let api_version = request.api_version.clone();
    let patch = match state.pipeline.mutate(&request).await {
        Ok(outcome) => outcome.patch,
        Err(e) => {
            info!(error = %e, "pipeline_mutate_error");
            Vec::new()
        }
    };

    for op in &patch {
        let label = match op {
            PatchOp::Add { .. } => "add",
            PatchOp::Remove { .. } => "remove",
            PatchOp::Replace { .. } => "replace",
        };
        MUTATION_PATCHES.with_label_values(&[label]).inc();
    }

    WEBHOOK_REQUESTS.with_label_values(&["mutate", "true"]).inc();
    (StatusCode::OK, build_mutate_response(&api_version, &uid, &patch))
}

fn build_mutate_response(api_version: &str, uid: &str, patch: &[PatchOp]) -> String {
    use base64::Engine;

    let mut response = serde_json::json!({
        "apiVersion": api_version,
        "kind": "AdmissionReview",
        "response": {
            "uid": uid,
            "allowed": true
        }
    });

    if !patch.is_empty() {
        let patch_json = serde_json::to_string(patch).expect("patch ops always serialize");
        response["response"]["patchType"] = serde_json::json!("JSONPatch");
        response["response"]["patch"] = serde_json::json!(base64::engine::general_purpose::STANDARD.encode(patch_json));
    }

    response.to_string()
}

/* ============================= CERT GENERATION ============================= */

pub fn generate_certs(service_name: &str, namespace: &str, output_dir: &str, ip_sans: &[String]) -> Result<()> {
    println!("Generating self-signed TLS certificates...\n");

    let (ca_pem, cert_pem, key_pem) = generate_self_signed_certs(service_name, namespace, ip_sans)?;

    let output_path = std::path::Path::new(output_dir);
    if !output_path.exists() {
        std::fs::create_dir_all(output_path).context("Failed to create output directory")?;
    }

    let ca_path = output_path.join("ca.crt");
    let cert_path = output_path.join("tls.crt");
    let key_path = output_path.join("tls.key");

    std::fs::write(&ca_path, &ca_pem).context("Failed to write ca.crt")?;
    std::fs::write(&cert_path, &cert_pem).context("Failed to write tls.crt")?;
    std::fs::write(&key_path, &key_pem).context("Failed to write tls.key")?;

    println!("  CA certificate .............. {}", ca_path.display());
    println!("  Server certificate .......... {}", cert_path.display());
    println!("  Server key .................. {}", key_path.display());
    println!();
    println!("  Service name ................ {service_name}");
    println!("  Namespace ................... {namespace}");
    println!("  SANs:");
    println!("    - {service_name}.{namespace}.svc");
    println!("    - {service_name}.{namespace}.svc.cluster.local");
    for ip in ip_sans {
        println!("    - {ip} (IP)");
    }
    println!();
    println!("TLS certificates generated successfully.");

    Ok(())
}

pub fn generate_self_signed_certs(service_name: &str, namespace: &str, ip_sans: &[String]) -> Result<(String, String, String)> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
    use std::net::IpAddr;

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, "polygov-webhook-ca");
    ca_dn.push(DnType::OrganizationName, "polygov");
    ca_params.distinguished_name = ca_dn;

    let ca_key = KeyPair::generate().context("Failed to generate CA key pair")?;
    let ca_cert = ca_params.self_signed(&ca_key).context("Failed to self-sign CA certificate")?;

    let mut server_params = CertificateParams::default();
    let mut server_dn = DistinguishedName::new();
    server_dn.push(DnType::CommonName, format!("{service_name}.{namespace}.svc"));
    server_params.distinguished_name = server_dn;

    let mut sans = vec![
        SanType::DnsName(format!("{service_name}.{namespace}.svc").try_into().context("Invalid DNS name for SAN")?),
        SanType::DnsName(
            format!("{service_name}.{namespace}.svc.cluster.local").try_into().context("Invalid DNS name for SAN")?,
        ),
    ];

    for ip_str in ip_sans {
        let ip: IpAddr = ip_str.parse().context(format!("Invalid IP address for SAN: {ip_str}"))?;
        sans.push(SanType::IpAddress(ip));
    }

    server_params.subject_alt_names = sans;

    let server_key = KeyPair::generate().context("Failed to generate server key pair")?;
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).context("Failed to sign server certificate")?;

    let ca_pem = ca_cert.pem();
    let cert_pem = server_cert.pem();
    let key_pem = server_key.serialize_pem();

    Ok((ca_pem, cert_pem, key_pem))
}

/* ============================= INSTALL CONFIG ============================= */

pub fn install_config(service_name: &str, namespace: &str, ca_bundle_path: &str) -> Result<()> {
    use base64::Engine;

    let ca_bytes = std::fs::read(ca_bundle_path).context("Failed to read CA bundle file")?;
    let ca_b64 = base64::engine::general_purpose::STANDARD.encode(&ca_bytes);

    let yaml = format!(
        r#"apiVersion: admissionregistration.k8s.io/v1
kind: ValidatingWebhookConfiguration
metadata:
  name: {service_name}
webhooks:
  - name: validate.governance.polygov.io
    rules:
      - apiGroups: ["*"]
        resources: ["*"]
        apiVersions: ["*"]
        operations: ["CREATE", "UPDATE"]
    clientConfig:
      service:
        name: {service_name}
        namespace: {namespace}
        path: /validate
      caBundle: {ca_b64}
    failurePolicy: Ignore
    sideEffects: None
    admissionReviewVersions: ["v1"]
    namespaceSelector:
      matchExpressions:
        - key: kubernetes.io/metadata.name
          operator: NotIn
          values: ["kube-system", "kube-public", "kube-node-lease"]
---
apiVersion: admissionregistration.k8s.io/v1
kind: MutatingWebhookConfiguration
metadata:
  name: {service_name}-mutating
webhooks:
  - name: mutate.governance.polygov.io
    rules:
      - apiGroups: ["*"]
        resources: ["*"]
        apiVersions: ["*"]
        operations: ["CREATE", "UPDATE"]
    clientConfig:
      service:
        name: {service_name}
        namespace: {namespace}
        path: /mutate
      caBundle: {ca_b64}
    failurePolicy: Ignore
    sideEffects: None
    admissionReviewVersions: ["v1"]
    namespaceSelector:
      matchExpressions:
        - key: kubernetes.io/metadata.name
          operator: NotIn
          values: ["kube-system", "kube-public", "kube-node-lease"]
"#
    );

    println!("{yaml}");
    Ok(())
}

/* ============================= TESTS ============================= */
