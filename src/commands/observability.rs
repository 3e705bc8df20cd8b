use anyhow::Result;

/* ============================= SERVICE GENERATORS ============================= */

const NAMESPACE: &str = "polygov";
const APP_NAME: &str = "polygov";

pub fn generate_service(component: &str, port: u16) -> String {
    format!(
        r#"apiVersion: v1
kind: Service
metadata:
  name: {APP_NAME}-{component}
  namespace: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
    app.kubernetes.io/component: {component}
spec:
  selector:
    app.kubernetes.io/name: {APP_NAME}
    app.kubernetes.io/component: {component}
  ports:
    - name: metrics
      port: {port}
      targetPort: {port}
      protocol: TCP
"#
    )
}

pub fn generate_service_sync() -> String {
    generate_service("sync", 8080)
}

pub fn generate_service_reconcile() -> String {
    generate_service("reconcile", 9090)
}

pub fn generate_service_webhook() -> String {
    generate_service("webhook", 8443)
}

/* ============================= SERVICEMONITOR GENERATORS ============================= */

pub fn generate_service_monitor(component: &str, port: u16) -> String {
    let scheme = if port == 8443 { "https" } else { "http" };

    let mut yaml = format!(
        r#"apiVersion: monitoring.coreos.com/v1
kind: ServiceMonitor
metadata:
  name: {APP_NAME}-{component}
  namespace: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
    app.kubernetes.io/component: {component}
    release: stable
spec:
  selector:
    matchLabels:
      app.kubernetes.io/name: {APP_NAME}
      app.kubernetes.io/component: {component}
  endpoints:
    - port: metrics
      path: /metrics
      interval: 15s
      scheme: {scheme}
"#
    );

    if port == 8443 {
        yaml.push_str(
            "      tlsConfig:\n        insecureSkipVerify: true\n",
        );
    }

    yaml
}

pub fn generate_service_monitor_sync() -> String {
    generate_service_monitor("sync", 8080)
}

pub fn generate_service_monitor_reconcile() -> String {
    generate_service_monitor("reconcile", 9090)
}

pub fn generate_service_monitor_webhook() -> String {
    generate_service_monitor("webhook", 8443)
}

/* ============================= GRAFANA DASHBOARD ============================= */

pub fn generate_grafana_dashboard_configmap() -> Result<String> {
    let dashboard = build_dashboard_json();
    let dashboard_str = serde_json::to_string_pretty(&dashboard)?;

    let indented: String = dashboard_str
        .lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n");

    Ok(format!(
        r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: {APP_NAME}-grafana-dashboard
  namespace: {NAMESPACE}
  labels:
    app.kubernetes.io/name: {APP_NAME}
    grafana_dashboard: "1"
data:
  polygov.json: |
{indented}
"#
    ))
}

fn build_dashboard_json() -> serde_json::Value {
    serde_json::json!({
        "annotations": { "list": [] },
        "editable": true,
        "fiscalYearStartMonth": 0,
        "graphTooltip": 1,
        "id": null,
        "links": [],
        "panels": [
            // ── Row 1: Overview ──
            row_panel(0, "Overview"),
            stat_panel(1, "Inventory Readiness", "readiness_state", 0),
            graph_panel(2, "Reconcile Cycles", "rate(reconcile_cycles_total[5m])", 0),
            graph_panel(3, "Admission Requests", "rate(webhook_requests_total[5m])", 0),

            // ── Row 2: Inventory / Sync ──
            row_panel(4, "Inventory"),
            graph_panel(5, "Objects Tracked", "inventory_objects_total", 1),
            graph_panel(6, "Watch Events Rate", "rate(inventory_events_total[5m])", 1),
            stat_panel(7, "Expected Kinds Observed", "readiness_observed_kinds", 1),

            // ── Row 3: Reconcile & Audit ──
            row_panel(8, "Reconcile & Audit"),
            graph_panel(9, "Reconcile Errors", "rate(reconcile_errors_total[5m])", 2),
            graph_panel(10, "Audit Pass Violations", "audit_violations_total", 2),
            graph_panel(11, "Audit Pass Duration", "histogram_quantile(0.99, rate(audit_pass_duration_seconds_bucket[5m]))", 2),
            stat_panel(12, "Templates Compiled", "constraint_templates_total", 2),
            stat_panel(13, "Constraints Active", "constraints_active_total", 2),

            // ── Row 4: Webhook ──
            row_panel(14, "Webhook"),
            graph_panel(15, "Allow/Deny Rate", "rate(webhook_requests_total[5m])", 3),
            graph_panel(16, "Denial Breakdown", "rate(webhook_denials_total[5m])", 3),
            graph_panel(17, "Request Latency", "histogram_quantile(0.99, rate(webhook_request_duration_seconds_bucket[5m]))", 3),
            graph_panel(18, "Mutation Patches Applied", "rate(mutation_patches_total[5m])", 3),

            // ── Row 5: Export & Providers ──
            row_panel(19, "Export & Providers"),
            graph_panel(20, "Sink Accepted", "rate(export_sink_accepted_total[5m])", 4),
            graph_panel(21, "Sink Dropped", "rate(export_sink_dropped_total[5m])", 4),
            graph_panel(22, "Provider Call Errors", "rate(provider_errors_total[5m])", 4),
        ],
        "schemaVersion": 39,
        "tags": ["kubernetes", "polygov"],
        "templating": { "list": [] },
        "time": { "from": "now-1h", "to": "now" },
        "title": "polygov Observability",
        "uid": "polygov-overview",
        "version": 1
    })
}

fn row_panel(id: u32, title: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": "row",
        "title": title,
        "collapsed": false,
        "panels": []
    })
}

fn stat_panel(id: u32, title: &str, expr: &str, _row: u32) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": "stat",
        "title": title,
        "targets": [{
            "expr": expr,
            "refId": "A"
        }],
        "fieldConfig": {
            "defaults": {
                "thresholds": {
                    "steps": [
                        { "color": "green", "value": null },
                        { "color": "red", "value": 80 }
                    ]
                }
            }
        }
    })
}

fn graph_panel(id: u32, title: &str, expr: &str, _row: u32) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": "timeseries",
        "title": title,
        "targets": [{
            "expr": expr,
            "refId": "A"
        }],
        "fieldConfig": {
            "defaults": {}
        }
    })
}

/* ============================= GENERATE ALL ============================= */

pub fn generate_all() -> Result<()> {
    let mut output = String::new();

    output.push_str(&generate_service_sync());
    output.push_str("---\n");
    output.push_str(&generate_service_reconcile());
    output.push_str("---\n");
    output.push_str(&generate_service_webhook());
    output.push_str("---\n");
    output.push_str(&generate_service_monitor_sync());
    output.push_str("---\n");
    output.push_str(&generate_service_monitor_reconcile());
    output.push_str("---\n");
    output.push_str(&generate_service_monitor_webhook());
    output.push_str("---\n");
    output.push_str(&generate_grafana_dashboard_configmap()?);

    println!("{output}");
    Ok(())
}

pub fn generate_service_monitors() -> Result<()> {
    let mut output = String::new();

    output.push_str(&generate_service_monitor_sync());
    output.push_str("---\n");
    output.push_str(&generate_service_monitor_reconcile());
    output.push_str("---\n");
    output.push_str(&generate_service_monitor_webhook());

    println!("{output}");
    Ok(())
}

/* ============================= TESTS ============================= */
