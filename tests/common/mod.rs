use polygov::constraint::ConstraintClient;
use polygov::crd::DriverKind;
use polygov::driver::expression::ExpressionDriver;
use polygov::driver::rule::{Rule, RuleDriver, RuleOp, RuleSource};
use polygov::matcher::{GroupVersionKind, Match, ObjectIdentity};

use std::collections::BTreeMap;
use std::sync::Arc;

/// A fresh `ConstraintClient` with both drivers wired in, ready for
/// `add_template`/`add_constraint` calls.
pub fn client() -> ConstraintClient {
    ConstraintClient::new(Arc::new(RuleDriver::new()), Arc::new(ExpressionDriver::new()))
}

pub fn identity(kind: &str, namespace: Option<&str>, name: &str) -> ObjectIdentity {
    ObjectIdentity {
        gvk: GroupVersionKind { group: "".into(), version: "v1".into(), kind: kind.into() },
        namespace: namespace.map(str::to_string),
        name: name.into(),
        labels: BTreeMap::new(),
        namespace_labels: BTreeMap::new(),
        is_namespaced: namespace.is_some(),
    }
}

pub fn identity_with_labels(kind: &str, namespace: Option<&str>, name: &str, labels: &[(&str, &str)]) -> ObjectIdentity {
    let mut identity = identity(kind, namespace, name);
    identity.labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    identity
}

/// A one-rule `RuleSource` that flags `path` missing from the object.
pub fn not_exists_rule_source(path: &str, msg: &str) -> String {
    serde_json::to_string(&RuleSource {
        rules: vec![Rule { path: path.into(), op: RuleOp::NotExists, value: None, ref_kind: None, msg: msg.into() }],
    })
    .expect("rule source always serializes")
}

/// Shorthand for a one-target admission Template compiled from a
/// NotExists rule.
pub fn add_required_label_template(client: &ConstraintClient, name: &str, crd_kind: &str, label_path: &str, msg: &str) {
    client
        .add_template(
            name,
            crd_kind,
            serde_json::json!({}),
            &[("admission", DriverKind::Rule, &not_exists_rule_source(label_path, msg))],
        )
        .unwrap();
}

pub fn pod(name: &str, namespace: &str) -> serde_json::Value {
    serde_json::json!({"metadata": {"name": name, "namespace": namespace}})
}

pub fn pod_with_labels(name: &str, namespace: &str, labels: &[(&str, &str)]) -> serde_json::Value {
    let labels: BTreeMap<&str, &str> = labels.iter().cloned().collect();
    serde_json::json!({"metadata": {"name": name, "namespace": namespace, "labels": labels}})
}

pub fn match_all() -> Match {
    Match::default()
}
