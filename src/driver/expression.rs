//! The expression driver: compiles boolean predicates returning
//! {pass | fail with message}. A predicate is an `Expr` tree evaluated
//! against the review object; when it evaluates true the constraint is
//! considered violated (the predicate names the *bad* condition, mirroring
//! how the rule-based driver's rules each name a failing condition).

use std::collections::HashMap;

use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GovernanceError;
use crate::matcher::GroupVersionKind;

use super::{resolve, Driver, RefData, Review, Trace, Violation};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Expr {
    And { of: Vec<Expr> },
    Or { of: Vec<Expr> },
    Not { of: Box<Expr> },
    Exists { path: String },
    Eq { path: String, value: Value },
    Ne { path: String, value: Value },
    Gt { path: String, value: f64 },
    Lt { path: String, value: f64 },
    /// Referential: true when some value `path` resolves to on the review
    /// object is also produced by `path` on a distinct object of `ref_kind`
    /// in the reference-data snapshot.
    NotUniqueAmongKind { path: String, ref_kind: ExprRefKind },
}

/// The kind of object `Expr::NotUniqueAmongKind` scans the reference-data
/// snapshot for.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExprRefKind {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl From<&ExprRefKind> for GroupVersionKind {
    fn from(k: &ExprRefKind) -> Self {
        GroupVersionKind { group: k.group.clone(), version: k.version.clone(), kind: k.kind.clone() }
    }
}

fn identity_of(object: &Value) -> (Option<&str>, Option<&str>) {
    let metadata = object.get("metadata");
    let name = metadata.and_then(|m| m.get("name")).and_then(Value::as_str);
    let namespace = metadata.and_then(|m| m.get("namespace")).and_then(Value::as_str);
    (name, namespace)
}

fn eval_not_unique_among_kind(path: &str, ref_kind: &ExprRefKind, object: &Value, ref_data: &RefData) -> bool {
    let values = resolve(object, path);
    if values.is_empty() {
        return false;
    }
    let (self_name, self_namespace) = identity_of(object);
    let gvk: GroupVersionKind = ref_kind.into();
    for other in ref_data.list(&gvk) {
        let (other_name, other_namespace) = identity_of(&other);
        if other_name == self_name && other_namespace == self_namespace {
            continue;
        }
        let other_values = resolve(&other, path);
        if values.iter().any(|v| other_values.contains(v)) {
            return true;
        }
    }
    false
}

/// One named assertion a Template target compiles to: when `when`
/// evaluates true against the review object, `message` becomes a violation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Assertion {
    pub when: Expr,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionSource {
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

fn eval_expr(expr: &Expr, object: &Value, ref_data: &RefData) -> bool {
    match expr {
        Expr::And { of } => of.iter().all(|e| eval_expr(e, object, ref_data)),
        Expr::Or { of } => of.iter().any(|e| eval_expr(e, object, ref_data)),
        Expr::Not { of } => !eval_expr(of, object, ref_data),
        Expr::Exists { path } => !resolve(object, path).is_empty(),
        Expr::Eq { path, value } => resolve(object, path).iter().any(|v| v == value),
        Expr::Ne { path, value } => resolve(object, path).iter().any(|v| v != value),
        Expr::Gt { path, value } => resolve(object, path)
            .iter()
            .filter_map(Value::as_f64)
            .any(|n| n > *value),
        Expr::Lt { path, value } => resolve(object, path)
            .iter()
            .filter_map(Value::as_f64)
            .any(|n| n < *value),
        Expr::NotUniqueAmongKind { path, ref_kind } => eval_not_unique_among_kind(path, ref_kind, object, ref_data),
    }
}

/// The expression Driver. Same lock discipline as the rule-based driver:
/// a writer lock for `add_template`/`remove_template`, a reader lock
/// for `eval`, so in-flight evaluations never observe a half-replaced
/// template.
#[derive(Default)]
pub struct ExpressionDriver {
    templates: RwLock<HashMap<String, ExpressionSource>>,
}

impl ExpressionDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Driver for ExpressionDriver {
    fn add_template(&self, name: &str, source: &str) -> Result<(), GovernanceError> {
        let parsed: ExpressionSource = serde_json::from_str(source)
            .map_err(|e| GovernanceError::Compilation(format!("expression template '{name}': {e}")))?;
        self.templates.write().insert(name.to_string(), parsed);
        Ok(())
    }

    fn remove_template(&self, name: &str) {
        self.templates.write().remove(name);
    }

    fn add_constraint(
        &self,
        _name: &str,
        template_name: &str,
        _params: &Value,
    ) -> Result<(), GovernanceError> {
        if !self.templates.read().contains_key(template_name) {
            return Err(GovernanceError::Validation(format!(
                "unknown expression template '{template_name}'"
            )));
        }
        Ok(())
    }

    fn eval(
        &self,
        review: &Review,
        constraint_names: &[String],
        ref_data: &RefData,
        want_trace: bool,
    ) -> Result<(Vec<Violation>, Option<Trace>), GovernanceError> {
        let templates = self.templates.read();
        let mut violations = Vec::new();
        for constraint_name in constraint_names {
            let Some(source) = templates.get(constraint_name) else {
                return Err(GovernanceError::Evaluation(format!(
                    "no compiled expression template for '{constraint_name}'"
                )));
            };
            for assertion in &source.assertions {
                if eval_expr(&assertion.when, &review.object, ref_data) {
                    violations.push(Violation {
                        msg: assertion.message.clone(),
                        details: Value::Null,
                    });
                }
            }
        }
        violations.sort_by(|a, b| a.msg.cmp(&b.msg));
        let trace = want_trace.then(|| format!("evaluated {} constraint(s)", constraint_names.len()));
        Ok((violations, trace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Snapshot;
    use serde_json::json;

    fn review(object: Value) -> Review {
        Review { object, parameters: json!({}) }
    }

    #[test]
    fn test_eq_predicate_fires_violation() {
        let driver = ExpressionDriver::new();
        let source = ExpressionSource {
            assertions: vec![Assertion {
                when: Expr::Eq { path: "spec.hostNetwork".into(), value: json!(true) },
                message: "hostNetwork must not be enabled".into(),
            }],
        };
        driver
            .add_template("no-host-network", &serde_json::to_string(&source).unwrap())
            .unwrap();
        let input = review(json!({"spec": {"hostNetwork": true}}));
        let snapshot = Snapshot::empty();
        let (violations, _) = driver
            .eval(&input, &["no-host-network".to_string()], &snapshot, false)
            .unwrap();
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn test_and_or_not_composition() {
        let expr = Expr::And {
            of: vec![
                Expr::Exists { path: "spec.containers".into() },
                Expr::Not {
                    of: Box::new(Expr::Gt { path: "spec.replicas".into(), value: 1.0 }),
                },
            ],
        };
        let snapshot = Snapshot::empty();
        assert!(eval_expr(
            &expr,
            &json!({"spec": {"containers": [{}], "replicas": 1}}),
            &snapshot,
        ));
        assert!(!eval_expr(
            &expr,
            &json!({"spec": {"containers": [{}], "replicas": 3}}),
            &snapshot,
        ));
    }

    #[test]
    fn test_gt_lt_numeric_no_coercion() {
        // a string value never satisfies a numeric comparison (core never
        // coerces types across review and parameters).
        let snapshot = Snapshot::empty();
        assert!(!eval_expr(
            &Expr::Gt { path: "spec.replicas".into(), value: 0.0 },
            &json!({"spec": {"replicas": "3"}}),
            &snapshot,
        ));
    }

    #[test]
    fn test_unknown_constraint_is_an_evaluation_error() {
        let driver = ExpressionDriver::new();
        let snapshot = Snapshot::empty();
        let result = driver.eval(&review(json!({})), &["missing".to_string()], &snapshot, false);
        assert!(result.is_err());
    }

    fn ingress(name: &str, namespace: &str, host: &str) -> Value {
        json!({
            "metadata": {"name": name, "namespace": namespace},
            "spec": {"rules": [{"host": host}]}
        })
    }

    #[test]
    fn test_not_unique_among_kind_fires_on_shared_host() {
        let driver = ExpressionDriver::new();
        let source = ExpressionSource {
            assertions: vec![Assertion {
                when: Expr::NotUniqueAmongKind {
                    path: "spec.rules[*].host".into(),
                    ref_kind: ExprRefKind { group: "networking.k8s.io".into(), version: "v1".into(), kind: "Ingress".into() },
                },
                message: "ingress host is already claimed by another ingress".into(),
            }],
        };
        driver.add_template("unique-host", &serde_json::to_string(&source).unwrap()).unwrap();

        let inventory = crate::inventory::Inventory::new();
        let gvk = crate::matcher::GroupVersionKind { group: "networking.k8s.io".into(), version: "v1".into(), kind: "Ingress".into() };
        inventory.apply_event(&gvk, crate::inventory::WatchEvent::Added(ingress("other", "default", "shop.example.com")));
        let snapshot = inventory.snapshot();

        let input = review(ingress("web", "default", "shop.example.com"));
        let (violations, _) = driver.eval(&input, &["unique-host".to_string()], &snapshot, false).unwrap();
        assert_eq!(violations.len(), 1);
    }
}
