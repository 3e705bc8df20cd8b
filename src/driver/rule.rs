//! The rule-based driver: compiles declarative rules whose contract
//! is "produce zero or more violation records when evaluated against an
//! `input` binding", with a *reference data* binding for the inventory
//! snapshot.

use std::collections::HashMap;

use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GovernanceError;
use crate::inventory::Snapshot;
use crate::matcher::GroupVersionKind;

use super::{resolve, Driver, RefData, Review, Trace, Violation};

/// A single declarative rule: when `path` resolved against the review
/// object satisfies `op` (against `value`, where the op takes one), the rule
/// fires and contributes `msg` as a violation. `ref_kind` is only consulted
/// by `RuleOp::NotUnique`, which compares `path` against every other object
/// of that kind in the reference-data snapshot rather than against `value`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub path: String,
    pub op: RuleOp,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub ref_kind: Option<RuleRefKind>,
    pub msg: String,
}

/// The kind of object `RuleOp::NotUnique` scans the reference-data snapshot
/// for, e.g. `{group: "networking.k8s.io", version: "v1", kind: "Ingress"}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleRefKind {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl From<&RuleRefKind> for GroupVersionKind {
    fn from(k: &RuleRefKind) -> Self {
        GroupVersionKind { group: k.group.clone(), version: k.version.clone(), kind: k.kind.clone() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleOp {
    Exists,
    NotExists,
    Equals,
    NotEquals,
    Contains,
    EndsWith,
    NotEndsWith,
    CountLessThan,
    CountGreaterThan,
    /// Referential: fires when any value `path` resolves to on the review
    /// object also appears at `path` on some *other* object of `ref_kind`
    /// in the reference-data snapshot (same namespace, different name).
    NotUnique,
}

/// A compiled Template's rule source: a flat list of rules, all evaluated
/// independently against the same review.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuleSource {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

fn eval_op(matches: &[Value], op: RuleOp, expected: Option<&Value>) -> bool {
    match op {
        RuleOp::Exists => !matches.is_empty(),
        RuleOp::NotExists => matches.is_empty(),
        RuleOp::Equals => expected.is_some_and(|e| matches.iter().any(|m| m == e)),
        RuleOp::NotEquals => expected.is_some_and(|e| matches.iter().any(|m| m != e)),
        RuleOp::Contains => expected.and_then(Value::as_str).is_some_and(|needle| {
            matches.iter().filter_map(Value::as_str).any(|s| s.contains(needle))
        }),
        RuleOp::EndsWith => expected.and_then(Value::as_str).is_some_and(|suffix| {
            matches.iter().filter_map(Value::as_str).any(|s| s.ends_with(suffix))
        }),
        RuleOp::NotEndsWith => expected.and_then(Value::as_str).is_some_and(|suffix| {
            matches.iter().filter_map(Value::as_str).any(|s| !s.ends_with(suffix))
        }),
        RuleOp::CountLessThan => expected
            .and_then(Value::as_u64)
            .is_some_and(|n| (matches.len() as u64) < n),
        RuleOp::CountGreaterThan => expected
            .and_then(Value::as_u64)
            .is_some_and(|n| (matches.len() as u64) > n),
    }
}

/// `metadata.name`/`metadata.namespace` identity of an object, used to
/// exclude the reviewed object itself from its own uniqueness scan.
fn identity_of(object: &Value) -> (Option<&str>, Option<&str>) {
    let metadata = object.get("metadata");
    let name = metadata.and_then(|m| m.get("name")).and_then(Value::as_str);
    let namespace = metadata.and_then(|m| m.get("namespace")).and_then(Value::as_str);
    (name, namespace)
}

/// `RuleOp::NotUnique`: true when some value `path` resolves to on `object`
/// is also produced by `path` on a distinct object of `ref_kind` in
/// `ref_data`. Objects with no resolved values never collide with anything.
fn eval_not_unique(rule: &Rule, object: &Value, ref_data: &RefData) -> bool {
    let Some(ref_kind) = &rule.ref_kind else {
        return false;
    };
    let values = resolve(object, &rule.path);
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
        let other_values = resolve(&other, &rule.path);
        if values.iter().any(|v| other_values.contains(v)) {
            return true;
        }
    }
    false
}

fn eval_rule(rule: &Rule, object: &Value, ref_data: &RefData) -> Option<Violation> {
    let fired = match rule.op {
        RuleOp::NotUnique => eval_not_unique(rule, object, ref_data),
        _ => {
            let matches = resolve(object, &rule.path);
            eval_op(&matches, rule.op, rule.value.as_ref())
        }
    };
    if fired {
        Some(Violation {
            msg: rule.msg.clone(),
            details: Value::Object(
                [("path".to_string(), Value::String(rule.path.clone()))].into_iter().collect(),
            ),
        })
    } else {
        None
    }
}

/// The rule-based Driver. Compiled templates are stored behind a
/// `parking_lot::RwLock` keyed by template name; `remove_template` simply
/// drops the map entry, so in-flight `eval` calls that already cloned their
/// `RuleSource` (cheap: a small JSON-shaped struct) keep evaluating it.
#[derive(Default)]
pub struct RuleDriver {
    templates: RwLock<HashMap<String, RuleSource>>,
}

impl RuleDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Driver for RuleDriver {
    fn add_template(&self, name: &str, source: &str) -> Result<(), GovernanceError> {
        let parsed: RuleSource = serde_json::from_str(source)
            .map_err(|e| GovernanceError::Compilation(format!("rule template '{name}': {e}")))?;
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
                "unknown rule template '{template_name}'"
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
                    "no compiled rule template for '{constraint_name}'"
                )));
            };
            for rule in &source.rules {
                if let Some(v) = eval_rule(rule, &review.object, ref_data) {
                    violations.push(v);
                }
            }
        }
        violations.sort_by(|a, b| a.msg.cmp(&b.msg));
        let trace = want_trace.then(|| format!("evaluated {} constraint(s)", constraint_names.len()));
        Ok((violations, trace))
    }
}
