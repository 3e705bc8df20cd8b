//! The Match predicate shared by Constraints and Mutators, and the
//! deterministic match-evaluation order:
//!
//!   (namespace-inclusion) -> (namespace-exclusion) -> (kind match) ->
//!   (name/glob match) -> (label selectors)
//!
//! Any negative result short-circuits.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Resource scope a Constraint/Mutator can be restricted to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ResourceScope {
    #[default]
    All,
    Cluster,
    Namespaced,
}

/// A single group/version/kind filter. An empty string in any field means
/// "any" for that field — wildcard inference is never applied beyond that;
/// kind filters match the type exactly.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub kind: String,
}

/// A label selector: a conjunction of exact-match requirements.
///
/// This is the core-vocabulary subset of Kubernetes' label selector (exact
/// match only); `match_labels` must all be satisfied against the object's
/// labels for the selector to match. An empty selector matches everything.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// The reusable match structure, used by both
/// Constraints and Mutators.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    /// Kinds this predicate applies to. Empty means "any kind".
    #[serde(default)]
    pub kinds: Vec<GroupVersionKind>,

    /// Namespaces this predicate is restricted to (glob `*` supported).
    /// Empty means "all namespaces" (subject to `excluded_namespaces`).
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Namespaces this predicate never applies to, regardless of `namespaces`.
    #[serde(default)]
    pub excluded_namespaces: Vec<String>,

    #[serde(default)]
    pub label_selector: LabelSelector,

    #[serde(default)]
    pub namespace_label_selector: LabelSelector,

    #[serde(default)]
    pub scope: ResourceScope,

    /// Object name glob; empty means "any name".
    #[serde(default)]
    pub name: String,
}

/// The subset of an object's identity relevant to matching. Built once per
/// review/audit object and reused across every Constraint/Mutator match
/// check for that object.
#[derive(Debug, Clone)]
pub struct ObjectIdentity {
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub namespace_labels: BTreeMap<String, String>,
    pub is_namespaced: bool,
}

pub(crate) fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    pattern == value
}

impl Match {
    /// Evaluates the match in the deterministic order. Short-circuits on
    /// the first negative result.
    pub fn matches(&self, obj: &ObjectIdentity) -> bool {
        // (namespace-inclusion)
        if !self.namespaces.is_empty() {
            let Some(ns) = &obj.namespace else { return false };
            if !self.namespaces.iter().any(|p| glob_match(p, ns)) {
                return false;
            }
        }

        // (namespace-exclusion)
        if let Some(ns) = &obj.namespace
            && self.excluded_namespaces.iter().any(|p| glob_match(p, ns))
        {
            return false;
        }

        // (kind match) — exact (G,V,K) match, no wildcard inference.
        if !self.kinds.is_empty() && !self.kinds.iter().any(|k| k.kind == obj.gvk.kind
            && (k.group.is_empty() || k.group == obj.gvk.group)
            && (k.version.is_empty() || k.version == obj.gvk.version))
        {
            return false;
        }

        // (scope)
        match self.scope {
            ResourceScope::All => {}
            ResourceScope::Cluster if obj.is_namespaced => return false,
            ResourceScope::Namespaced if !obj.is_namespaced => return false,
            _ => {}
        }

        // (name/glob match)
        if !glob_match(&self.name, &obj.name) {
            return false;
        }

        // (label selectors)
        if !self.label_selector.matches(&obj.labels) {
            return false;
        }
        if !self.namespace_label_selector.matches(&obj.namespace_labels) {
            return false;
        }

        true
    }
}
