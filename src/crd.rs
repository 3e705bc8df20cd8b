//! Policy-resource schemas: Templates, Constraints, Mutators,
//! Expansion rules, Sync config and Providers are each externally-defined
//! Kubernetes resources. Every status type carries `by_pod`, a per-replica
//! substructure (`status.byPod[podID]`) so multiple process replicas publish
//! disjoint subkeys without a cross-replica read-modify-write.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::matcher::Match;
use crate::mutation::{ExternalDataRef, MutatorVariant, PathTest};

/* ============================= SHARED STATUS ============================= */

/// One process replica's view of a policy resource's health. Replicas only
/// ever write their own `byPod` slot.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforced: Option<bool>,
}

/// The generic status shape shared by Templates, Constraints and Mutators.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ByPodStatus {
    #[serde(default)]
    pub by_pod: BTreeMap<String, PodStatus>,
}

/* ============================= TEMPLATE ============================= */

/// Which Driver compiles a Template target's source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DriverKind {
    Rule,
    Expression,
}

/// One target a Template carries source for: the category the
/// target applies to ("admission" or "audit") plus the driver and source.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateTarget {
    /// "admission" or "audit" — see `crate::constraint::TargetKind`.
    pub target: String,
    pub driver: DriverKind,
    pub source: String,
}

/// ConstraintTemplate: declares the API kind its Constraints take on,
/// a parameter schema, and one or more driver targets.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "governance.polygov.io",
    version = "v1",
    kind = "ConstraintTemplate",
    plural = "constrainttemplates",
    status = "ByPodStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintTemplateSpec {
    /// The Constraint kind this Template generates, e.g. `RequiredLabels`.
    /// Unique process-wide.
    pub crd_kind: String,

    /// JSON Schema (draft-07 subset) for Constraint parameters.
    #[serde(default)]
    pub parameter_schema: Value,

    pub targets: Vec<TemplateTarget>,
}

/* ============================= CONSTRAINT ============================= */

/// Conventional enforcement-action values; the field itself is an opaque
/// string so operators may define their own.
pub mod enforcement_action {
    pub const DENY: &str = "deny";
    pub const WARN: &str = "warn";
    pub const DRYRUN: &str = "dryrun";
    pub const SCOPED: &str = "scoped";
}

/// A generic Constraint: an instance of some Template's kind, supplying
/// concrete parameters, a match predicate, and an enforcement action. The
/// `kind` field names which compiled Template this instance belongs to — the
/// real Kubernetes resource would take on the Template's generated kind as
/// its own CRD kind; this core models that indirection explicitly instead of
/// generating one CRD type per Template at compile time.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "governance.polygov.io",
    version = "v1",
    kind = "Constraint",
    plural = "constraints",
    status = "ByPodStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintSpec {
    /// The Template kind this Constraint instantiates.
    pub kind: String,

    #[serde(default)]
    pub r#match: Match,

    /// Opaque enforcement action label; conventionally one of
    /// `enforcement_action::{DENY,WARN,DRYRUN,SCOPED}`.
    pub enforcement_action: String,

    /// Concrete parameters, validated against the Template's schema.
    #[serde(default)]
    pub parameters: Value,
}

/* ============================= MUTATOR ============================= */

/// A Mutator resource: one named, ordered transform over the
/// unstructured object tree.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "governance.polygov.io",
    version = "v1",
    kind = "Mutator",
    plural = "mutators",
    status = "ByPodStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MutatorSpec {
    #[serde(default)]
    pub r#match: Match,

    pub variant: MutatorVariant,

    #[serde(default)]
    pub path_tests: Vec<PathTest>,
}

/* ============================= EXPANSION RULE ============================= */

/// An Expansion rule: maps a generator GVK to the resultant GVKs
/// materialized from its embedded template(s).
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "governance.polygov.io",
    version = "v1",
    kind = "ExpansionRule",
    plural = "expansionrules",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ExpansionRuleSpec {
    pub generator_kind: String,
    pub resultant_kinds: Vec<String>,
    /// Dotted path to the embedded template, e.g. `spec.template`.
    pub template_path: String,
}

/* ============================= SYNC CONFIG ============================= */

/// Process tags a synced object may be excluded from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SyncProcess {
    Sync,
    Audit,
    Webhook,
    MutationWebhook,
    #[serde(rename = "*")]
    Star,
}

/// One GVK the cache manager should watch.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncedGvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

/// SyncConfig: the set of GVKs to sync plus global exclusion rules
/// (namespaces, processes).
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "governance.polygov.io",
    version = "v1",
    kind = "SyncConfig",
    plural = "syncconfigs",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfigSpec {
    pub sync_only: Vec<SyncedGvk>,
    #[serde(default)]
    pub excluded_namespaces: Vec<String>,
    #[serde(default)]
    pub excluded_processes: Vec<SyncProcess>,
}

/* ============================= PROVIDER ============================= */

/// A Provider resource: the connection info for an external-data
/// endpoint referenced by `ExternalDataRef`.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "governance.polygov.io",
    version = "v1",
    kind = "Provider",
    plural = "providers",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    pub url: String,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub ca_bundle: Option<String>,
}

fn default_provider_timeout_ms() -> u64 {
    1000
}

impl ExternalDataRef {
    /// Resolves the provider name this reference targets, for looking it up
    /// in the process-scope provider registry.
    pub fn provider_name(&self) -> &str {
        &self.provider
    }
}

/* ============================= TESTS ============================= */
