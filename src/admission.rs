//! Admission Pipeline: wires the Readiness Tracker, Expansion
//! Engine, Mutation Engine, Constraint Client and Provider registry into
//! the two admission-review code paths, `/validate` and `/mutate`.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::config::{Config, FailMode, TimeoutPolicy};
use crate::constraint::{ConstraintClient, TargetKind};
use crate::crd::{enforcement_action, ExpansionRuleSpec};
use crate::error::GovernanceError;
use crate::expansion;
use crate::inventory::Inventory;
use crate::matcher::{GroupVersionKind, ObjectIdentity};
use crate::mutation::{self, NamedMutator};
use crate::node::{self, Node};
use crate::provider::ProviderRegistry;
use crate::readiness::ReadinessTracker;

/// Everything an admission review needs pulled out of the wire request
/// (decoded by the webhook transport layer — see `commands::webhook`).
#[derive(Debug, Clone)]
pub struct AdmissionRequestInfo {
    pub uid: String,
    pub object: Value,
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub namespace_labels: BTreeMap<String, String>,
    pub is_namespaced: bool,
    pub dry_run: bool,
    /// The `apiVersion` the incoming `AdmissionReview` was sent with
    /// (`admission.k8s.io/v1` or `/v1beta1`); echoed back on the response.
    pub api_version: String,
}

impl AdmissionRequestInfo {
    fn identity(&self) -> ObjectIdentity {
        ObjectIdentity {
            gvk: self.gvk.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            labels: self.labels.clone(),
            namespace_labels: self.namespace_labels.clone(),
            is_namespaced: self.is_namespaced,
        }
    }
}

/// Outcome of a `/validate` call.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub allowed: bool,
    pub warnings: Vec<String>,
    pub message: Option<String>,
}

/// Outcome of a `/mutate` call: the minimal JSON-patch edit
/// from the original object to the mutated one.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub patch: Vec<node::PatchOp>,
}

/// Shared state the pipeline dispatches into on every request. Cloning is
/// cheap (every field is an `Arc`/`RwLock` handle) so one `Pipeline` is
/// built once at startup and cloned into each request task.
#[derive(Clone)]
pub struct Pipeline {
    pub constraints: Arc<ConstraintClient>,
    pub inventory: Arc<Inventory>,
    pub readiness: Arc<ReadinessTracker>,
    pub providers: Arc<ProviderRegistry>,
    pub mutators: Arc<RwLock<Vec<NamedMutator>>>,
    pub expansion_rules: Arc<RwLock<Vec<ExpansionRuleSpec>>>,
    pub config: Arc<Config>,
}

impl Pipeline {
    /// `/validate`: expand, mutate-for-policy-only, review,
    /// and collate per enforcement action.
    pub async fn validate(&self, request: &AdmissionRequestInfo) -> Result<ValidationOutcome, GovernanceError> {
        self.with_budget(self.validate_inner(request)).await
    }

    /// `/mutate`: apply the mutation plan to the root object
    /// only and return the minimal edit as a JSON-patch.
    pub async fn mutate(&self, request: &AdmissionRequestInfo) -> Result<MutationOutcome, GovernanceError> {
        self.with_budget(self.mutate_inner(request)).await
    }

    async fn with_budget<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, GovernanceError>>,
    ) -> Result<T, GovernanceError>
    where
        T: TimeoutFallback,
    {
        let budget = self.config.pipeline_budget;
        match tokio::time::timeout(budget, fut).await {
            Ok(result) => result,
            Err(_) => match self.config.timeout_policy {
                TimeoutPolicy::Deny => Err(GovernanceError::Timeout(budget)),
                TimeoutPolicy::Allow => Ok(T::on_timeout()),
            },
        }
    }

    async fn validate_inner(&self, request: &AdmissionRequestInfo) -> Result<ValidationOutcome, GovernanceError> {
        if !self.readiness.is_ready() {
            return match self.config.readiness_fail_mode {
                FailMode::FailClosed => Ok(ValidationOutcome {
                    allowed: false,
                    warnings: Vec::new(),
                    message: Some("inventory not ready".to_string()),
                }),
                FailMode::FailOpen => Ok(ValidationOutcome { allowed: true, warnings: Vec::new(), message: None }),
            };
        }

        let mut objects_to_review = vec![(request.identity(), request.object.clone())];

        for rule in self.expansion_rules.read().iter() {
            if rule.generator_kind != request.gvk.kind {
                continue;
            }
            let resultants = expansion::expand(rule, &request.object)?;
            for resultant in resultants {
                let mut identity = request.identity();
                identity.gvk.kind = resultant.kind;
                objects_to_review.push((identity, resultant.object));
            }
        }

        let snapshot = self.inventory.snapshot();
        let mutators = self.mutators.read().clone();
        let mut deny_messages = Vec::new();
        let mut warnings = Vec::new();

        for (identity, object) in objects_to_review {
            let mutated = mutation::apply(&mutators, &object, self.config.mutation_max_iterations)?;
            let resolved = crate::provider::resolve_placeholders(Node::from_json(&mutated), &self.providers).await?;
            let final_object = resolved.to_json();

            let responses = self.constraints.review(TargetKind::Admission, &identity, &final_object, &snapshot);
            for response in responses {
                if response.violations.is_empty() {
                    if let Some(err) = response.error {
                        warn!(constraint = response.constraint_full_id, error = %err, "constraint evaluation error");
                    }
                    continue;
                }
                let combined = response
                    .violations
                    .iter()
                    .map(|v| v.msg.clone())
                    .collect::<Vec<_>>()
                    .join("; ");
                match response.enforcement_action.as_str() {
                    enforcement_action::DENY => {
                        deny_messages.push(format!("[{}] {combined}", response.constraint_full_id))
                    }
                    enforcement_action::WARN | enforcement_action::SCOPED => {
                        warnings.push(format!("[{}] {combined}", response.constraint_full_id))
                    }
                    _ => {}
                }
            }
        }

        if deny_messages.is_empty() {
            Ok(ValidationOutcome { allowed: true, warnings, message: None })
        } else {
            Ok(ValidationOutcome { allowed: false, warnings, message: Some(deny_messages.join(" | ")) })
        }
    }

    async fn mutate_inner(&self, request: &AdmissionRequestInfo) -> Result<MutationOutcome, GovernanceError> {
        let mutators = self.mutators.read().clone();
        let mutated = mutation::apply(&mutators, &request.object, self.config.mutation_max_iterations)?;
        let resolved = crate::provider::resolve_placeholders(Node::from_json(&mutated), &self.providers).await?;
        let final_object = resolved.to_json();
        let patch = node::diff(&request.object, &final_object);
        Ok(MutationOutcome { patch })
    }
}

/// What a timed-out pipeline call returns under `timeout-policy=allow`.
trait TimeoutFallback {
    fn on_timeout() -> Self;
}

impl TimeoutFallback for ValidationOutcome {
    fn on_timeout() -> Self {
        ValidationOutcome {
            allowed: true,
            warnings: vec!["admission pipeline timed out; admitted under timeout-policy=allow".to_string()],
            message: None,
        }
    }
}

impl TimeoutFallback for MutationOutcome {
    fn on_timeout() -> Self {
        MutationOutcome { patch: Vec::new() }
    }
}
