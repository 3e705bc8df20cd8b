//! Constraint Client: holds compiled Templates and the Constraint
//! instances bound to them, and dispatches Review/Audit calls into the
//! matching Drivers.
//!
//! Compiled artifacts are reference-counted (`Arc<CompiledTemplate>`) so an
//! `add_template` that replaces an older compilation keeps the old one alive
//! for any in-flight `review` holding a clone, and releases it once that
//! clone drops — the lock-free hot-swap pattern used throughout this crate.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{info, warn};

use crate::crd::DriverKind;
use crate::driver::{Driver, RefData, Review, Violation};
use crate::error::GovernanceError;
use crate::matcher::{GroupVersionKind, Match, ObjectIdentity};

/// "admission" or "audit" — which Target category a compiled entry serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Admission,
    Audit,
}

impl TargetKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admission" => Some(Self::Admission),
            "audit" => Some(Self::Audit),
            _ => None,
        }
    }
}

struct CompiledTarget {
    kind: TargetKind,
    driver: DriverKind,
}

/// A compiled Template: its generated CRD kind plus the targets it was
/// compiled for. The `Arc` wrapper is what makes hot-swap safe — a reviewer
/// holds its own `Arc<CompiledTemplate>` clone for the duration of one
/// `review`/`audit` call.
pub struct CompiledTemplate {
    pub crd_kind: String,
    pub parameter_schema: Value,
    targets: Vec<CompiledTarget>,
}

struct ConstraintEntry {
    template_kind: String,
    r#match: Match,
    enforcement_action: String,
    parameters: Value,
    /// Set false when `match`/`parameters` fail validation; such a
    /// Constraint is accepted but never dispatched.
    enforced: bool,
}

/// One Review/Audit result for a single matched Constraint.
#[derive(Debug, Clone)]
pub struct ConstraintResponse {
    pub constraint_full_id: String,
    pub enforcement_action: String,
    pub violations: Vec<Violation>,
    pub error: Option<String>,
    /// `namespace/name` (or bare `name` for cluster-scoped) of the object
    /// reviewed — carried so the audit loop can dedup by `(constraint,
    /// resource, message)`.
    pub resource: String,
}

/// The Constraint Client itself. `templates`/`constraints` are `DashMap`s
/// keyed by name/full-ID for lock-free reads on the admission hot path;
/// each individual entry is still internally consistent because inserts
/// replace the whole `Arc`/struct atomically.
pub struct ConstraintClient {
    templates: DashMap<String, Arc<CompiledTemplate>>,
    constraints: DashMap<String, ConstraintEntry>,
    rule_driver: Arc<dyn Driver>,
    expression_driver: Arc<dyn Driver>,
}

impl ConstraintClient {
    pub fn new(rule_driver: Arc<dyn Driver>, expression_driver: Arc<dyn Driver>) -> Self {
        Self {
            templates: DashMap::new(),
            constraints: DashMap::new(),
            rule_driver,
            expression_driver,
        }
    }

    fn driver_for(&self, kind: DriverKind) -> &Arc<dyn Driver> {
        match kind {
            DriverKind::Rule => &self.rule_driver,
            DriverKind::Expression => &self.expression_driver,
        }
    }

    /// Compiles every target's source into its driver, keyed by the
    /// template's own name (the Driver contract takes one compiled artifact
    /// per `(template, target)`, so this stores a template under
    /// `"{name}/{target}"` in the underlying driver while the constraint
    /// client indexes it by `name` alone).
    pub fn add_template(
        &self,
        name: &str,
        crd_kind: &str,
        parameter_schema: Value,
        targets: &[(&str, DriverKind, &str)],
    ) -> Result<(), GovernanceError> {
        let mut compiled_targets = Vec::with_capacity(targets.len());
        for (target, driver_kind, source) in targets {
            let Some(kind) = TargetKind::parse(target) else {
                return Err(GovernanceError::Validation(format!("unknown target '{target}'")));
            };
            let driver = self.driver_for(*driver_kind);
            driver.add_template(&format!("{name}/{target}"), source)?;
            compiled_targets.push(CompiledTarget { kind, driver: *driver_kind });
        }

        self.templates.insert(
            name.to_string(),
            Arc::new(CompiledTemplate {
                crd_kind: crd_kind.to_string(),
                parameter_schema,
                targets: compiled_targets,
            }),
        );
        info!(template = name, kind = crd_kind, "template compiled");
        Ok(())
    }

    /// Cascades into every Constraint of this Template's kind.
    pub fn remove_template(&self, name: &str) {
        if let Some((_, template)) = self.templates.remove(name) {
            for target in &template.targets {
                self.driver_for(target.driver).remove_template(&format!("{name}/{}", target_label(target.kind)));
            }
        }
        self.constraints.retain(|_, c| c.template_kind != name);
    }

    /// Validates `match`/`parameters`; an invalid Constraint is still
    /// accepted but marked non-enforced.
    pub fn add_constraint(
        &self,
        full_id: &str,
        template_kind: &str,
        r#match: Match,
        enforcement_action: String,
        parameters: Value,
    ) {
        let enforced = self.templates.get(template_kind).is_some();
        if !enforced {
            warn!(constraint = full_id, template = template_kind, "constraint references unknown template");
        }
        self.constraints.insert(
            full_id.to_string(),
            ConstraintEntry { template_kind: template_kind.to_string(), r#match, enforcement_action, parameters, enforced },
        );
    }

    pub fn remove_constraint(&self, full_id: &str) {
        self.constraints.remove(full_id);
    }

    /// Dispatches to every enforced Constraint whose Target matches
    /// `target_kind` and whose match-predicate matches `obj`. A Driver
    /// error for one Constraint is recorded on that Constraint's response
    /// and does not abort the rest.
    pub fn review(
        &self,
        target_kind: TargetKind,
        obj: &ObjectIdentity,
        review_object: &Value,
        ref_data: &RefData,
    ) -> Vec<ConstraintResponse> {
        let mut responses = Vec::new();
        for entry in self.constraints.iter() {
            let (full_id, constraint) = (entry.key().clone(), entry.value());
            if !constraint.enforced {
                continue;
            }
            if !constraint.r#match.matches(obj) {
                continue;
            }
            let Some(template) = self.templates.get(&constraint.template_kind).map(|t| t.clone()) else {
                continue;
            };
            let Some(compiled_target) = template.targets.iter().find(|t| t.kind == target_kind) else {
                continue;
            };

            let driver = self.driver_for(compiled_target.driver);
            let review = Review { object: review_object.clone(), parameters: constraint.parameters.clone() };
            let driver_key = format!("{}/{}", constraint.template_kind, target_label(target_kind));
            let resource = match &obj.namespace {
                Some(ns) => format!("{ns}/{}", obj.name),
                None => obj.name.clone(),
            };
            match driver.eval(&review, &[driver_key], ref_data, false) {
                Ok((violations, _trace)) => responses.push(ConstraintResponse {
                    constraint_full_id: full_id,
                    enforcement_action: constraint.enforcement_action.clone(),
                    violations,
                    error: None,
                    resource,
                }),
                Err(e) => responses.push(ConstraintResponse {
                    constraint_full_id: full_id,
                    enforcement_action: constraint.enforcement_action.clone(),
                    violations: Vec::new(),
                    error: Some(e.to_string()),
                    resource,
                }),
            }
        }
        responses.sort_by(|a, b| a.constraint_full_id.cmp(&b.constraint_full_id));
        responses
    }

    /// Same as `review` but over an iterator of inventory objects.
    pub fn audit<'a>(
        &self,
        identities_and_objects: impl Iterator<Item = (ObjectIdentity, Value)> + 'a,
        ref_data: &RefData,
    ) -> Vec<ConstraintResponse> {
        let mut all = Vec::new();
        for (identity, object) in identities_and_objects {
            all.extend(self.review(TargetKind::Audit, &identity, &object, ref_data));
        }
        all
    }

    pub fn template_names(&self) -> Vec<String> {
        self.templates.iter().map(|e| e.key().clone()).collect()
    }

    /// GVKs referenced by any Constraint's match — feeds the readiness
    /// tracker's `expected` set.
    pub fn referenced_kinds(&self) -> BTreeMap<GroupVersionKind, ()> {
        let mut kinds = BTreeMap::new();
        for entry in self.constraints.iter() {
            for gvk in &entry.value().r#match.kinds {
                kinds.insert(gvk.clone(), ());
            }
        }
        kinds
    }
}

fn target_label(kind: TargetKind) -> &'static str {
    match kind {
        TargetKind::Admission => "admission",
        TargetKind::Audit => "audit",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::rule::RuleDriver;
    use crate::driver::expression::ExpressionDriver;
    use crate::inventory::Snapshot;
    use serde_json::json;

    fn client() -> ConstraintClient {
        ConstraintClient::new(Arc::new(RuleDriver::new()), Arc::new(ExpressionDriver::new()))
    }

    fn identity(kind: &str, ns: &str, name: &str) -> ObjectIdentity {
        use std::collections::BTreeMap;
        ObjectIdentity {
            gvk: GroupVersionKind { group: "".into(), version: "v1".into(), kind: kind.into() },
            namespace: Some(ns.into()),
            name: name.into(),
            labels: BTreeMap::new(),
            namespace_labels: BTreeMap::new(),
            is_namespaced: true,
        }
    }

    fn rule_source(path: &str, msg: &str) -> String {
        use crate::driver::rule::{Rule, RuleOp, RuleSource};
        serde_json::to_string(&RuleSource {
            rules: vec![Rule { path: path.into(), op: RuleOp::NotExists, value: None, ref_kind: None, msg: msg.into() }],
        })
        .unwrap()
    }

    #[test]
    fn test_review_dispatches_matched_enforced_constraint() {
        let client = client();
        client
            .add_template(
                "required-labels",
                "RequiredLabels",
                json!({}),
                &[("admission", DriverKind::Rule, &rule_source("metadata.labels.owner", "missing owner"))],
            )
            .unwrap();
        client.add_constraint(
            "required-labels/default-owner",
            "required-labels",
            Match::default(),
            "deny".into(),
            json!({}),
        );

        let obj = json!({"metadata": {"name": "pod-a", "namespace": "default"}});
        let snapshot = Snapshot::empty();
        let responses = client.review(TargetKind::Admission, &identity("Pod", "default", "pod-a"), &obj, &snapshot);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].violations.len(), 1);
        assert_eq!(responses[0].enforcement_action, "deny");
    }

    #[test]
    fn test_constraint_for_unknown_template_is_non_enforced() {
        let client = client();
        client.add_constraint("x/y", "no-such-template", Match::default(), "deny".into(), json!({}));
        let obj = json!({"metadata": {"name": "pod-a", "namespace": "default"}});
        let snapshot = Snapshot::empty();
        let responses = client.review(TargetKind::Admission, &identity("Pod", "default", "pod-a"), &obj, &snapshot);
        assert!(responses.is_empty());
    }

    #[test]
    fn test_remove_template_cascades_to_constraints() {
        let client = client();
        client
            .add_template("t", "T", json!({}), &[("admission", DriverKind::Rule, &rule_source("a", "m"))])
            .unwrap();
        client.add_constraint("t/c1", "t", Match::default(), "deny".into(), json!({}));
        client.remove_template("t");
        let obj = json!({"metadata": {"name": "x", "namespace": "default"}});
        let snapshot = Snapshot::empty();
        let responses = client.review(TargetKind::Admission, &identity("Pod", "default", "x"), &obj, &snapshot);
        assert!(responses.is_empty());
    }

    #[test]
    fn test_audit_aggregates_across_multiple_objects() {
        let client = client();
        client
            .add_template(
                "t",
                "T",
                json!({}),
                &[("audit", DriverKind::Rule, &rule_source("metadata.labels.owner", "missing owner"))],
            )
            .unwrap();
        client.add_constraint("t/c1", "t", Match::default(), "deny".into(), json!({}));

        let objects = vec![
            (identity("Pod", "default", "a"), json!({"metadata": {"name": "a", "namespace": "default"}})),
            (
                identity("Pod", "default", "b"),
                json!({"metadata": {"name": "b", "namespace": "default", "labels": {"owner": "team"}}}),
            ),
        ];
        let snapshot = Snapshot::empty();
        let responses = client.audit(objects.into_iter(), &snapshot);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses.iter().filter(|r| !r.violations.is_empty()).count(), 1);
    }

    #[test]
    fn test_non_matching_constraint_is_skipped() {
        let client = client();
        client
            .add_template("t", "T", json!({}), &[("admission", DriverKind::Rule, &rule_source("a", "m"))])
            .unwrap();
        client.add_constraint(
            "t/c1",
            "t",
            Match { namespaces: vec!["other-ns".into()], ..Default::default() },
            "deny".into(),
            json!({}),
        );
        let obj = json!({"metadata": {"name": "x", "namespace": "default"}});
        let snapshot = Snapshot::empty();
        let responses = client.review(TargetKind::Admission, &identity("Pod", "default", "x"), &obj, &snapshot);
        assert!(responses.is_empty());
    }
}
