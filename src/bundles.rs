//! Built-in Template library: a small set of ready-made ConstraintTemplate
//! sources an operator can load without authoring rule/expression source by
//! hand. Each bundle pairs a Template (name, CRD kind, compiled source) with
//! a suggested default Constraint so `polygov crd install --bundle <name>`
//! has something sensible to apply.

use serde_json::json;

use crate::crd::{enforcement_action, DriverKind};
use crate::driver::rule::{Rule, RuleOp, RuleRefKind, RuleSource};
use crate::matcher::Match;

/// A built-in Template plus a ready-to-apply default Constraint.
#[derive(Debug, Clone)]
pub struct TemplateBundle {
    pub name: String,
    pub description: String,
    pub crd_kind: String,
    pub driver: DriverKind,
    pub source: String,
    pub default_enforcement_action: String,
}

/// Returns every built-in bundle.
pub fn all_bundles() -> Vec<TemplateBundle> {
    vec![required_labels_bundle(), no_latest_tag_bundle(), unique_ingress_host_bundle()]
}

/// Looks up a bundle by name (case-insensitive).
pub fn get_bundle(name: &str) -> Option<TemplateBundle> {
    let lower = name.to_lowercase();
    all_bundles().into_iter().find(|b| b.name == lower)
}

fn required_labels_bundle() -> TemplateBundle {
    let source = RuleSource {
        rules: vec![Rule {
            path: "metadata.labels.owner".into(),
            op: RuleOp::NotExists,
            value: None,
            ref_kind: None,
            msg: "object is missing the required 'owner' label".into(),
        }],
    };
    TemplateBundle {
        name: "required-labels".to_string(),
        description: "Requires every matched object to carry an 'owner' label.".to_string(),
        crd_kind: "RequiredLabels".to_string(),
        driver: DriverKind::Rule,
        source: serde_json::to_string(&source).expect("bundle source always serializes"),
        default_enforcement_action: enforcement_action::DENY.to_string(),
    }
}

fn no_latest_tag_bundle() -> TemplateBundle {
    let source = RuleSource {
        rules: vec![Rule {
            path: "spec.containers[*].image".into(),
            op: RuleOp::EndsWith,
            value: Some(json!(":latest")),
            ref_kind: None,
            msg: "containers must not use the ':latest' image tag".into(),
        }],
    };
    TemplateBundle {
        name: "no-latest-tag".to_string(),
        description: "Forbids containers from pinning to the ':latest' image tag.".to_string(),
        crd_kind: "NoLatestTag".to_string(),
        driver: DriverKind::Rule,
        source: serde_json::to_string(&source).expect("bundle source always serializes"),
        default_enforcement_action: enforcement_action::WARN.to_string(),
    }
}

/// Requires every Ingress rule to declare a host, and that no two Ingresses
/// in the cluster claim the same host. The second rule is referential:
/// `RuleOp::NotUnique` consults the reference-data snapshot for every other
/// `networking.k8s.io/v1` Ingress, so it only fires during admission review
/// and audit passes that thread a populated snapshot (inventory must sync
/// `Ingress`).
fn unique_ingress_host_bundle() -> TemplateBundle {
    let source = RuleSource {
        rules: vec![
            Rule {
                path: "spec.rules[*].host".into(),
                op: RuleOp::NotExists,
                value: None,
                ref_kind: None,
                msg: "ingress rule is missing a host".into(),
            },
            Rule {
                path: "spec.rules[*].host".into(),
                op: RuleOp::NotUnique,
                value: None,
                ref_kind: Some(RuleRefKind {
                    group: "networking.k8s.io".into(),
                    version: "v1".into(),
                    kind: "Ingress".into(),
                }),
                msg: "ingress host is already claimed by another ingress".into(),
            },
        ],
    };
    TemplateBundle {
        name: "unique-ingress-host".to_string(),
        description: "Requires every Ingress rule to declare an explicit, cluster-unique host.".to_string(),
        crd_kind: "RequireIngressHost".to_string(),
        driver: DriverKind::Rule,
        source: serde_json::to_string(&source).expect("bundle source always serializes"),
        default_enforcement_action: enforcement_action::DENY.to_string(),
    }
}

/// The default `Match` a bundle's Constraint ships with: every namespace,
/// every kind the Template's rules make sense for is left to the caller to
/// restrict via `kinds`.
pub fn default_match() -> Match {
    Match::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_bundles_have_unique_names() {
        let names: Vec<String> = all_bundles().into_iter().map(|b| b.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(names.len(), sorted.len());
    }

    #[test]
    fn test_get_bundle_case_insensitive() {
        assert!(get_bundle("REQUIRED-LABELS").is_some());
        assert!(get_bundle("Required-Labels").is_some());
        assert!(get_bundle("nonexistent").is_none());
    }

    #[test]
    fn test_bundle_source_compiles_in_rule_driver() {
        use crate::driver::rule::RuleDriver;
        use crate::driver::Driver;

        let bundle = get_bundle("no-latest-tag").unwrap();
        let driver = RuleDriver::new();
        driver.add_template(&bundle.name, &bundle.source).unwrap();
    }

    #[test]
    fn test_bundles_carry_sensible_default_enforcement_actions() {
        for bundle in all_bundles() {
            assert!(
                bundle.default_enforcement_action == enforcement_action::DENY
                    || bundle.default_enforcement_action == enforcement_action::WARN
            );
        }
    }
}
