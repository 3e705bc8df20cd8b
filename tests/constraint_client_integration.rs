mod common;

use common::{client, identity, pod, pod_with_labels};

use polygov::constraint::TargetKind;
use polygov::crd::{enforcement_action, DriverKind};
use polygov::inventory::Snapshot;
use polygov::matcher::Match;

/* ============================= TEMPLATE / CONSTRAINT LIFECYCLE ============================= */
//
// Exercises the full Template -> Constraint -> review/audit lifecycle
// through ConstraintClient, including hot-swap and cascading removal.

#[tokio::test]
async fn test_add_template_then_constraint_then_review() {
    let c = client();
    common::add_required_label_template(&c, "required-labels", "RequiredLabels", "metadata.labels.owner", "missing owner");
    c.add_constraint("required-labels/default", "required-labels", common::match_all(), enforcement_action::DENY.to_string(), serde_json::json!({}));

    let snapshot = Snapshot::empty();
    let responses = c.review(TargetKind::Admission, &identity("Pod", Some("default"), "web"), &pod("web", "default"), &snapshot);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].violations.len(), 1);
}

#[tokio::test]
async fn test_template_hot_swap_recompiles_without_dropping_constraint() {
    let c = client();
    common::add_required_label_template(&c, "t", "T", "metadata.labels.owner", "missing owner");
    c.add_constraint("t/c", "t", common::match_all(), enforcement_action::DENY.to_string(), serde_json::json!({}));

    // Recompile the same template name with a different rule: the old
    // compiled artifact is dropped in favor of the new one, and the
    // existing Constraint keeps pointing at it by name.
    common::add_required_label_template(&c, "t", "T", "metadata.labels.team", "missing team");

    let snapshot = Snapshot::empty();
    let responses = c.review(TargetKind::Admission, &identity("Pod", Some("default"), "web"), &pod_with_labels("web", "default", &[("owner", "x")]), &snapshot);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].violations[0].msg, "missing team");
}

#[tokio::test]
async fn test_remove_template_cascades_to_its_constraints() {
    let c = client();
    common::add_required_label_template(&c, "t", "T", "metadata.labels.owner", "missing owner");
    c.add_constraint("t/c1", "t", common::match_all(), enforcement_action::DENY.to_string(), serde_json::json!({}));
    c.remove_template("t");

    let snapshot = Snapshot::empty();
    let responses = c.review(TargetKind::Admission, &identity("Pod", Some("default"), "web"), &pod("web", "default"), &snapshot);
    assert!(responses.is_empty());
    assert!(c.template_names().is_empty());
}

#[tokio::test]
async fn test_constraint_referencing_unknown_template_is_accepted_but_non_enforced() {
    let c = client();
    c.add_constraint("x/y", "no-such-template", common::match_all(), enforcement_action::DENY.to_string(), serde_json::json!({}));

    let snapshot = Snapshot::empty();
    let responses = c.review(TargetKind::Admission, &identity("Pod", Some("default"), "web"), &pod("web", "default"), &snapshot);
    assert!(responses.is_empty());
}

#[tokio::test]
async fn test_constraint_becomes_enforced_once_its_template_arrives() {
    let c = client();
    c.add_constraint("t/c", "t", common::match_all(), enforcement_action::DENY.to_string(), serde_json::json!({}));
    let snapshot = Snapshot::empty();
    let before = c.review(TargetKind::Admission, &identity("Pod", Some("default"), "web"), &pod("web", "default"), &snapshot);
    assert!(before.is_empty());

    common::add_required_label_template(&c, "t", "T", "metadata.labels.owner", "missing owner");
    // Re-adding the same constraint re-evaluates its template reference.
    c.add_constraint("t/c", "t", common::match_all(), enforcement_action::DENY.to_string(), serde_json::json!({}));
    let after = c.review(TargetKind::Admission, &identity("Pod", Some("default"), "web"), &pod("web", "default"), &snapshot);
    assert_eq!(after.len(), 1);
}

#[tokio::test]
async fn test_review_responses_sorted_deterministically_by_full_id() {
    let c = client();
    common::add_required_label_template(&c, "b-template", "B", "metadata.labels.owner", "missing owner");
    common::add_required_label_template(&c, "a-template", "A", "metadata.labels.owner", "missing owner");
    c.add_constraint("b-template/c", "b-template", common::match_all(), enforcement_action::DENY.to_string(), serde_json::json!({}));
    c.add_constraint("a-template/c", "a-template", common::match_all(), enforcement_action::DENY.to_string(), serde_json::json!({}));

    let snapshot = Snapshot::empty();
    let responses = c.review(TargetKind::Admission, &identity("Pod", Some("default"), "web"), &pod("web", "default"), &snapshot);
    let ids: Vec<&str> = responses.iter().map(|r| r.constraint_full_id.as_str()).collect();
    assert_eq!(ids, vec!["a-template/c", "b-template/c"]);
}

#[tokio::test]
async fn test_audit_target_ignores_admission_only_template() {
    let c = client();
    common::add_required_label_template(&c, "t", "T", "metadata.labels.owner", "missing owner");
    c.add_constraint("t/c", "t", common::match_all(), enforcement_action::DENY.to_string(), serde_json::json!({}));

    let snapshot = Snapshot::empty();
    let responses = c.review(TargetKind::Audit, &identity("Pod", Some("default"), "web"), &pod("web", "default"), &snapshot);
    assert!(responses.is_empty());
}

#[tokio::test]
async fn test_referenced_kinds_collects_every_constraint_kind_filter() {
    let c = client();
    c.add_constraint(
        "t/c",
        "t",
        Match { kinds: vec![polygov::matcher::GroupVersionKind { group: "".into(), version: "v1".into(), kind: "Pod".into() }], ..Default::default() },
        enforcement_action::DENY.to_string(),
        serde_json::json!({}),
    );
    let kinds = c.referenced_kinds();
    assert_eq!(kinds.len(), 1);
}

#[tokio::test]
async fn test_expression_driver_target_dispatches_distinctly_from_rule_driver() {
    use polygov::driver::expression::{Assertion, Expr, ExpressionSource};

    let c = client();
    let source = ExpressionSource {
        assertions: vec![Assertion {
            when: Expr::Not { of: Box::new(Expr::Exists { path: "metadata.labels.owner".into() }) },
            message: "missing owner".into(),
        }],
    };
    c.add_template(
        "t",
        "T",
        serde_json::json!({}),
        &[("admission", DriverKind::Expression, &serde_json::to_string(&source).unwrap())],
    )
    .unwrap();
    c.add_constraint("t/c", "t", common::match_all(), enforcement_action::DENY.to_string(), serde_json::json!({}));

    let snapshot = Snapshot::empty();
    let responses = c.review(TargetKind::Admission, &identity("Pod", Some("default"), "web"), &pod("web", "default"), &snapshot);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].violations[0].msg, "missing owner");
}
