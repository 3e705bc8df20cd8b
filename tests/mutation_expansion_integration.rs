mod common;

use polygov::crd::ExpansionRuleSpec;
use polygov::expansion::expand;
use polygov::matcher::Match;
use polygov::mutation::{self, AssignValueSource, MetadataField, MutatorVariant, NamedMutator, SetOp};
use polygov::node::Node;

use serde_json::json;

/* ============================= MUTATION + EXPANSION ============================= */
//
// Exercises the Mutation Engine's fixed-point application combined with
// the Expansion Engine's generator-to-resultant projection, without any
// network calls (no mock-HTTP-server crate is available for the
// Provider protocol, so external-data placeholders are exercised at the
// unit level in `provider.rs` instead).

#[test]
fn test_mutators_apply_in_fixed_partition_order() {
    let mutators = vec![
        NamedMutator::new(
            "assign-value",
            Match::default(),
            MutatorVariant::AssignValue { path: "spec.replicas".into(), source: AssignValueSource::Literal { value: json!(3) } },
            vec![],
        )
        .unwrap(),
        NamedMutator::new(
            "assign-metadata",
            Match::default(),
            MutatorVariant::AssignMetadata { metadata_path: "metadata.labels.team".into(), value: json!("platform") },
            vec![],
        )
        .unwrap(),
    ];

    let out = mutation::apply(&mutators, &json!({"metadata": {"name": "web"}, "spec": {}}), 3).unwrap();
    assert_eq!(out["metadata"]["labels"]["team"], json!("platform"));
    assert_eq!(out["spec"]["replicas"], json!(3));
}

#[test]
fn test_modify_set_merge_then_prune_round_trips() {
    let merge = vec![NamedMutator::new(
        "add-finalizer",
        Match::default(),
        MutatorVariant::ModifySet {
            path: "metadata.finalizers".into(),
            op: SetOp::Merge,
            from_list: vec![json!("governance.polygov.io/cleanup")],
        },
        vec![],
    )
    .unwrap()];

    let once = mutation::apply(&merge, &json!({"metadata": {"name": "web"}}), 3).unwrap();
    assert_eq!(once["metadata"]["finalizers"], json!(["governance.polygov.io/cleanup"]));

    let prune = vec![NamedMutator::new(
        "remove-finalizer",
        Match::default(),
        MutatorVariant::ModifySet {
            path: "metadata.finalizers".into(),
            op: SetOp::Prune,
            from_list: vec![json!("governance.polygov.io/cleanup")],
        },
        vec![],
    )
    .unwrap()];
    let pruned = mutation::apply(&prune, &once, 3).unwrap();
    assert_eq!(pruned["metadata"]["finalizers"], json!([]));
}

#[test]
fn test_mutation_reaches_fixed_point_idempotently() {
    let mutators = vec![NamedMutator::new(
        "pin-tag",
        Match::default(),
        MutatorVariant::AssignImage {
            path: "spec.containers[name: main].image".into(),
            domain: None,
            image_path: None,
            tag: Some("1.25".into()),
        },
        vec![],
    )
    .unwrap()];

    let object = json!({"spec": {"containers": [{"name": "main", "image": "nginx:latest"}]}});
    let once = mutation::apply(&mutators, &object, 3).unwrap();
    let twice = mutation::apply(&mutators, &once, 3).unwrap();
    assert_eq!(once, twice);
    assert_eq!(once["spec"]["containers"][0]["image"], json!("nginx:1.25"));
}

#[test]
fn test_assign_value_from_metadata_name() {
    let mutators = vec![NamedMutator::new(
        "name-label",
        Match::default(),
        MutatorVariant::AssignValue {
            path: "metadata.labels.injected-name".into(),
            source: AssignValueSource::FromMetadata { field: MetadataField::Name },
        },
        vec![],
    )
    .unwrap()];

    let out = mutation::apply(&mutators, &json!({"metadata": {"name": "web"}}), 3).unwrap();
    assert_eq!(out["metadata"]["labels"]["injected-name"], json!("web"));
}

#[test]
fn test_expansion_resultant_then_mutation_applied_to_expanded_object() {
    let rule = ExpansionRuleSpec {
        generator_kind: "Deployment".into(),
        resultant_kinds: vec!["Pod".into()],
        template_path: "spec.template".into(),
    };
    let generator = json!({
        "kind": "Deployment",
        "metadata": {"name": "web", "namespace": "prod"},
        "spec": {"template": {"metadata": {}, "spec": {"containers": [{"name": "main", "image": "nginx:latest"}]}}}
    });

    let resultants = expand(&rule, &generator).unwrap();
    assert_eq!(resultants.len(), 1);
    assert!(resultants[0].generated);

    let mutators = vec![NamedMutator::new(
        "pin-image",
        Match::default(),
        MutatorVariant::AssignImage {
            path: "spec.containers[name: main].image".into(),
            domain: Some("registry.internal".into()),
            image_path: None,
            tag: Some("1.25".into()),
        },
        vec![],
    )
    .unwrap()];
    let mutated = mutation::apply(&mutators, &resultants[0].object, 3).unwrap();
    assert_eq!(mutated["spec"]["containers"][0]["image"], json!("registry.internal/nginx:1.25"));
}

#[test]
fn test_node_roundtrip_preserves_object_shape_across_mutation() {
    let object = json!({"metadata": {"name": "web"}, "spec": {"replicas": 1}});
    let node = Node::from_json(&object);
    assert_eq!(node.to_json(), object);
}
