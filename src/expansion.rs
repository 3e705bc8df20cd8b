//! Expansion Engine: maps a generator resource to zero or more
//! resultant objects by walking an embedded template path and projecting
//! metadata onto it. Stateless between invocations.

use serde_json::Value;

use crate::crd::ExpansionRuleSpec;
use crate::driver::resolve;
use crate::error::GovernanceError;

/// A resultant object produced by expanding one generator against one rule.
/// Marked `generated` so the mutation/review pipeline treats it as
/// policy-evaluation-only, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Resultant {
    pub kind: String,
    pub generated: bool,
    pub object: Value,
}

/// Expands `generator` against `rule`. Returns one `Resultant` per template
/// found at `rule.template_path`, projected with the generator's namespace,
/// labels, and an owner back-reference annotation (a non-ownership tag —
/// expansion resultants are never actually owned by the generator in the
/// Kubernetes sense, since they're never persisted).
pub fn expand(rule: &ExpansionRuleSpec, generator: &Value) -> Result<Vec<Resultant>, GovernanceError> {
    let templates = resolve(generator, &rule.template_path);
    if templates.is_empty() {
        return Ok(Vec::new());
    }

    let namespace = generator
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .cloned();
    let generator_name = generator
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let generator_kind = generator
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or(&rule.generator_kind)
        .to_string();
    let labels = generator
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .cloned();

    let mut out = Vec::new();
    for kind in &rule.resultant_kinds {
        for template in &templates {
            out.push(Resultant {
                kind: kind.clone(),
                generated: true,
                object: project_metadata(template, namespace.clone(), labels.clone(), &generator_kind, &generator_name),
            });
        }
    }
    Ok(out)
}

fn project_metadata(
    template: &Value,
    namespace: Option<Value>,
    labels: Option<Value>,
    owner_kind: &str,
    owner_name: &str,
) -> Value {
    let mut object = template.clone();
    let metadata = object
        .as_object_mut()
        .map(|o| o.entry("metadata").or_insert_with(|| Value::Object(Default::default())));
    if let Some(Value::Object(meta)) = metadata {
        if let Some(ns) = namespace {
            meta.entry("namespace".to_string()).or_insert(ns);
        }
        if let Some(Value::Object(labels)) = labels {
            let existing = meta
                .entry("labels".to_string())
                .or_insert_with(|| Value::Object(Default::default()));
            if let Value::Object(existing_labels) = existing {
                for (k, v) in labels {
                    existing_labels.entry(k).or_insert(v);
                }
            }
        }
        let annotations = meta
            .entry("annotations".to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(annotations) = annotations {
            annotations.insert(
                "governance.polygov.io/generated-by".to_string(),
                Value::String(format!("{owner_kind}/{owner_name}")),
            );
        }
    }
    object
}
