//! Driver: compiles policy source into a callable form and
//! evaluates it against a structured review input. Two concrete drivers are
//! shipped: a rule-based driver and an expression driver.

pub mod expression;
pub mod rule;

use serde_json::Value;

use crate::error::GovernanceError;
use crate::inventory::Snapshot;

/// One violation record a compiled Template produces for a matched review:
/// `{msg: string, details: object}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub msg: String,
    pub details: Value,
}

/// The structured review input bound to policy source under evaluation.
#[derive(Debug, Clone)]
pub struct Review {
    pub object: Value,
    pub parameters: Value,
}

/// A reference-counted read-only handle on the inventory snapshot, bound as
/// the rule-based driver's "reference data".
pub type RefData = Snapshot;

/// Opaque trace text, appended to a response when a caller requests it.
pub type Trace = String;

/// Shared contract for both concrete drivers. A
/// Driver never retains partial state across a failed `add_template`, and
/// `remove_template` must be safe to call concurrently with `eval` — readers
/// keep using the prior compiled artifact until their handle drops.
pub trait Driver: Send + Sync {
    /// Compiles `source` under `name`. Returns a categorized error and
    /// leaves no partial state on failure.
    fn add_template(&self, name: &str, source: &str) -> Result<(), GovernanceError>;

    /// Releases the compiled artifact for `name`. In-flight `eval` calls
    /// holding an older handle keep working until they release it.
    fn remove_template(&self, name: &str);

    /// Pre-validates `params` against the named template's parameter schema.
    fn add_constraint(
        &self,
        name: &str,
        template_name: &str,
        params: &Value,
    ) -> Result<(), GovernanceError>;

    /// Pure evaluation over `review` for every constraint in `constraint_names`.
    /// `ref_data` is a read-only inventory snapshot handle. Returns violations
    /// ordered (template name asc, then message asc), plus an optional
    /// trace.
    fn eval(
        &self,
        review: &Review,
        constraint_names: &[String],
        ref_data: &RefData,
        want_trace: bool,
    ) -> Result<(Vec<Violation>, Option<Trace>), GovernanceError>;
}

/// Sorts violations into the deterministic order: by the owning
/// template name first, then by the violation's own message text. Callers
/// pass parallel `(template_name, violation)` pairs since a single `eval`
/// call may span several constraints of different templates.
pub fn order_violations(mut pairs: Vec<(String, Violation)>) -> Vec<(String, Violation)> {
    pairs.sort_by(|(ta, va), (tb, vb)| ta.cmp(tb).then_with(|| va.msg.cmp(&vb.msg)));
    pairs
}

/// Resolves a dotted path (the same language the mutation engine uses, read
/// only here) against a JSON value, returning every match — several when the
/// path crosses a glob or filter component.
pub fn resolve(value: &Value, path: &str) -> Vec<Value> {
    let components = crate::mutation::path::parse(path);
    let mut out = Vec::new();
    resolve_rec(value, &components, &mut out);
    out
}

fn resolve_rec(value: &Value, path: &[crate::mutation::path::PathComponent], out: &mut Vec<Value>) {
    use crate::mutation::path::PathComponent;
    match path.split_first() {
        None => out.push(value.clone()),
        Some((PathComponent::Field(key), rest)) => {
            if let Some(child) = value.get(key) {
                resolve_rec(child, rest, out);
            }
        }
        Some((PathComponent::Glob, rest)) => match value {
            Value::Object(map) => {
                for v in map.values() {
                    resolve_rec(v, rest, out);
                }
            }
            Value::Array(items) => {
                for v in items {
                    resolve_rec(v, rest, out);
                }
            }
            _ => {}
        },
        Some((PathComponent::Filter { list_field, key, value: expected }, rest)) => {
            if let Some(Value::Array(items)) = value.get(list_field) {
                for item in items {
                    let matches = item.get(key).and_then(Value::as_str).is_some_and(|s| s == expected);
                    if matches {
                        resolve_rec(item, rest, out);
                    }
                }
            }
        }
    }
}
