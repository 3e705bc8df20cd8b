//! The unstructured object tree mutated by the mutation engine.
//!
//! Mirrors a JSON tree with one escape hatch: a `Placeholder` carrying an
//! external-data reference plus the value currently occupying that slot,
//! substituted by a later resolver pass.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::mutation::ExternalDataPlaceholder;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Node>),
    Object(BTreeMap<String, Node>),
    Placeholder(ExternalDataPlaceholder, Box<Node>),
}

impl Node {
    pub fn from_json(value: &Value) -> Node {
        match value {
            Value::Null => Node::Null,
            Value::Bool(b) => Node::Bool(*b),
            Value::Number(n) => Node::Number(n.clone()),
            Value::String(s) => Node::String(s.clone()),
            Value::Array(items) => Node::Array(items.iter().map(Node::from_json).collect()),
            Value::Object(map) => Node::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Node::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts back to JSON. Any unresolved placeholder surfaces its current
    /// value — resolution must happen before this is called for a response
    /// that leaves the process.
    pub fn to_json(&self) -> Value {
        match self {
            Node::Null => Value::Null,
            Node::Bool(b) => Value::Bool(*b),
            Node::Number(n) => Value::Number(n.clone()),
            Node::String(s) => Value::String(s.clone()),
            Node::Array(items) => Value::Array(items.iter().map(Node::to_json).collect()),
            Node::Object(map) => {
                Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
            Node::Placeholder(_, current) => current.to_json(),
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Node>> {
        match self {
            Node::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, Node>> {
        match self {
            Node::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Node]> {
        match self {
            Node::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Node::Null)
    }
}

/// One step of a minimal structural JSON-patch diff (RFC 6902 subset: add,
/// remove, replace — sufficient for the mutating-webhook path in step 4,
/// which only ever edits existing/introduced leaves, never reorders arrays).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
}

/// Computes the minimal edit from `before` to `after` as a JSON-patch
/// sequence. Descends object-by-object and array-by-index; a value present
/// in `after` but not `before` is an `add`, the reverse is a `remove`, and a
/// changed leaf is a `replace`.
pub fn diff(before: &Value, after: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_at("", before, after, &mut ops);
    ops
}

fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn diff_at(path: &str, before: &Value, after: &Value, ops: &mut Vec<PatchOp>) {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            for (k, bv) in b {
                let child_path = format!("{path}/{}", escape_pointer_token(k));
                match a.get(k) {
                    Some(av) => diff_at(&child_path, bv, av, ops),
                    None => ops.push(PatchOp::Remove { path: child_path }),
                }
            }
            for (k, av) in a {
                if !b.contains_key(k) {
                    let child_path = format!("{path}/{}", escape_pointer_token(k));
                    ops.push(PatchOp::Add {
                        path: child_path,
                        value: av.clone(),
                    });
                }
            }
        }
        (Value::Array(b), Value::Array(a)) => {
            let max = b.len().max(a.len());
            for i in 0..max {
                let child_path = format!("{path}/{i}");
                match (b.get(i), a.get(i)) {
                    (Some(bv), Some(av)) => diff_at(&child_path, bv, av, ops),
                    (Some(_), None) => ops.push(PatchOp::Remove { path: child_path }),
                    (None, Some(av)) => ops.push(PatchOp::Add {
                        path: child_path,
                        value: av.clone(),
                    }),
                    (None, None) => {}
                }
            }
        }
        (b, a) if b != a => ops.push(PatchOp::Replace {
            path: path.to_string(),
            value: a.clone(),
        }),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roundtrip_json() {
        let v = json!({"a": 1, "b": [true, null, "s"], "c": {"d": 2.5}});
        let node = Node::from_json(&v);
        assert_eq!(node.to_json(), v);
    }

    #[test]
    fn test_diff_no_change() {
        let v = json!({"a": 1});
        assert!(diff(&v, &v).is_empty());
    }

    #[test]
    fn test_diff_add_field() {
        let before = json!({"a": 1});
        let after = json!({"a": 1, "b": 2});
        let ops = diff(&before, &after);
        assert_eq!(ops, vec![PatchOp::Add { path: "/b".into(), value: json!(2) }]);
    }

    #[test]
    fn test_diff_replace_leaf() {
        let before = json!({"a": 1});
        let after = json!({"a": 2});
        let ops = diff(&before, &after);
        assert_eq!(ops, vec![PatchOp::Replace { path: "/a".into(), value: json!(2) }]);
    }

    #[test]
    fn test_diff_nested_path() {
        let before = json!({"spec": {"containers": [{"image": "x:1"}]}});
        let after = json!({"spec": {"containers": [{"image": "x:2"}]}});
        let ops = diff(&before, &after);
        assert_eq!(
            ops,
            vec![PatchOp::Replace {
                path: "/spec/containers/0/image".into(),
                value: json!("x:2")
            }]
        );
    }

    #[test]
    fn test_diff_escapes_pointer_tokens() {
        let before = json!({});
        let after = json!({"a/b~c": 1});
        let ops = diff(&before, &after);
        assert_eq!(
            ops,
            vec![PatchOp::Add { path: "/a~1b~0c".into(), value: json!(1) }]
        );
    }

    #[test]
    fn test_node_is_null_and_as_str() {
        assert!(Node::Null.is_null());
        assert_eq!(Node::String("x".into()).as_str(), Some("x"));
        assert_eq!(Node::Null.as_str(), None);
    }
}
