//! The path language: dotted components with optional bracketed key
//! filters, e.g. `spec.containers[name: main].image`. A `*` component
//! expands to all entries of whatever container it lands on.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathComponent {
    Field(String),
    /// `list_field[key: value]` — enter `list_field` (an array) and select
    /// every element whose `key` string-equals `value`.
    Filter { list_field: String, key: String, value: String },
    Glob,
}

/// Parses a dotted path string into components. Panics are never produced —
/// a malformed bracket is treated as a literal field name, since Templates
/// ship their own path strings and a malformed one should simply fail to
/// match anything rather than crash the pipeline.
pub fn parse(path: &str) -> Vec<PathComponent> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(parse_component)
        .collect()
}

fn parse_component(token: &str) -> PathComponent {
    if token == "*" {
        return PathComponent::Glob;
    }
    if let Some(open) = token.find('[') {
        if let Some(close) = token.find(']') {
            if close > open {
                let list_field = token[..open].to_string();
                let inner = &token[open + 1..close];
                if let Some((key, value)) = inner.split_once(':') {
                    return PathComponent::Filter {
                        list_field,
                        key: key.trim().to_string(),
                        value: value.trim().to_string(),
                    };
                }
            }
        }
    }
    PathComponent::Field(token.to_string())
}

/// Depth of a path, used for the partition-internal sort.
pub fn depth(path: &str) -> usize {
    parse(path).len()
}

/// True iff `prefix` is a path prefix of `full` — required of every
/// mutator's `pathTests`.
pub fn is_prefix(prefix: &str, full: &str) -> bool {
    let p = parse(prefix);
    let f = parse(full);
    p.len() <= f.len() && p.iter().zip(f.iter()).all(|(a, b)| a == b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_fields() {
        assert_eq!(
            parse("spec.image"),
            vec![PathComponent::Field("spec".into()), PathComponent::Field("image".into())]
        );
    }

    #[test]
    fn test_parse_filter() {
        assert_eq!(
            parse("spec.containers[name: main].image"),
            vec![
                PathComponent::Field("spec".into()),
                PathComponent::Filter {
                    list_field: "containers".into(),
                    key: "name".into(),
                    value: "main".into(),
                },
                PathComponent::Field("image".into()),
            ]
        );
    }

    #[test]
    fn test_parse_glob() {
        assert_eq!(
            parse("spec.containers.*.image"),
            vec![
                PathComponent::Field("spec".into()),
                PathComponent::Field("containers".into()),
                PathComponent::Glob,
                PathComponent::Field("image".into()),
            ]
        );
    }

    #[test]
    fn test_depth() {
        assert_eq!(depth("spec.containers[name: main].image"), 3);
        assert_eq!(depth("metadata.labels"), 2);
    }

    #[test]
    fn test_is_prefix_true() {
        assert!(is_prefix(
            "spec.containers[name: main]",
            "spec.containers[name: main].imagePullPolicy"
        ));
    }

    #[test]
    fn test_is_prefix_false_different_filter_value() {
        assert!(!is_prefix(
            "spec.containers[name: sidecar]",
            "spec.containers[name: main].imagePullPolicy"
        ));
    }

    #[test]
    fn test_is_prefix_false_longer_than_full() {
        assert!(!is_prefix("spec.containers[name: main].image.extra", "spec.containers[name: main].image"));
    }
}
