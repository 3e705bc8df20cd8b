//! Provider protocol client: resolves external-data placeholders
//! left in the object tree by the mutation engine. One call batches every
//! key a given provider needs to answer, since a review may carry several
//! placeholders bound to the same provider.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::crd::ProviderSpec;
use crate::error::GovernanceError;
use crate::mutation::{ExternalDataPlaceholder, FailurePolicy};
use crate::node::Node;

const API_VERSION: &str = "externaldata.polygov.io/v1alpha1";

#[derive(Debug, Serialize)]
struct ProviderRequest {
    api_version: &'static str,
    kind: &'static str,
    request: ProviderRequestBody,
}

#[derive(Debug, Serialize)]
struct ProviderRequestBody {
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    response: ProviderResponseBody,
}

#[derive(Debug, Deserialize)]
struct ProviderResponseBody {
    items: Vec<ProviderItem>,
    #[serde(default)]
    system_error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderItem {
    key: String,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// One provider's HTTP endpoint, ready to answer a batch of keys.
pub struct ProviderEndpoint {
    url: String,
    timeout: Duration,
    client: Client,
}

impl ProviderEndpoint {
    /// Rejects non-TLS endpoints: the provider protocol carries the review
    /// object's placeholder keys (and gets cluster data back), so `url` must
    /// be `https://`.
    pub fn new(spec: &ProviderSpec, client: Client) -> Result<Self, GovernanceError> {
        if !spec.url.starts_with("https://") {
            return Err(GovernanceError::Config(format!(
                "provider url '{}' is not TLS-protected; https:// is required",
                spec.url
            )));
        }
        Ok(Self { url: spec.url.clone(), timeout: Duration::from_millis(spec.timeout_ms), client })
    }

    /// Calls the provider's `/validate`-style endpoint with a batch of keys
    /// and returns each key's resolved value (or per-key error) as reported
    /// by the provider. A transport failure or a `systemError` in the
    /// response body is reported as a single `TransientIOError` for the
    /// whole batch — callers then apply each placeholder's own
    /// `failurePolicy` individually.
    pub async fn fetch(&self, keys: Vec<String>) -> Result<HashMap<String, Result<Value, String>>, GovernanceError> {
        let body = ProviderRequest {
            api_version: API_VERSION,
            kind: "ProviderRequest",
            request: ProviderRequestBody { keys },
        };

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| GovernanceError::TransientIo(format!("provider call to {}: {e}", self.url)))?;

        let parsed: ProviderResponse = response
            .json()
            .await
            .map_err(|e| GovernanceError::TransientIo(format!("provider response decode: {e}")))?;

        if let Some(system_error) = parsed.response.system_error {
            return Err(GovernanceError::TransientIo(format!("provider system error: {system_error}")));
        }

        Ok(parsed
            .response
            .items
            .into_iter()
            .map(|item| {
                let result = match item.error {
                    Some(err) => Err(err),
                    None => Ok(item.value.unwrap_or(Value::Null)),
                };
                (item.key, result)
            })
            .collect())
    }
}

/// Registry of providers by name, so the resolver pass can look up the
/// endpoint a given `ExternalDataRef` targets.
#[derive(Default)]
pub struct ProviderRegistry {
    endpoints: HashMap<String, ProviderEndpoint>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, endpoint: ProviderEndpoint) {
        self.endpoints.insert(name.into(), endpoint);
    }

    pub fn get(&self, name: &str) -> Option<&ProviderEndpoint> {
        self.endpoints.get(name)
    }
}

/// Walks `node` for every `Placeholder`, batches lookups per provider, and
/// substitutes each with its resolved value, `default`, or the untouched
/// current value if the placeholder's `failurePolicy` is `Fail` and
/// resolution failed and the caller has chosen to surface (not error out
/// on) the failure — the admission pipeline is responsible for deciding
/// whether a `Fail` placeholder aborts the request.
pub async fn resolve_placeholders(
    node: Node,
    registry: &ProviderRegistry,
) -> Result<Node, GovernanceError> {
    let mut by_provider: HashMap<String, Vec<String>> = HashMap::new();
    collect_keys(&node, &mut by_provider);

    let mut resolved: HashMap<(String, String), Result<Value, String>> = HashMap::new();
    for (provider_name, keys) in by_provider {
        let Some(endpoint) = registry.get(&provider_name) else {
            for key in keys {
                resolved.insert((provider_name.clone(), key), Err("unknown provider".to_string()));
            }
            continue;
        };
        match endpoint.fetch(keys.clone()).await {
            Ok(items) => {
                for key in keys {
                    let outcome = items.get(&key).cloned().unwrap_or(Err("key missing from provider response".to_string()));
                    resolved.insert((provider_name.clone(), key), outcome);
                }
            }
            Err(e) => {
                warn!(provider = provider_name, error = %e, "provider call failed");
                for key in keys {
                    resolved.insert((provider_name.clone(), key), Err(e.to_string()));
                }
            }
        }
    }

    substitute(node, &resolved)
}

fn collect_keys(node: &Node, out: &mut HashMap<String, Vec<String>>) {
    match node {
        Node::Object(map) => {
            for v in map.values() {
                collect_keys(v, out);
            }
        }
        Node::Array(items) => {
            for v in items {
                collect_keys(v, out);
            }
        }
        Node::Placeholder(placeholder, _) => {
            out.entry(placeholder.external.provider.clone())
                .or_default()
                .push(placeholder.external.key.clone());
        }
        _ => {}
    }
}

fn substitute(
    node: Node,
    resolved: &HashMap<(String, String), Result<Value, String>>,
) -> Result<Node, GovernanceError> {
    match node {
        Node::Object(map) => {
            let mut out = std::collections::BTreeMap::new();
            for (k, v) in map {
                out.insert(k, substitute(v, resolved)?);
            }
            Ok(Node::Object(out))
        }
        Node::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(substitute(item, resolved)?);
            }
            Ok(Node::Array(out))
        }
        Node::Placeholder(placeholder, current) => {
            let ExternalDataPlaceholder { external, failure_policy, default } = &placeholder;
            let outcome = resolved.get(&(external.provider.clone(), external.key.clone()));
            match outcome {
                Some(Ok(value)) => Ok(Node::from_json(value)),
                Some(Err(reason)) => match failure_policy {
                    FailurePolicy::UseDefault => match default {
                        Some(value) => Ok(Node::from_json(value)),
                        None => Ok(*current),
                    },
                    FailurePolicy::Fail => Err(GovernanceError::Evaluation(format!(
                        "external data resolution failed for {}/{}: {reason}",
                        external.provider, external.key
                    ))),
                },
                None => Ok(*current),
            }
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn placeholder_node(provider: &str, key: &str, failure_policy: FailurePolicy, default: Option<Value>) -> Node {
        Node::Placeholder(
            ExternalDataPlaceholder {
                external: crate::mutation::ExternalDataRef { provider: provider.into(), key: key.into() },
                failure_policy,
                default,
            },
            Box::new(Node::Null),
        )
    }

    #[tokio::test]
    async fn test_resolve_substitutes_successful_value() {
        let node = Node::Object(
            [("annotated".to_string(), placeholder_node("p1", "k1", FailurePolicy::Fail, None))]
                .into_iter()
                .collect(),
        );
        let mut resolved = HashMap::new();
        resolved.insert(("p1".to_string(), "k1".to_string()), Ok(json!("value-from-provider")));
        let out = substitute(node, &resolved).unwrap();
        assert_eq!(out.to_json()["annotated"], json!("value-from-provider"));
    }

    #[tokio::test]
    async fn test_use_default_on_system_error() {
        let node = placeholder_node("p1", "k1", FailurePolicy::UseDefault, Some(json!("fallback")));
        let mut resolved = HashMap::new();
        resolved.insert(("p1".to_string(), "k1".to_string()), Err("systemError".to_string()));
        let out = substitute(node, &resolved).unwrap();
        assert_eq!(out.to_json(), json!("fallback"));
    }

    #[tokio::test]
    async fn test_fail_policy_errors_out() {
        let node = placeholder_node("p1", "k1", FailurePolicy::Fail, None);
        let mut resolved = HashMap::new();
        resolved.insert(("p1".to_string(), "k1".to_string()), Err("systemError".to_string()));
        let result = substitute(node, &resolved);
        assert!(result.is_err());
    }

    #[test]
    fn test_endpoint_rejects_non_tls_url() {
        let spec = ProviderSpec { url: "http://provider.internal/validate".into(), timeout_ms: 1000, ca_bundle: None };
        let result = ProviderEndpoint::new(&spec, Client::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_endpoint_accepts_https_url() {
        let spec = ProviderSpec { url: "https://provider.internal/validate".into(), timeout_ms: 1000, ca_bundle: None };
        assert!(ProviderEndpoint::new(&spec, Client::new()).is_ok());
    }

    #[test]
    fn test_collect_keys_groups_by_provider() {
        let node = Node::Object(
            [
                ("a".to_string(), placeholder_node("p1", "k1", FailurePolicy::Fail, None)),
                ("b".to_string(), placeholder_node("p1", "k2", FailurePolicy::Fail, None)),
                ("c".to_string(), placeholder_node("p2", "k3", FailurePolicy::Fail, None)),
            ]
            .into_iter()
            .collect(),
        );
        let mut out = HashMap::new();
        collect_keys(&node, &mut out);
        assert_eq!(out.get("p1").unwrap().len(), 2);
        assert_eq!(out.get("p2").unwrap().len(), 1);
    }
}
