//! MCP selection (§4.6): resolves the effective tool-server list, per-
//! server tool filter, and native-tool overrides for one agent invocation.
//!
//! Shaped after a `ToolRegistry` composition pattern: a selection is
//! built from a registry plus an optional override document, and
//! overrides always replace rather than merge the registry's own list.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::{ChainConfig, LlmProviderConfig, McpServerConfig};
use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerOverrideEntry {
    pub name: String,
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpSelectionOverride {
    pub servers: Vec<McpServerOverrideEntry>,
    #[serde(default)]
    pub native_tools: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedMcpSelection {
    pub servers: Vec<String>,
    /// Absence of an entry for a server means "all tools".
    pub tool_filter: HashMap<String, Vec<String>>,
    pub native_tools_override: Option<serde_json::Value>,
}

/// The chain's own server list, used when a session carries no override.
pub fn chain_default_servers(registry_servers: &HashMap<String, McpServerConfig>) -> Vec<String> {
    registry_servers.keys().cloned().collect()
}

/// Resolves the effective selection for one session + chain.
///
/// `override_doc` is the session's `mcp_selection_override`, if any.
pub fn resolve(
    chain: &ChainConfig,
    chain_servers: &[String],
    known_servers: &HashMap<String, McpServerConfig>,
    override_doc: Option<&serde_json::Value>,
) -> Result<ResolvedMcpSelection, CoreError> {
    let _ = chain; // reserved for chain-level server lists beyond the default set
    match override_doc {
        None => Ok(ResolvedMcpSelection {
            servers: chain_servers.to_vec(),
            tool_filter: HashMap::new(),
            native_tools_override: None,
        }),
        Some(doc) => {
            let parsed: McpSelectionOverride = serde_json::from_value(doc.clone())
                .map_err(|e| CoreError::Other(Box::new(e)))?;
            if parsed.servers.is_empty() {
                return Err(CoreError::EmptyServerList);
            }
            let mut servers = Vec::with_capacity(parsed.servers.len());
            let mut tool_filter = HashMap::new();
            for entry in parsed.servers {
                if !known_servers.contains_key(&entry.name) {
                    return Err(CoreError::UnknownMcpServer(entry.name));
                }
                if let Some(tools) = entry.tools {
                    tool_filter.insert(entry.name.clone(), tools);
                }
                servers.push(entry.name);
            }
            Ok(ResolvedMcpSelection {
                servers,
                tool_filter,
                native_tools_override: parsed.native_tools,
            })
        }
    }
}

/// Applies a native-tools override by cloning the resolved provider config
/// and merging into the clone, so the shared registry entry is never
/// mutated (§4.6). The override document is retained on the clone for
/// downstream audit metadata.
pub fn apply_native_tools_override(
    provider: &LlmProviderConfig,
    selection: &ResolvedMcpSelection,
) -> LlmProviderConfig {
    let mut cloned = provider.clone();
    if let Some(override_doc) = &selection.native_tools_override {
        cloned.native_tools = Some(merge_json(cloned.native_tools.as_ref(), override_doc));
    }
    cloned
}

fn merge_json(base: Option<&serde_json::Value>, override_doc: &serde_json::Value) -> serde_json::Value {
    match (base, override_doc) {
        (Some(serde_json::Value::Object(base_map)), serde_json::Value::Object(override_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in override_map {
                merged.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(merged)
        }
        _ => override_doc.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers() -> HashMap<String, McpServerConfig> {
        let mut m = HashMap::new();
        m.insert(
            "k8s".to_string(),
            McpServerConfig {
                name: "k8s".into(),
                tools: None,
            },
        );
        m.insert(
            "logs".to_string(),
            McpServerConfig {
                name: "logs".into(),
                tools: None,
            },
        );
        m
    }

    #[test]
    fn no_override_uses_chain_defaults() {
        let chain = ChainConfig::new("c1");
        let resolved = resolve(&chain, &["k8s".into(), "logs".into()], &servers(), None).unwrap();
        assert_eq!(resolved.servers, vec!["k8s".to_string(), "logs".to_string()]);
        assert!(resolved.tool_filter.is_empty());
    }

    #[test]
    fn override_replaces_rather_than_merges() {
        let chain = ChainConfig::new("c1");
        let override_doc = serde_json::json!({
            "servers": [{"name": "k8s", "tools": ["get_pods"]}]
        });
        let resolved = resolve(&chain, &["k8s".into(), "logs".into()], &servers(), Some(&override_doc)).unwrap();
        assert_eq!(resolved.servers, vec!["k8s".to_string()]);
        assert_eq!(resolved.tool_filter.get("k8s"), Some(&vec!["get_pods".to_string()]));
    }

    #[test]
    fn unknown_server_in_override_is_rejected() {
        let chain = ChainConfig::new("c1");
        let override_doc = serde_json::json!({"servers": [{"name": "ghost"}]});
        let err = resolve(&chain, &["k8s".into()], &servers(), Some(&override_doc)).unwrap_err();
        assert!(matches!(err, CoreError::UnknownMcpServer(_)));
    }

    #[test]
    fn empty_server_list_in_override_is_rejected() {
        let chain = ChainConfig::new("c1");
        let override_doc = serde_json::json!({"servers": []});
        let err = resolve(&chain, &["k8s".into()], &servers(), Some(&override_doc)).unwrap_err();
        assert!(matches!(err, CoreError::EmptyServerList));
    }

    #[test]
    fn native_tools_override_clones_instead_of_mutating() {
        let provider = LlmProviderConfig {
            name: "anthropic".into(),
            backend: "claude".into(),
            native_tools: Some(serde_json::json!({"web_search": true})),
        };
        let selection = ResolvedMcpSelection {
            servers: vec![],
            tool_filter: HashMap::new(),
            native_tools_override: Some(serde_json::json!({"code_execution": true})),
        };
        let merged = apply_native_tools_override(&provider, &selection);
        assert_eq!(provider.native_tools, Some(serde_json::json!({"web_search": true})));
        assert_eq!(
            merged.native_tools,
            Some(serde_json::json!({"web_search": true, "code_execution": true}))
        );
    }
}
