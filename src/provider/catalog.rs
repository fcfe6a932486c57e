//! Tool catalog: the cached `tools/list` surface of one provider.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// Schema for one tool as advertised by a provider.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Name-keyed tool catalog, refreshed from `tools/list` responses.
#[derive(Debug, Default)]
pub struct ToolCatalog {
    tools: BTreeMap<String, ToolSchema>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ToolSchema> {
        self.tools.get(name)
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().cloned().collect()
    }

    /// Replace the catalog from a `tools/list` result payload.
    ///
    /// Entries without a name are skipped; `inputSchema` falls back to an
    /// empty object schema when absent. Refreshing with the same payload is
    /// idempotent.
    pub fn update_from_list(&mut self, result: &Value) {
        let mut tools = BTreeMap::new();
        let entries = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in entries {
            let Some(name) = entry.get("name").and_then(Value::as_str) else {
                continue;
            };
            let description = entry
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string);
            let input_schema = entry
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({"type": "object"}));
            tools.insert(
                name.to_string(),
                ToolSchema {
                    name: name.to_string(),
                    description,
                    input_schema,
                },
            );
        }
        self.tools = tools;
    }

    /// Drop every cached tool (on shutdown).
    pub fn clear(&mut self) {
        self.tools.clear();
    }
}
