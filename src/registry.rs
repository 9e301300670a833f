//! `ToolRegistry`: the key→tool-definition map plus per-tool usage
//! statistics and prompt-catalog generation (spec §4.6).
//!
//! Key format is `"{serverId}/{name}"`, replacing the teacher's
//! `"{slug}__{tool}"` namespace separator with the one spec §3 mandates.

use std::time::SystemTime;

use dashmap::DashMap;
use serde_json::Value;

/// A tool as registered from a server's `tools/list` response, plus the
/// identifying `server_id` it came from.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub server_id: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ToolRegistryEntry {
    pub definition: ToolDefinition,
    pub last_used: Option<SystemTime>,
    pub usage_count: u64,
    pub avg_execution_time_ms: Option<f64>,
}

/// Concurrent key→entry map. Re-registering an existing key (e.g. on
/// refresh) updates the definition in place and preserves usage stats.
pub struct ToolRegistry {
    entries: DashMap<String, ToolRegistryEntry>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry { entries: DashMap::new() }
    }

    pub fn registry_key(server_id: &str, name: &str) -> String {
        format!("{server_id}/{name}")
    }

    pub fn register_tool(&self, definition: ToolDefinition) {
        let key = Self::registry_key(&definition.server_id, &definition.name);
        self.entries
            .entry(key)
            .and_modify(|e| e.definition = definition.clone())
            .or_insert_with(|| ToolRegistryEntry {
                definition,
                last_used: None,
                usage_count: 0,
                avg_execution_time_ms: None,
            });
    }

    /// Replace all of one server's tools with `new_tools` without a window
    /// where both an old and a would-be-new key are simultaneously absent:
    /// new entries are inserted (or refreshed) first, then stale entries for
    /// that server are removed.
    pub fn replace_server_tools(&self, server_id: &str, new_tools: Vec<ToolDefinition>) {
        let new_keys: std::collections::HashSet<String> = new_tools
            .iter()
            .map(|t| Self::registry_key(&t.server_id, &t.name))
            .collect();
        for tool in new_tools {
            self.register_tool(tool);
        }
        let server_id = server_id.to_string();
        self.entries.retain(|k, e| e.definition.server_id != server_id || new_keys.contains(k));
    }

    pub fn get_tool_definition(&self, key: &str) -> Option<ToolDefinition> {
        self.entries.get(key).map(|e| e.definition.clone())
    }

    pub fn get_entry(&self, key: &str) -> Option<ToolRegistryEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    pub fn get_all_tools(&self) -> Vec<ToolDefinition> {
        self.entries.iter().map(|e| e.definition.clone()).collect()
    }

    pub fn get_tools_for_server(&self, server_id: &str) -> Vec<ToolDefinition> {
        self.entries
            .iter()
            .filter(|e| e.definition.server_id == server_id)
            .map(|e| e.definition.clone())
            .collect()
    }

    pub fn remove_server_tools(&self, server_id: &str) {
        let server_id = server_id.to_string();
        self.entries.retain(|_, e| e.definition.server_id != server_id);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Running two-sample mean: `avg' = avg.map_or(t, |a| (a + t) / 2)`.
    pub fn update_tool_usage(&self, key: &str, execution_time_ms: f64) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.usage_count += 1;
            entry.last_used = Some(SystemTime::now());
            entry.avg_execution_time_ms = Some(match entry.avg_execution_time_ms {
                None => execution_time_ms,
                Some(prev) => (prev + execution_time_ms) / 2.0,
            });
        }
    }

    /// Render every registered tool as a prompt-catalog block: a heading, its
    /// description, and a usage template with one placeholder tag per input
    /// property (optional ones marked as such).
    pub fn generate_prompt_catalog(&self) -> String {
        let mut tools = self.get_all_tools();
        tools.sort_by(|a, b| (a.server_id.as_str(), a.name.as_str()).cmp(&(b.server_id.as_str(), b.name.as_str())));

        let mut out = String::new();
        for tool in tools {
            let prompt_name = format!("{}_{}", tool.server_id, tool.name);
            out.push_str(&format!("## {prompt_name}\n{}\n", tool.description));
            out.push_str(&format!("Usage:\n<{prompt_name}>\n"));

            if let Some(props) = tool.input_schema.get("properties").and_then(|p| p.as_object()) {
                let required: Vec<&str> = tool
                    .input_schema
                    .get("required")
                    .and_then(|r| r.as_array())
                    .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
                    .unwrap_or_default();
                for prop_name in props.keys() {
                    let marker = if required.contains(&prop_name.as_str()) { "" } else { " (optional)" };
                    out.push_str(&format!("  <{prop_name}>value{marker}</{prop_name}>\n"));
                }
            }
            out.push_str(&format!("</{prompt_name}>\n\n"));
        }
        out
    }
}
