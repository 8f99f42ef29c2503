//! Per-request execution context: the variable bag plan steps read from
//! and write into.

use std::collections::HashMap;

use serde_json::Value;

/// Loop frame injected into expanded loop children.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopFrame {
    /// 1-based iteration index
    pub index: usize,
    pub total: usize,
    pub item: Value,
}

/// Variable bag owned by a single executor instance. Writes are strictly
/// sequential; the context dies with its plan.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    variables: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            variables: HashMap::new(),
        }
    }

    /// Set a named variable.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Read a named variable.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Whether the variable holds a non-empty collection.
    pub fn is_collection(&self, name: &str) -> bool {
        matches!(self.get(name), Some(Value::Array(items)) if !items.is_empty())
    }

    /// Names currently bound, for diagnostics.
    pub fn variable_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.variables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Record a step result under `step_{i}_result` and pull out the
    /// well-known derived variables for tools with structured output.
    pub fn record_step_result(&mut self, step_index: usize, tool_id: &str, output: &Value) {
        self.set(format!("step_{step_index}_result"), output.clone());
        self.extract_variables(tool_id, output);
    }

    /// Structured-output extraction. An asset query yields `assets`,
    /// `hostnames`, `ip_addresses`, and `asset_count`.
    fn extract_variables(&mut self, tool_id: &str, output: &Value) {
        if normalize_tool_name(tool_id) != "asset-query" {
            return;
        }
        let Some(assets) = output.get("assets").and_then(Value::as_array) else {
            return;
        };

        let hostnames: Vec<Value> = assets
            .iter()
            .filter_map(|a| a.get("hostname").cloned())
            .collect();
        let ip_addresses: Vec<Value> = assets
            .iter()
            .filter_map(|a| a.get("ip").cloned())
            .collect();

        self.set("asset_count", Value::from(assets.len()));
        self.set("assets", Value::Array(assets.clone()));
        self.set("hostnames", Value::Array(hostnames.clone()));
        // `hostname` doubles as the loop collection in target expansion
        self.set("hostname", Value::Array(hostnames));
        self.set("ip_addresses", Value::Array(ip_addresses));
    }
}

/// Tool filename variants (`asset-query` vs `asset_query`) normalize to one
/// canonical spelling.
pub fn normalize_tool_name(tool_id: &str) -> String {
    tool_id.trim().replace('_', "-").to_lowercase()
}
