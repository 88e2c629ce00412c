//! Tool registry: the JSON control surface of a mining session.
//!
//! Every orchestrator operation is exposed as a `DdiTool` taking and
//! returning JSON. The binary dispatches stdin commands through
//! `ToolRegistry::invoke`.
//!
//! Tool lifecycle:
//!   1. Implement `DdiTool` for your type.
//!   2. Register with `ToolRegistry::register`.
//!   3. Callers invoke tools via `ToolRegistry::invoke(name, params)`.

pub mod mining_tool;
pub mod session_tool;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use ddimine_ingestion::models::MiningOptions;
use ddimine_ingestion::Orchestrator;

// ─────────────────────────────────────────────
//  Core trait
// ─────────────────────────────────────────────

/// A callable tool wrapping one orchestrator operation.
///
/// - `name()` must be unique across the registry (snake_case).
/// - `parameters_schema()` returns a JSON Schema object for the params.
/// - `invoke()` receives JSON params and returns JSON output.
#[async_trait]
pub trait DdiTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value;

    async fn invoke(&self, params: Value) -> Result<Value>;

    /// Whether the caller should confirm before running.
    /// Override for destructive or long-running tools.
    fn requires_approval(&self) -> bool { false }
}

// ─────────────────────────────────────────────
//  Tool registry
// ─────────────────────────────────────────────

/// Central registry mapping tool names to trait objects.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn DdiTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: BTreeMap::new() }
    }

    /// Register a tool. Panics if the name is already registered.
    pub fn register<T: DdiTool + 'static>(&mut self, tool: T) {
        let name = tool.name().to_string();
        assert!(
            !self.tools.contains_key(&name),
            "Duplicate tool name: {name}"
        );
        self.tools.insert(name, Arc::new(tool));
    }

    pub async fn invoke(&self, name: &str, params: Value) -> Result<Value> {
        let tool = self.tools.get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown tool: {name}"))?;

        tracing::info!(
            tool = name,
            requires_approval = tool.requires_approval(),
            "Invoking tool"
        );

        tool.invoke(params).await
    }

    /// All registered tools as a JSON array, sorted by name.
    pub fn manifest(&self) -> Value {
        let tools: Vec<Value> = self.tools.values().map(|t| {
            serde_json::json!({
                "name": t.name(),
                "description": t.description(),
                "parameters": t.parameters_schema(),
                "requires_approval": t.requires_approval(),
            })
        }).collect();
        serde_json::json!({ "tools": tools })
    }

    pub fn len(&self) -> usize { self.tools.len() }

    pub fn is_empty(&self) -> bool { self.tools.is_empty() }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn DdiTool>> {
        self.tools.get(name)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self { Self::new() }
}

/// Build the registry over one shared mining session.
pub fn build_default_registry(orch: Orchestrator) -> ToolRegistry {
    let mut reg = ToolRegistry::new();
    reg.register(mining_tool::MineDrugTool::new(orch.clone()));
    reg.register(mining_tool::MineDrugsTool::new(orch.clone()));
    reg.register(mining_tool::MineAllKnownTool::new(orch.clone()));
    reg.register(mining_tool::MineIndicationsTool::new(orch.clone()));
    reg.register(mining_tool::JobStatusTool::new(orch.clone()));
    reg.register(session_tool::ProgressTool::new(orch.clone()));
    reg.register(session_tool::ResultsTool::new(orch.clone()));
    reg.register(session_tool::ReportsTool::new(orch.clone()));
    reg.register(session_tool::ExportTool::new(orch.clone()));
    reg.register(session_tool::GetConfigTool::new(orch.clone()));
    reg.register(session_tool::UpdateConfigTool::new(orch.clone()));
    reg.register(session_tool::ClearCachesTool::new(orch.clone()));
    reg.register(session_tool::StopTool::new(orch.clone()));
    reg.register(session_tool::ResetTool::new(orch.clone()));
    reg.register(session_tool::DiagnoseTool::new(orch.clone()));
    reg.register(session_tool::ValidateEvidenceTool::new(orch));
    tracing::info!("ToolRegistry ready with {} tools", reg.len());
    reg
}

// ─────────────────────────────────────────────
//  Param helpers
// ─────────────────────────────────────────────

/// JSON Schema fragment shared by every mining tool.
pub(crate) fn options_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "max_results":   { "type": "integer", "minimum": 1 },
            "year_from":     { "type": "integer" },
            "year_to":       { "type": "integer" },
            "force_refresh": { "type": "boolean", "default": false }
        }
    })
}

pub(crate) fn mining_options(params: &Value) -> Result<MiningOptions> {
    match params.get("options") {
        None | Some(Value::Null) => Ok(MiningOptions::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| anyhow::anyhow!("Invalid options: {e}")),
    }
}

pub(crate) fn required_str<'a>(params: &'a Value, field: &str) -> Result<&'a str> {
    params[field]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("Missing: {field}"))
}

pub(crate) fn string_list(params: &Value, field: &str) -> Result<Vec<String>> {
    let items = params[field]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("Missing: {field} (array of strings)"))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("{field} must contain only strings"))
        })
        .collect()
}

// ─────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ddimine_common::mining_config::MiningConfig;
    use ddimine_ingestion::testing::MockSources;

    struct EchoTool;

    #[async_trait]
    impl DdiTool for EchoTool {
        fn name(&self) -> &str { "echo" }
        fn description(&self) -> &str { "Echoes the input params back." }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string" }
                },
                "required": ["message"]
            })
        }
        async fn invoke(&self, params: Value) -> Result<Value> {
            Ok(serde_json::json!({ "echo": params["message"] }))
        }
    }

    #[tokio::test]
    async fn test_registry_register_and_invoke() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        assert_eq!(reg.len(), 1);

        let result = reg.invoke("echo", serde_json::json!({ "message": "hello" })).await.unwrap();
        assert_eq!(result["echo"], "hello");
    }

    #[tokio::test]
    async fn test_registry_unknown_tool_errors() {
        let reg = ToolRegistry::new();
        let err = reg.invoke("nonexistent", serde_json::json!({})).await;
        assert!(err.unwrap_err().to_string().contains("Unknown tool"));
    }

    #[test]
    #[should_panic(expected = "Duplicate tool name")]
    fn test_duplicate_registration_panics() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg.register(EchoTool);
    }

    #[test]
    fn test_default_registry_manifest() {
        let orch = Orchestrator::builder(MiningConfig::default())
            .extractors(MockSources::new().extractor_set())
            .build()
            .unwrap();
        let reg = build_default_registry(orch);
        let manifest = reg.manifest();
        let names: Vec<&str> = manifest["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names.len(), 16);
        assert!(names.contains(&"mine_drug"));
        assert!(names.contains(&"export_results"));
    }

    #[test]
    fn test_param_helpers() {
        let params = serde_json::json!({
            "drugs": ["warfarin", "aspirin"],
            "options": { "max_results": 5, "force_refresh": true }
        });
        assert_eq!(string_list(&params, "drugs").unwrap(), vec!["warfarin", "aspirin"]);
        let opts = mining_options(&params).unwrap();
        assert_eq!(opts.max_results, Some(5));
        assert!(opts.force_refresh);
        assert!(required_str(&params, "drug").is_err());
        assert_eq!(mining_options(&serde_json::json!({})).unwrap(), MiningOptions::default());
    }
}
