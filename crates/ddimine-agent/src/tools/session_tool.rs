//! Session tools: progress, results, export, config and control.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use ddimine_common::evidence::EvidenceSource;
use ddimine_common::mining_config::MiningConfig;
use ddimine_ingestion::export::ExportFormat;
use ddimine_ingestion::Orchestrator;

use super::{mining_options, options_schema, required_str, DdiTool};

/// Declares a tool struct holding the shared orchestrator.
macro_rules! session_tool {
    ($name:ident) => {
        pub struct $name {
            orch: Orchestrator,
        }

        impl $name {
            pub fn new(orch: Orchestrator) -> Self { Self { orch } }
        }
    };
}

fn no_params() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

// ─────────────────────────────────────────────
//  Reads
// ─────────────────────────────────────────────

session_tool!(ProgressTool);

#[async_trait]
impl DdiTool for ProgressTool {
    fn name(&self) -> &str { "get_progress" }

    fn description(&self) -> &str {
        "Progress of the current or last mining job: state, processed and \
         failed drugs, per-source entry counts, elapsed and estimated remaining time."
    }

    fn parameters_schema(&self) -> Value { no_params() }

    async fn invoke(&self, _params: Value) -> Result<Value> {
        Ok(serde_json::to_value(self.orch.get_progress())?)
    }
}

session_tool!(ResultsTool);

#[async_trait]
impl DdiTool for ResultsTool {
    fn name(&self) -> &str { "get_results" }

    fn description(&self) -> &str {
        "Normalized interaction records accumulated in this session, \
         optionally restricted to pairs involving one drug."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "drug": { "type": "string" } }
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let mut records = self.orch.get_results();
        if let Some(drug) = params["drug"].as_str() {
            let drug = ddimine_common::evidence::canonical_drug_name(drug);
            records.retain(|r| r.drug_pair_key.involves(&drug));
        }
        Ok(serde_json::json!({ "count": records.len(), "records": records }))
    }
}

session_tool!(ReportsTool);

#[async_trait]
impl DdiTool for ReportsTool {
    fn name(&self) -> &str { "get_reports" }

    fn description(&self) -> &str {
        "Cumulative normalization and per-source extraction reports, plus cache statistics."
    }

    fn parameters_schema(&self) -> Value { no_params() }

    async fn invoke(&self, _params: Value) -> Result<Value> {
        Ok(serde_json::json!({
            "reports": self.orch.get_reports(),
            "cache": self.orch.get_cache_stats(),
        }))
    }
}

session_tool!(ExportTool);

#[async_trait]
impl DdiTool for ExportTool {
    fn name(&self) -> &str { "export_results" }

    fn description(&self) -> &str {
        "Export accumulated records as json, csv or tsv. Output over \
         max_export_bytes is truncated and flagged."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "format": { "type": "string", "enum": ["json", "csv", "tsv"], "default": "json" }
            }
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let format: ExportFormat = params["format"].as_str().unwrap_or("json").parse()?;
        let out = self.orch.export_results(format)?;
        Ok(serde_json::json!({
            "format": out.format,
            "content_type": out.format.content_type(),
            "truncated": out.truncated,
            "record_count": out.record_count,
            "total_records": out.total_records,
            "content": out.as_text(),
        }))
    }
}

// ─────────────────────────────────────────────
//  Configuration
// ─────────────────────────────────────────────

session_tool!(GetConfigTool);

#[async_trait]
impl DdiTool for GetConfigTool {
    fn name(&self) -> &str { "get_config" }

    fn description(&self) -> &str { "Current mining configuration." }

    fn parameters_schema(&self) -> Value { no_params() }

    async fn invoke(&self, _params: Value) -> Result<Value> {
        Ok(serde_json::to_value(self.orch.get_config())?)
    }
}

session_tool!(UpdateConfigTool);

#[async_trait]
impl DdiTool for UpdateConfigTool {
    fn name(&self) -> &str { "update_config" }

    fn description(&self) -> &str {
        "Update mining configuration. Only the given fields change; the whole \
         result is validated and rejected atomically if any value is out of range. \
         With validate_only the candidate is checked but not applied."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "config":        { "type": "object" },
                "validate_only": { "type": "boolean", "default": false }
            },
            "required": ["config"]
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let patch = params["config"]
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("Missing: config (object)"))?;

        let mut merged = serde_json::to_value(self.orch.get_config())?;
        if let Value::Object(fields) = &mut merged {
            for (k, v) in patch {
                fields.insert(k.clone(), v.clone());
            }
        }
        let candidate: MiningConfig = serde_json::from_value(merged)
            .map_err(|e| anyhow::anyhow!("Invalid config: {e}"))?;

        if params["validate_only"].as_bool().unwrap_or(false) {
            candidate.validate()?;
            return Ok(serde_json::json!({ "valid": true, "config": candidate }));
        }
        self.orch.update_config(candidate)?;
        Ok(serde_json::json!({ "updated": true, "config": self.orch.get_config() }))
    }
}

// ─────────────────────────────────────────────
//  Control
// ─────────────────────────────────────────────

session_tool!(ClearCachesTool);

#[async_trait]
impl DdiTool for ClearCachesTool {
    fn name(&self) -> &str { "clear_caches" }

    fn description(&self) -> &str {
        "Drop all cached extractor results. Accumulated records are kept."
    }

    fn parameters_schema(&self) -> Value { no_params() }

    async fn invoke(&self, _params: Value) -> Result<Value> {
        self.orch.clear_caches();
        Ok(serde_json::json!({ "cleared": true, "cache": self.orch.get_cache_stats() }))
    }
}

session_tool!(StopTool);

#[async_trait]
impl DdiTool for StopTool {
    fn name(&self) -> &str { "stop" }

    fn description(&self) -> &str {
        "Cancel the running mining job. In-flight source requests are aborted."
    }

    fn parameters_schema(&self) -> Value { no_params() }

    async fn invoke(&self, _params: Value) -> Result<Value> {
        let was_running = self.orch.stop();
        Ok(serde_json::json!({ "stopped": was_running }))
    }
}

session_tool!(ResetTool);

#[async_trait]
impl DdiTool for ResetTool {
    fn name(&self) -> &str { "reset" }

    fn description(&self) -> &str {
        "Stop any running job and clear accumulated records, progress and reports."
    }

    fn parameters_schema(&self) -> Value { no_params() }

    async fn invoke(&self, _params: Value) -> Result<Value> {
        self.orch.reset();
        Ok(serde_json::json!({ "reset": true }))
    }

    fn requires_approval(&self) -> bool { true }
}

// ─────────────────────────────────────────────
//  Diagnostics
// ─────────────────────────────────────────────

session_tool!(DiagnoseTool);

#[async_trait]
impl DdiTool for DiagnoseTool {
    fn name(&self) -> &str { "diagnose_extractor" }

    fn description(&self) -> &str {
        "Run one source extractor for one drug in isolation (no cache, no job) \
         and report raw entries, elapsed time and any error."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "source":  { "type": "string", "enum": ["clinical-trial", "regulatory", "publication"] },
                "drug":    { "type": "string" },
                "options": options_schema()
            },
            "required": ["source", "drug"]
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let source: EvidenceSource = required_str(&params, "source")?
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let drug = required_str(&params, "drug")?;
        let options = mining_options(&params)?;
        let report = self.orch.diagnose_extractor(source, drug, options).await?;
        Ok(serde_json::to_value(report)?)
    }
}

session_tool!(ValidateEvidenceTool);

#[async_trait]
impl DdiTool for ValidateEvidenceTool {
    fn name(&self) -> &str { "validate_evidence" }

    fn description(&self) -> &str {
        "Validate normalized evidence records, given as an array or as a JSON \
         export document. Invalid entries are returned with a reason code; \
         warnings flag suspicious but valid records."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "entries": { "type": ["array", "object"] } },
            "required": ["entries"]
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let outcome = self.orch.validate_evidence(&params["entries"])?;
        Ok(serde_json::json!({
            "valid_count": outcome.valid_count(),
            "invalid_count": outcome.invalid_count(),
            "invalid": outcome.invalid,
            "warnings": outcome.warnings,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddimine_common::error::DdiError;
    use ddimine_ingestion::testing::{raw_entry, MockSources};
    use ddimine_ingestion::models::MiningOptions;
    use pretty_assertions::assert_eq;

    async fn mined() -> Orchestrator {
        let mocks = MockSources::new();
        mocks.clinical_trial.set_entries(
            "doxorubicin",
            vec![raw_entry(EvidenceSource::ClinicalTrial, "doxorubicin", "trastuzumab", "NCT1", "Cardiotoxicity.")],
        );
        let orch = Orchestrator::builder(MiningConfig::default())
            .extractors(mocks.extractor_set())
            .build()
            .unwrap();
        orch.mine_single_drug("doxorubicin", MiningOptions::default()).await.unwrap();
        orch
    }

    #[tokio::test]
    async fn test_export_csv() {
        let tool = ExportTool::new(mined().await);
        let out = tool.invoke(serde_json::json!({ "format": "csv" })).await.unwrap();
        assert_eq!(out["content_type"], "text/csv");
        assert_eq!(out["record_count"], 1);
        assert!(out["content"].as_str().unwrap().starts_with("drug_pair_key,"));
    }

    #[tokio::test]
    async fn test_export_unknown_format() {
        let tool = ExportTool::new(mined().await);
        assert!(tool.invoke(serde_json::json!({ "format": "xlsx" })).await.is_err());
    }

    #[tokio::test]
    async fn test_update_config_patch_and_rejection() {
        let orch = mined().await;
        let tool = UpdateConfigTool::new(orch.clone());

        let out = tool
            .invoke(serde_json::json!({ "config": { "max_concurrent_drugs": 5 } }))
            .await
            .unwrap();
        assert_eq!(out["config"]["max_concurrent_drugs"], 5);
        assert_eq!(orch.get_config().max_batch_size, 50);

        let err = tool
            .invoke(serde_json::json!({ "config": { "max_concurrent_drugs": 99 } }))
            .await;
        assert!(err.is_err());
        assert_eq!(orch.get_config().max_concurrent_drugs, 5);

        let check = tool
            .invoke(serde_json::json!({ "config": { "max_batch_size": 10 }, "validate_only": true }))
            .await
            .unwrap();
        assert_eq!(check["valid"], true);
        assert_eq!(orch.get_config().max_batch_size, 50);
    }

    #[tokio::test]
    async fn test_reset_clears_results() {
        let orch = mined().await;
        let results = ResultsTool::new(orch.clone());
        assert_eq!(results.invoke(serde_json::json!({})).await.unwrap()["count"], 1);

        ResetTool::new(orch.clone()).invoke(serde_json::json!({})).await.unwrap();
        assert_eq!(results.invoke(serde_json::json!({})).await.unwrap()["count"], 0);
        let progress = ProgressTool::new(orch).invoke(serde_json::json!({})).await.unwrap();
        assert_eq!(progress["state"], "not_started");
    }

    #[tokio::test]
    async fn test_validate_evidence_counts() {
        let orch = mined().await;
        let record = serde_json::to_value(&orch.get_results()[0]).unwrap();
        let tool = ValidateEvidenceTool::new(orch);
        let out = tool
            .invoke(serde_json::json!({ "entries": [record, { "drug_pair_key": "x" }] }))
            .await
            .unwrap();
        assert_eq!(out["valid_count"], 1);
        assert_eq!(out["invalid_count"], 1);
        assert_eq!(out["invalid"][0]["reason"], "missing_field");
    }

    #[tokio::test]
    async fn test_validate_evidence_accepts_export_document() {
        let orch = mined().await;
        let doc: Value = serde_json::from_str(&orch.export_results(ExportFormat::Json).unwrap().as_text()).unwrap();
        let tool = ValidateEvidenceTool::new(orch);
        let out = tool.invoke(serde_json::json!({ "entries": doc })).await.unwrap();
        assert_eq!(out["valid_count"], 1);

        let err = tool.invoke(serde_json::json!({ "entries": 42 })).await.unwrap_err();
        assert_eq!(err.downcast_ref::<DdiError>().map(DdiError::code), Some("validation"));
    }

    #[tokio::test]
    async fn test_diagnose_rejects_unknown_source() {
        let tool = DiagnoseTool::new(mined().await);
        let err = tool
            .invoke(serde_json::json!({ "source": "twitter", "drug": "warfarin" }))
            .await;
        assert!(err.is_err());
    }
}
