//! Mining tools: single drug, drug lists, full vocabulary, indications.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use ddimine_ingestion::Orchestrator;

use super::{mining_options, options_schema, required_str, string_list, DdiTool};

// ─────────────────────────────────────────────
//  Single drug (synchronous)
// ─────────────────────────────────────────────

pub struct MineDrugTool {
    orch: Orchestrator,
}

impl MineDrugTool {
    pub fn new(orch: Orchestrator) -> Self { Self { orch } }
}

#[async_trait]
impl DdiTool for MineDrugTool {
    fn name(&self) -> &str { "mine_drug" }

    fn description(&self) -> &str {
        "Mine interaction evidence for one drug from clinical trials, FDA labels \
         and PubMed. Waits for completion and returns every normalized record \
         involving the drug."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "drug":    { "type": "string", "description": "Generic or brand name, e.g. warfarin" },
                "options": options_schema()
            },
            "required": ["drug"]
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let drug = required_str(&params, "drug")?;
        let options = mining_options(&params)?;
        let records = self.orch.mine_single_drug(drug, options).await?;
        Ok(serde_json::json!({
            "drug": drug,
            "count": records.len(),
            "records": records,
        }))
    }
}

// ─────────────────────────────────────────────
//  Drug list (background job)
// ─────────────────────────────────────────────

pub struct MineDrugsTool {
    orch: Orchestrator,
}

impl MineDrugsTool {
    pub fn new(orch: Orchestrator) -> Self { Self { orch } }
}

#[async_trait]
impl DdiTool for MineDrugsTool {
    fn name(&self) -> &str { "mine_drugs" }

    fn description(&self) -> &str {
        "Start a background job mining a list of drugs. Lists longer than \
         max_batch_size are rejected. Returns the job id immediately; poll \
         get_progress or job_status."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "drugs":   { "type": "array", "items": { "type": "string" }, "minItems": 1 },
                "options": options_schema()
            },
            "required": ["drugs"]
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let drugs = string_list(&params, "drugs")?;
        let options = mining_options(&params)?;
        let accepted = self.orch.mine_multiple_drugs(drugs, options)?;
        Ok(serde_json::to_value(accepted)?)
    }
}

// ─────────────────────────────────────────────
//  Whole vocabulary (background job)
// ─────────────────────────────────────────────

pub struct MineAllKnownTool {
    orch: Orchestrator,
}

impl MineAllKnownTool {
    pub fn new(orch: Orchestrator) -> Self { Self { orch } }
}

#[async_trait]
impl DdiTool for MineAllKnownTool {
    fn name(&self) -> &str { "mine_all_known" }

    fn description(&self) -> &str {
        "Start a background job mining every drug in the curated vocabulary, \
         in max_batch_size batches. Issues several hundred upstream requests."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "options": options_schema() }
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let options = mining_options(&params)?;
        let accepted = self.orch.mine_all_known_drugs(options)?;
        Ok(serde_json::to_value(accepted)?)
    }

    fn requires_approval(&self) -> bool { true }
}

// ─────────────────────────────────────────────
//  Indications (background job)
// ─────────────────────────────────────────────

pub struct MineIndicationsTool {
    orch: Orchestrator,
}

impl MineIndicationsTool {
    pub fn new(orch: Orchestrator) -> Self { Self { orch } }
}

#[async_trait]
impl DdiTool for MineIndicationsTool {
    fn name(&self) -> &str { "mine_by_indications" }

    fn description(&self) -> &str {
        "Expand indications (e.g. \"atrial fibrillation\") to the drugs used for \
         them and mine those as a background job. Unknown indications are \
         listed in the reply."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "indications": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
                "options":     options_schema()
            },
            "required": ["indications"]
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let indications = string_list(&params, "indications")?;
        let options = mining_options(&params)?;
        let accepted = self.orch.mine_by_indications(indications, options).await?;
        Ok(serde_json::to_value(accepted)?)
    }
}

// ─────────────────────────────────────────────
//  Job table
// ─────────────────────────────────────────────

pub struct JobStatusTool {
    orch: Orchestrator,
}

impl JobStatusTool {
    pub fn new(orch: Orchestrator) -> Self { Self { orch } }
}

#[async_trait]
impl DdiTool for JobStatusTool {
    fn name(&self) -> &str { "job_status" }

    fn description(&self) -> &str {
        "Look up one job by id (optionally waiting for it to finish), or list \
         every job of the session when no id is given."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "job_id": { "type": "string", "format": "uuid" },
                "wait":   { "type": "boolean", "default": false }
            }
        })
    }

    async fn invoke(&self, params: Value) -> Result<Value> {
        let Some(raw) = params["job_id"].as_str() else {
            return Ok(serde_json::json!({ "jobs": self.orch.list_jobs() }));
        };
        let id = Uuid::parse_str(raw).map_err(|e| anyhow::anyhow!("Invalid job_id: {e}"))?;
        let job = if params["wait"].as_bool().unwrap_or(false) {
            self.orch.wait_for_job(id).await?
        } else {
            self.orch.get_job(id)?
        };
        Ok(serde_json::to_value(job)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddimine_common::error::DdiError;
    use ddimine_common::evidence::EvidenceSource;
    use ddimine_common::mining_config::MiningConfig;
    use ddimine_ingestion::testing::{raw_entry, MockSources};
    use pretty_assertions::assert_eq;

    fn orchestrator() -> Orchestrator {
        let mocks = MockSources::new();
        mocks.regulatory.set_entries(
            "warfarin",
            vec![raw_entry(EvidenceSource::Regulatory, "warfarin", "aspirin", "set-1", "Bleeding.")],
        );
        Orchestrator::builder(MiningConfig::default())
            .extractors(mocks.extractor_set())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_mine_drug_returns_records() {
        let tool = MineDrugTool::new(orchestrator());
        let out = tool.invoke(serde_json::json!({ "drug": "warfarin" })).await.unwrap();
        assert_eq!(out["count"], 1);
        assert_eq!(out["records"][0]["drug_pair_key"], "aspirin|warfarin");
    }

    #[tokio::test]
    async fn test_mine_drugs_then_wait() {
        let orch = orchestrator();
        let start = MineDrugsTool::new(orch.clone());
        let ack = start
            .invoke(serde_json::json!({ "drugs": ["warfarin", "digoxin"] }))
            .await
            .unwrap();
        assert_eq!(ack["total_drugs"], 2);

        let status = JobStatusTool::new(orch);
        let job = status
            .invoke(serde_json::json!({ "job_id": ack["job_id"], "wait": true }))
            .await
            .unwrap();
        assert_eq!(job["status"], "completed");
    }

    #[tokio::test]
    async fn test_capacity_error_surfaces_as_ddi_error() {
        let tool = MineDrugsTool::new(orchestrator());
        let drugs: Vec<String> = (0..51).map(|i| format!("d{i}")).collect();
        let err = tool.invoke(serde_json::json!({ "drugs": drugs })).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<DdiError>(), Some(DdiError::Capacity { .. })));
    }

    #[tokio::test]
    async fn test_missing_params_rejected() {
        let tool = MineDrugTool::new(orchestrator());
        let err = tool.invoke(serde_json::json!({})).await.unwrap_err();
        assert!(err.to_string().contains("Missing: drug"));
    }
}
