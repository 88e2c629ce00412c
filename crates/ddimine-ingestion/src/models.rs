//! Data models for mining jobs, options and reports.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ddimine_common::error::{DdiError, Result};
use ddimine_common::evidence::{EvidenceSource, RawEvidenceEntry};

use crate::normalise::NormalizationReport;

// ── Options ───────────────────────────────────────────────────────────────────

/// Caller-supplied knobs for one mining request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MiningOptions {
    /// Per-extractor result cap; clamped to `max_results_per_extractor`.
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub year_from: Option<i32>,
    #[serde(default)]
    pub year_to: Option<i32>,
    /// Skip cached results and refetch from every source.
    #[serde(default)]
    pub force_refresh: bool,
}

impl MiningOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_results == Some(0) {
            return Err(DdiError::InvalidRequest("max_results must be at least 1".into()));
        }
        if let (Some(from), Some(to)) = (self.year_from, self.year_to) {
            if from > to {
                return Err(DdiError::InvalidRequest(format!(
                    "year_from ({from}) is after year_to ({to})"
                )));
            }
        }
        Ok(())
    }

    /// Options handed to each extractor, with the result cap applied.
    pub fn extract_options(&self, cap: usize) -> ExtractOptions {
        ExtractOptions {
            max_results: self.max_results.unwrap_or(cap).min(cap).max(1),
            year_from: self.year_from,
            year_to: self.year_to,
        }
    }
}

/// Source-independent limits applied by every extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractOptions {
    pub max_results: usize,
    pub year_from: Option<i32>,
    pub year_to: Option<i32>,
}

impl ExtractOptions {
    pub fn new(max_results: usize) -> Self {
        Self { max_results, year_from: None, year_to: None }
    }

    pub fn year_in_range(&self, year: i32) -> bool {
        self.year_from.map_or(true, |from| year >= from)
            && self.year_to.map_or(true, |to| year <= to)
    }
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self::new(50)
    }
}

// ── Job state ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Final status from per-drug outcomes. A degraded drug (some sources
    /// failed) counts as a success for "did anything work" and as a failure
    /// for "did everything work".
    pub fn from_outcomes(succeeded: usize, degraded: usize, failed: usize) -> Self {
        if succeeded + degraded == 0 && failed > 0 {
            JobStatus::Failed
        } else if degraded + failed > 0 {
            JobStatus::Partial
        } else {
            JobStatus::Completed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending   => "pending",
            JobStatus::Running   => "running",
            JobStatus::Completed => "completed",
            JobStatus::Partial   => "partial",
            JobStatus::Failed    => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrugStatus {
    Pending,
    Running,
    /// Every source answered.
    Succeeded,
    /// At least one source answered, at least one failed.
    Degraded,
    /// No source answered, or the unit itself failed.
    Failed,
    Cancelled,
}

impl DrugStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, DrugStatus::Pending | DrugStatus::Running)
    }
}

/// One failure recorded against a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub drug: Option<String>,
    pub source: Option<EvidenceSource>,
    pub code: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl JobError {
    pub fn from_error(drug: Option<&str>, source: Option<EvidenceSource>, err: &DdiError) -> Self {
        Self {
            drug: drug.map(String::from),
            source,
            code: err.code().to_string(),
            message: err.to_string(),
            at: Utc::now(),
        }
    }
}

/// A mining job: created per orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningJob {
    pub id: Uuid,
    pub drugs: Vec<String>,
    pub status: JobStatus,
    pub drug_status: BTreeMap<String, DrugStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub errors: Vec<JobError>,
    /// Normalised records produced by this job (before table merging).
    pub records_produced: usize,
}

impl MiningJob {
    pub fn new(drugs: Vec<String>) -> Self {
        let drug_status = drugs
            .iter()
            .map(|d| (d.clone(), DrugStatus::Pending))
            .collect();
        Self {
            id: Uuid::new_v4(),
            drugs,
            status: JobStatus::Pending,
            drug_status,
            started_at: None,
            finished_at: None,
            errors: Vec::new(),
            records_produced: 0,
        }
    }

    pub fn count(&self, status: DrugStatus) -> usize {
        self.drug_status.values().filter(|s| **s == status).count()
    }
}

/// Immediate acknowledgment for background jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAccepted {
    pub job_id: Uuid,
    pub total_drugs: usize,
    pub accepted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved_indications: Vec<String>,
}

// ── Notifications ─────────────────────────────────────────────────────────────

/// Lifecycle notification broadcast to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MiningEvent {
    JobStarted { job_id: Uuid, total_drugs: usize },
    DrugCompleted { job_id: Uuid, drug: String, status: DrugStatus, records: usize },
    JobFinished { job_id: Uuid, status: JobStatus },
}

// ── Reports ───────────────────────────────────────────────────────────────────

/// Counters for one extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    /// Calls that reached the extractor (cache misses).
    pub calls: usize,
    pub cache_hits: usize,
    pub entries: usize,
    pub failures: usize,
    pub timeouts: usize,
}

/// Cumulative extraction counters since the last reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub per_source: BTreeMap<EvidenceSource, SourceStats>,
}

impl ExtractionReport {
    pub fn record_success(&mut self, source: EvidenceSource, entries: usize, cache_hit: bool) {
        let stats = self.per_source.entry(source).or_default();
        if cache_hit {
            stats.cache_hits += 1;
        } else {
            stats.calls += 1;
        }
        stats.entries += entries;
    }

    pub fn record_failure(&mut self, source: EvidenceSource, err: &DdiError) {
        let stats = self.per_source.entry(source).or_default();
        stats.calls += 1;
        stats.failures += 1;
        if matches!(err, DdiError::Timeout { .. }) {
            stats.timeouts += 1;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiningReports {
    pub normalization: NormalizationReport,
    pub extraction: ExtractionReport,
}

/// Result of an isolated extractor call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub source: EvidenceSource,
    pub drug: String,
    pub elapsed_ms: u64,
    pub entry_count: usize,
    pub entries: Vec<RawEvidenceEntry>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_outcomes() {
        assert_eq!(JobStatus::from_outcomes(3, 0, 0), JobStatus::Completed);
        assert_eq!(JobStatus::from_outcomes(2, 0, 1), JobStatus::Partial);
        assert_eq!(JobStatus::from_outcomes(0, 1, 0), JobStatus::Partial);
        assert_eq!(JobStatus::from_outcomes(0, 0, 2), JobStatus::Failed);
    }

    #[test]
    fn test_extract_options_clamped_to_cap() {
        let opts = MiningOptions { max_results: Some(500), ..Default::default() };
        assert_eq!(opts.extract_options(50).max_results, 50);
        assert_eq!(MiningOptions::default().extract_options(20).max_results, 20);
    }

    #[test]
    fn test_inverted_year_range_rejected() {
        let opts = MiningOptions { year_from: Some(2020), year_to: Some(2010), ..Default::default() };
        assert!(matches!(opts.validate(), Err(DdiError::InvalidRequest(_))));
    }

    #[test]
    fn test_year_in_range() {
        let opts = ExtractOptions { max_results: 5, year_from: Some(2015), year_to: None };
        assert!(opts.year_in_range(2020));
        assert!(!opts.year_in_range(2010));
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = MiningJob::new(vec!["warfarin".into(), "aspirin".into()]);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.count(DrugStatus::Pending), 2);
    }
}
