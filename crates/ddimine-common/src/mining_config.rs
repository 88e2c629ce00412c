//! Runtime configuration for evidence mining.
//!
//! Every field has a serde default so a partial YAML/JSON/TOML table is
//! enough. `validate()` must pass before the orchestrator accepts a config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DdiError, Result};
use crate::evidence::EvidenceSource;

/// Complete mining configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningConfig {
    /// Largest drug list accepted by a multi-drug request
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Number of drugs mined in parallel
    #[serde(default = "default_max_concurrent_drugs")]
    pub max_concurrent_drugs: usize,

    /// Per extractor call timeout
    #[serde(default = "default_extractor_timeout_ms")]
    pub extractor_timeout_ms: u64,

    /// Lifetime of cached raw extractor results; 0 disables caching
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Upper bound on entries requested from each extractor
    #[serde(default = "default_max_results")]
    pub max_results_per_extractor: usize,

    /// Retries for transient transport errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay; doubles with every retry
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Optional session-wide cap across all sources combined
    #[serde(default)]
    pub global_requests_per_second: Option<u32>,

    /// Exports larger than this are truncated
    #[serde(default = "default_max_export_bytes")]
    pub max_export_bytes: usize,

    /// Tiebreak order when evidence levels are equal (first wins)
    #[serde(default = "default_source_precedence")]
    pub source_precedence: Vec<EvidenceSource>,

    /// Per-source outbound budgets
    #[serde(default)]
    pub sources: SourceRateConfig,
}

fn default_max_batch_size() -> usize { 50 }
fn default_max_concurrent_drugs() -> usize { 3 }
fn default_extractor_timeout_ms() -> u64 { 30_000 }
fn default_cache_ttl_secs() -> u64 { 3_600 }
fn default_max_results() -> usize { 50 }
fn default_max_retries() -> u32 { 2 }
fn default_retry_base_delay_ms() -> u64 { 250 }
fn default_max_export_bytes() -> usize { 10 * 1024 * 1024 }
fn default_source_precedence() -> Vec<EvidenceSource> {
    vec![
        EvidenceSource::Regulatory,
        EvidenceSource::ClinicalTrial,
        EvidenceSource::Publication,
    ]
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_concurrent_drugs: default_max_concurrent_drugs(),
            extractor_timeout_ms: default_extractor_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            max_results_per_extractor: default_max_results(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            global_requests_per_second: None,
            max_export_bytes: default_max_export_bytes(),
            source_precedence: default_source_precedence(),
            sources: SourceRateConfig::default(),
        }
    }
}

// ── Per-source rate limits ────────────────────────────────────────────────────

/// Requests per second each extractor may issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRateConfig {
    /// ClinicalTrials.gov
    #[serde(default = "default_clinical_trial_rps")]
    pub clinical_trial_rps: u32,

    /// openFDA drug labels
    #[serde(default = "default_regulatory_rps")]
    pub regulatory_rps: u32,

    /// PubMed E-utilities (3/s without an API key)
    #[serde(default = "default_publication_rps")]
    pub publication_rps: u32,
}

fn default_clinical_trial_rps() -> u32 { 5 }
fn default_regulatory_rps() -> u32 { 4 }
fn default_publication_rps() -> u32 { 3 }

impl Default for SourceRateConfig {
    fn default() -> Self {
        Self {
            clinical_trial_rps: default_clinical_trial_rps(),
            regulatory_rps: default_regulatory_rps(),
            publication_rps: default_publication_rps(),
        }
    }
}

impl SourceRateConfig {
    pub fn for_source(&self, source: EvidenceSource) -> u32 {
        match source {
            EvidenceSource::ClinicalTrial => self.clinical_trial_rps,
            EvidenceSource::Regulatory    => self.regulatory_rps,
            EvidenceSource::Publication   => self.publication_rps,
        }
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

fn check_range<T>(field: &str, value: T, min: T, max: T) -> Result<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(DdiError::Config(format!(
            "{field} must be within {min}..={max}, got {value}"
        )));
    }
    Ok(())
}

impl MiningConfig {
    /// Reject out-of-range values. Called before any job may start and on
    /// every runtime update.
    pub fn validate(&self) -> Result<()> {
        check_range("max_batch_size", self.max_batch_size, 1, 500)?;
        check_range("max_concurrent_drugs", self.max_concurrent_drugs, 1, 16)?;
        check_range("extractor_timeout_ms", self.extractor_timeout_ms, 100, 300_000)?;
        check_range("cache_ttl_secs", self.cache_ttl_secs, 0, 604_800)?;
        check_range("max_results_per_extractor", self.max_results_per_extractor, 1, 1_000)?;
        check_range("max_retries", self.max_retries, 0, 10)?;
        check_range("retry_base_delay_ms", self.retry_base_delay_ms, 0, 60_000)?;
        check_range("max_export_bytes", self.max_export_bytes, 1_024, 1024 * 1024 * 1024)?;

        if let Some(rps) = self.global_requests_per_second {
            check_range("global_requests_per_second", rps, 1, 100)?;
        }
        for source in EvidenceSource::ALL {
            let field = format!("sources.{}_rps", source.as_str().replace('-', "_"));
            check_range(&field, self.sources.for_source(source), 1, 50)?;
        }

        let mut precedence = self.source_precedence.clone();
        precedence.sort();
        precedence.dedup();
        if precedence.len() != EvidenceSource::ALL.len()
            || self.source_precedence.len() != EvidenceSource::ALL.len()
        {
            return Err(DdiError::Config(
                "source_precedence must list clinical-trial, regulatory and publication exactly once"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn extractor_timeout(&self) -> Duration {
        Duration::from_millis(self.extractor_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Load from YAML file
    pub fn from_yaml(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load from JSON file
    pub fn from_json(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
