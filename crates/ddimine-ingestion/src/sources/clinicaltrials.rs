//! ClinicalTrials.gov v2 API extractor.
//!
//! API docs: https://clinicaltrials.gov/data-api/api
//! Endpoint: https://clinicaltrials.gov/api/v2/studies
//!
//! A study testing the mined drug together with other drug or biological
//! interventions is evidence of clinical co-administration. Each
//! co-intervention yields one entry:
//!   - drug_b      = co-intervention (resolved through the vocabulary)
//!   - source_id   = NCT id
//!   - level hint  = B for phase 3/4 studies, C otherwise

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use ddimine_common::confidence::{compute_confidence, source_base_confidence, ConfidenceModifiers};
use ddimine_common::error::{DdiError, Result};
use ddimine_common::evidence::{EvidenceLevel, EvidenceSource, RawEvidenceEntry};
use ddimine_common::mining_config::MiningConfig;

use super::http::SourceHttp;
use super::{truncate_excerpt, EvidenceExtractor};
use crate::models::ExtractOptions;
use crate::rate_limit::SourceRateLimiter;
use crate::vocabulary::DrugVocabulary;

const CT_API_URL: &str = "https://clinicaltrials.gov/api/v2/studies";
const CT_FIELDS: &str = "NCTId,BriefTitle,BriefSummary,OverallStatus,Phase,\
                         InterventionName,InterventionType,StartDate";
const EXCERPT_CHARS: usize = 400;

pub struct ClinicalTrialsExtractor {
    http: SourceHttp,
    base_url: String,
    vocabulary: Arc<DrugVocabulary>,
}

impl ClinicalTrialsExtractor {
    pub fn new(
        config: &MiningConfig,
        limiter: SourceRateLimiter,
        vocabulary: Arc<DrugVocabulary>,
    ) -> Result<Self> {
        Ok(Self {
            http: SourceHttp::new(EvidenceSource::ClinicalTrial, config, limiter)?,
            base_url: CT_API_URL.to_string(),
            vocabulary,
        })
    }

    /// Point at a mirror of the v2 API.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl EvidenceExtractor for ClinicalTrialsExtractor {
    fn source(&self) -> EvidenceSource {
        EvidenceSource::ClinicalTrial
    }

    #[instrument(skip(self, options))]
    async fn extract(&self, drug: &str, options: &ExtractOptions) -> Result<Vec<RawEvidenceEntry>> {
        let query = [
            ("query.intr", drug.to_string()),
            ("pageSize", options.max_results.min(1000).to_string()),
            ("format", "json".to_string()),
            ("fields", CT_FIELDS.to_string()),
        ];
        let Some(payload) = self.http.get_json(&self.base_url, &query).await? else {
            return Ok(vec![]);
        };
        let entries = parse_studies(drug, &payload, &self.vocabulary, options)?;
        debug!(drug, n = entries.len(), "ClinicalTrials.gov entries extracted");
        Ok(entries)
    }
}

/// Map a `/api/v2/studies` payload into raw entries for `drug`.
///
/// A payload without a `studies` array is a parse error; an empty array
/// is an empty result.
pub fn parse_studies(
    drug: &str,
    payload: &Value,
    vocabulary: &DrugVocabulary,
    options: &ExtractOptions,
) -> Result<Vec<RawEvidenceEntry>> {
    let target = vocabulary.canonical(drug);
    let mut entries = Vec::new();

    let studies = payload["studies"].as_array().ok_or_else(|| {
        DdiError::parse(EvidenceSource::ClinicalTrial, "response has no `studies` array")
    })?;
    for study in studies {
        if entries.len() >= options.max_results {
            break;
        }
        let proto = &study["protocolSection"];
        let nct_id = proto["identificationModule"]["nctId"].as_str().unwrap_or("");
        if nct_id.is_empty() {
            continue;
        }
        let status = proto["statusModule"]["overallStatus"].as_str().unwrap_or("UNKNOWN");
        if status.eq_ignore_ascii_case("WITHDRAWN") {
            continue;
        }
        if let Some(year) = start_year(&proto["statusModule"]) {
            if !options.year_in_range(year) {
                continue;
            }
        }

        let partners = co_interventions(&target, &proto["armsInterventionsModule"], vocabulary);
        if partners.is_empty() {
            continue;
        }

        let late_phase = is_late_phase(&proto["designModule"]);
        let level = if late_phase { EvidenceLevel::B } else { EvidenceLevel::C };
        let confidence = compute_confidence(
            source_base_confidence(EvidenceSource::ClinicalTrial),
            &ConfidenceModifiers { is_late_phase: late_phase, same_sentence: true, is_withdrawn: false },
        );

        let title = proto["identificationModule"]["briefTitle"].as_str().unwrap_or("");
        let summary = proto["descriptionModule"]["briefSummary"].as_str().unwrap_or("");
        let excerpt = truncate_excerpt(&format!("{title}. {summary}"), EXCERPT_CHARS);

        for partner in partners {
            if entries.len() >= options.max_results {
                break;
            }
            entries.push(
                RawEvidenceEntry::new(EvidenceSource::ClinicalTrial, &target, partner, nct_id, &excerpt)
                    .with_evidence_level(level)
                    .with_confidence(confidence)
                    .with_url(format!("https://clinicaltrials.gov/study/{nct_id}")),
            );
        }
    }
    Ok(entries)
}

/// Drug/biological interventions other than `target` and placebo.
fn co_interventions(target: &str, arms: &Value, vocabulary: &DrugVocabulary) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut includes_target = false;
    let mut partners = Vec::new();

    for iv in arms["interventions"].as_array().into_iter().flatten() {
        let kind = iv["type"].as_str().unwrap_or("");
        if !matches!(kind, "DRUG" | "BIOLOGICAL") {
            continue;
        }
        let Some(name) = iv["name"].as_str() else { continue };
        if name.to_lowercase().contains("placebo") {
            continue;
        }
        let resolved = vocabulary
            .resolve(name)
            .map(String::from)
            .or_else(|| vocabulary.mentions(name).into_iter().next())
            .unwrap_or_else(|| vocabulary.canonical(name));
        if resolved == target || vocabulary.mentions_drug(name, target) {
            includes_target = true;
            continue;
        }
        if seen.insert(resolved.clone()) {
            partners.push(resolved);
        }
    }

    // The query matches intervention text loosely; only studies that
    // actually administer the drug count.
    if includes_target { partners } else { Vec::new() }
}

fn is_late_phase(design: &Value) -> bool {
    design["phases"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .any(|p| matches!(p, "PHASE3" | "PHASE4"))
}

/// Year of `startDateStruct.date` (`YYYY-MM` or `YYYY-MM-DD`).
fn start_year(status: &Value) -> Option<i32> {
    status["startDateStruct"]["date"]
        .as_str()
        .and_then(|d| d.get(..4))
        .and_then(|y| y.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fixture() -> Value {
        json!({
            "studies": [
                {
                    "protocolSection": {
                        "identificationModule": { "nctId": "NCT00021255", "briefTitle": "Doxorubicin plus Herceptin in HER2+ breast cancer" },
                        "descriptionModule": { "briefSummary": "Cardiac function monitored throughout." },
                        "statusModule": { "overallStatus": "COMPLETED", "startDateStruct": { "date": "2001-03" } },
                        "designModule": { "phases": ["PHASE3"] },
                        "armsInterventionsModule": { "interventions": [
                            { "type": "DRUG", "name": "Doxorubicin Hydrochloride" },
                            { "type": "BIOLOGICAL", "name": "Herceptin" },
                            { "type": "DRUG", "name": "Placebo" },
                            { "type": "PROCEDURE", "name": "Echocardiography" }
                        ]}
                    }
                },
                {
                    "protocolSection": {
                        "identificationModule": { "nctId": "NCT09999999", "briefTitle": "Withdrawn study" },
                        "statusModule": { "overallStatus": "WITHDRAWN" },
                        "armsInterventionsModule": { "interventions": [
                            { "type": "DRUG", "name": "doxorubicin" },
                            { "type": "DRUG", "name": "cisplatin" }
                        ]}
                    }
                },
                {
                    "protocolSection": {
                        "identificationModule": { "nctId": "NCT01111111", "briefTitle": "Monotherapy" },
                        "statusModule": { "overallStatus": "RECRUITING", "startDateStruct": { "date": "2019-01-15" } },
                        "designModule": { "phases": ["PHASE2"] },
                        "armsInterventionsModule": { "interventions": [
                            { "type": "DRUG", "name": "doxorubicin" }
                        ]}
                    }
                }
            ]
        })
    }

    #[test]
    fn test_parse_co_interventions() {
        let vocab = DrugVocabulary::curated();
        let entries = parse_studies("Doxorubicin", &fixture(), &vocab, &ExtractOptions::new(10)).unwrap();
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.drug_a, "doxorubicin");
        assert_eq!(e.drug_b, "trastuzumab");
        assert_eq!(e.source_id, "NCT00021255");
        assert_eq!(e.evidence_level(), EvidenceLevel::B);
        assert_eq!(e.url.as_deref(), Some("https://clinicaltrials.gov/study/NCT00021255"));
        assert!(e.confidence_hint > source_base_confidence(EvidenceSource::ClinicalTrial));
    }

    #[test]
    fn test_year_filter_excludes_old_studies() {
        let vocab = DrugVocabulary::curated();
        let opts = ExtractOptions { max_results: 10, year_from: Some(2010), year_to: None };
        assert!(parse_studies("doxorubicin", &fixture(), &vocab, &opts).unwrap().is_empty());
    }

    #[test]
    fn test_empty_studies_is_empty_result() {
        let vocab = DrugVocabulary::curated();
        let entries = parse_studies("warfarin", &json!({ "studies": [] }), &vocab, &ExtractOptions::new(5)).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_missing_studies_array_is_parse_error() {
        let vocab = DrugVocabulary::curated();
        let opts = ExtractOptions::new(5);
        let err = parse_studies("warfarin", &json!({}), &vocab, &opts).unwrap_err();
        assert!(matches!(err, DdiError::Parse { origin: EvidenceSource::ClinicalTrial, .. }));

        let moved = json!({ "message": "API v3 moved", "data": { "items": [] } });
        assert_eq!(parse_studies("warfarin", &moved, &vocab, &opts).unwrap_err().code(), "parse");
        let wrong_type = json!({ "studies": { "count": 0 } });
        assert!(parse_studies("warfarin", &wrong_type, &vocab, &opts).is_err());
    }

    #[test]
    fn test_early_phase_gets_level_c() {
        let vocab = DrugVocabulary::curated();
        let payload = json!({ "studies": [{ "protocolSection": {
            "identificationModule": { "nctId": "NCT02222222", "briefTitle": "Warfarin with amiodarone" },
            "statusModule": { "overallStatus": "COMPLETED" },
            "designModule": { "phases": ["PHASE1"] },
            "armsInterventionsModule": { "interventions": [
                { "type": "DRUG", "name": "Warfarin" },
                { "type": "DRUG", "name": "Amiodarone" }
            ]}
        }}]});
        let entries = parse_studies("warfarin", &payload, &vocab, &ExtractOptions::new(5)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].evidence_level(), EvidenceLevel::C);
    }
}
