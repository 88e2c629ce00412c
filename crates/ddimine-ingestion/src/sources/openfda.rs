//! openFDA drug label extractor (regulatory evidence).
//!
//! Endpoint: https://api.fda.gov/drug/label.json
//!
//! The `drug_interactions` section of each matching label is split into
//! sentences; every vocabulary drug named in a sentence becomes the partner
//! of one entry citing the label `set_id`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use ddimine_common::error::{DdiError, Result};
use ddimine_common::evidence::{EvidenceLevel, EvidenceSource, RawEvidenceEntry};
use ddimine_common::mining_config::MiningConfig;

use super::http::SourceHttp;
use super::{truncate_excerpt, EvidenceExtractor};
use crate::models::ExtractOptions;
use crate::rate_limit::SourceRateLimiter;
use crate::vocabulary::{split_sentences, DrugVocabulary};

const OPENFDA_LABEL_URL: &str = "https://api.fda.gov/drug/label.json";
const DAILYMED_URL: &str = "https://dailymed.nlm.nih.gov/dailymed/drugInfo.cfm";
const MAX_LABELS: usize = 10;
const EXCERPT_CHARS: usize = 600;

pub struct OpenFdaLabelExtractor {
    http: SourceHttp,
    base_url: String,
    vocabulary: Arc<DrugVocabulary>,
}

impl OpenFdaLabelExtractor {
    pub fn new(
        config: &MiningConfig,
        limiter: SourceRateLimiter,
        vocabulary: Arc<DrugVocabulary>,
    ) -> Result<Self> {
        Ok(Self {
            http: SourceHttp::new(EvidenceSource::Regulatory, config, limiter)?,
            base_url: OPENFDA_LABEL_URL.to_string(),
            vocabulary,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl EvidenceExtractor for OpenFdaLabelExtractor {
    fn source(&self) -> EvidenceSource {
        EvidenceSource::Regulatory
    }

    #[instrument(skip(self, options))]
    async fn extract(&self, drug: &str, options: &ExtractOptions) -> Result<Vec<RawEvidenceEntry>> {
        let generic = self.vocabulary.canonical(drug);
        let query = [
            ("search", format!("openfda.generic_name:\"{generic}\"")),
            ("limit", options.max_results.min(MAX_LABELS).to_string()),
        ];
        // openFDA answers 404 when nothing matches
        let Some(payload) = self.http.get_json(&self.base_url, &query).await? else {
            return Ok(vec![]);
        };
        let entries = parse_labels(drug, &payload, &self.vocabulary, options)?;
        debug!(drug, n = entries.len(), "openFDA label entries extracted");
        Ok(entries)
    }
}

/// Map an openFDA label search payload into raw entries for `drug`.
pub fn parse_labels(
    drug: &str,
    payload: &Value,
    vocabulary: &DrugVocabulary,
    options: &ExtractOptions,
) -> Result<Vec<RawEvidenceEntry>> {
    let target = vocabulary.canonical(drug);
    let mut entries = Vec::new();

    let labels = payload["results"].as_array().ok_or_else(|| {
        DdiError::parse(EvidenceSource::Regulatory, "response has no `results` array")
    })?;
    for label in labels {
        let Some(set_id) = label["set_id"].as_str().filter(|s| !s.is_empty()) else {
            continue;
        };
        if let Some(year) = effective_year(label) {
            if !options.year_in_range(year) {
                continue;
            }
        }

        let section: String = label["drug_interactions"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        if section.trim().is_empty() {
            continue;
        }

        // Partner -> sentences naming it, in label order.
        let mut by_partner: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut order = Vec::new();
        for sentence in split_sentences(&section) {
            for partner in vocabulary.mentions(&sentence) {
                if partner == target {
                    continue;
                }
                let sentences = by_partner.entry(partner.clone()).or_insert_with(|| {
                    order.push(partner.clone());
                    Vec::new()
                });
                if sentences.len() < 2 {
                    sentences.push(sentence.clone());
                }
            }
        }

        let url = format!("{DAILYMED_URL}?setid={set_id}");
        for partner in order {
            if entries.len() >= options.max_results {
                return Ok(entries);
            }
            let excerpt = truncate_excerpt(&by_partner[&partner].join(" "), EXCERPT_CHARS);
            entries.push(
                RawEvidenceEntry::new(EvidenceSource::Regulatory, &target, partner, set_id, excerpt)
                    .with_evidence_level(EvidenceLevel::A)
                    .with_url(url.clone()),
            );
        }
    }
    Ok(entries)
}

/// `effective_time` is `YYYYMMDD`.
fn effective_year(label: &Value) -> Option<i32> {
    label["effective_time"]
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
            "meta": { "results": { "total": 1 } },
            "results": [{
                "set_id": "d8a2f5a0-0b0c-4f4d-9a1e-3c3f8e1b2a11",
                "effective_time": "20230115",
                "openfda": { "generic_name": ["WARFARIN SODIUM"] },
                "drug_interactions": [
                    "7 DRUG INTERACTIONS. Concomitant use of amiodarone increases INR; monitor closely. \
                     Aspirin and clopidogrel increase the risk of bleeding. \
                     Rifampin decreases warfarin exposure. Coumadin tablets contain lactose."
                ]
            }]
        })
    }

    #[test]
    fn test_parse_label_partners() {
        let vocab = DrugVocabulary::curated();
        let entries = parse_labels("warfarin", &fixture(), &vocab, &ExtractOptions::new(10)).unwrap();
        let partners: Vec<&str> = entries.iter().map(|e| e.drug_b.as_str()).collect();
        assert_eq!(partners, vec!["amiodarone", "aspirin", "clopidogrel", "rifampin"]);
        assert!(entries.iter().all(|e| e.evidence_level() == EvidenceLevel::A));
        assert!(entries[0].excerpt.contains("increases INR"));
        assert_eq!(
            entries[0].url.as_deref(),
            Some("https://dailymed.nlm.nih.gov/dailymed/drugInfo.cfm?setid=d8a2f5a0-0b0c-4f4d-9a1e-3c3f8e1b2a11")
        );
    }

    #[test]
    fn test_max_results_caps_entries() {
        let vocab = DrugVocabulary::curated();
        let entries = parse_labels("warfarin", &fixture(), &vocab, &ExtractOptions::new(2)).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_year_filter_on_effective_time() {
        let vocab = DrugVocabulary::curated();
        let opts = ExtractOptions { max_results: 10, year_from: None, year_to: Some(2020) };
        assert!(parse_labels("warfarin", &fixture(), &vocab, &opts).unwrap().is_empty());
    }

    #[test]
    fn test_label_without_interactions_section() {
        let vocab = DrugVocabulary::curated();
        let payload = json!({ "results": [{ "set_id": "abc" }] });
        assert!(parse_labels("warfarin", &payload, &vocab, &ExtractOptions::new(10)).unwrap().is_empty());
    }

    #[test]
    fn test_missing_results_array_is_parse_error() {
        let vocab = DrugVocabulary::curated();
        let opts = ExtractOptions::new(10);
        let moved = json!({ "message": "API v3 moved", "data": { "items": [] } });
        let err = parse_labels("warfarin", &moved, &vocab, &opts).unwrap_err();
        assert!(matches!(err, DdiError::Parse { origin: EvidenceSource::Regulatory, .. }));
        assert!(parse_labels("warfarin", &json!({ "results": [] }), &vocab, &opts).unwrap().is_empty());
    }
}
