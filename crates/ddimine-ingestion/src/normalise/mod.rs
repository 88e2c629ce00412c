//! Evidence normalisation.
//!
//! - `normalize`: raw entries -> one canonical record per drug pair
//! - `merge_into`: fold a fresh batch into the accumulated table
//! - `validate`: schema checks on externally supplied records
//!
//! Mechanism tags and severity are inferred from excerpt text when the
//! extractor did not provide them (see [`mechanism`]).

pub mod mechanism;
pub mod merge;
pub mod validate;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use ddimine_common::error::Result;
use ddimine_common::evidence::{canonical_drug_name, DrugPairKey, NormalizedEvidence, RawEvidenceEntry};
use ddimine_common::mining_config::MiningConfig;

pub use merge::{EvidenceTable, SourcePrecedence};
pub use validate::{validate_document, validate_entries, QuarantinedEntry, ValidationOutcome, ValidationWarning};

/// Counters for one or more `normalize` calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationReport {
    pub entries_in: usize,
    pub entries_out: usize,
    pub rejected: usize,
    /// Entries folded into a record another entry had already opened.
    pub merges: usize,
    #[serde(default)]
    pub rejected_by_reason: BTreeMap<String, usize>,
}

impl NormalizationReport {
    fn reject(&mut self, reason: &str) {
        self.rejected += 1;
        *self.rejected_by_reason.entry(reason.to_string()).or_default() += 1;
    }

    /// Add another report's counters to this one.
    pub fn absorb(&mut self, other: &NormalizationReport) {
        self.entries_in += other.entries_in;
        self.entries_out += other.entries_out;
        self.rejected += other.rejected;
        self.merges += other.merges;
        for (reason, n) in &other.rejected_by_reason {
            *self.rejected_by_reason.entry(reason.clone()).or_default() += n;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizationService {
    precedence: SourcePrecedence,
}

impl NormalizationService {
    pub fn new(precedence: SourcePrecedence) -> Self {
        Self { precedence }
    }

    pub fn from_config(config: &MiningConfig) -> Self {
        Self::new(SourcePrecedence::new(config.source_precedence.clone()))
    }

    /// Group raw entries by pair key and merge each group into one record.
    /// Entries without a usable pair or source id are rejected and counted.
    pub fn normalize(&self, raw: &[RawEvidenceEntry]) -> (Vec<NormalizedEvidence>, NormalizationReport) {
        let mut report = NormalizationReport { entries_in: raw.len(), ..Default::default() };
        let mut groups: BTreeMap<DrugPairKey, Vec<&RawEvidenceEntry>> = BTreeMap::new();

        for entry in raw {
            if let Some(reason) = rejection_reason(entry) {
                report.reject(reason);
                continue;
            }
            if let Some(key) = entry.pair_key() {
                groups.entry(key).or_default().push(entry);
            }
        }

        let accepted: usize = groups.values().map(Vec::len).sum();
        let records: Vec<NormalizedEvidence> = groups
            .into_iter()
            .map(|(key, group)| merge::merge_group(key, &group, &self.precedence))
            .collect();

        report.entries_out = records.len();
        report.merges = accepted - records.len();
        debug!(
            entries_in = report.entries_in,
            entries_out = report.entries_out,
            rejected = report.rejected,
            "normalised evidence batch"
        );
        (records, report)
    }

    /// Merge `records` into `table` by pair key. Returns how many records
    /// merged into existing ones (the rest were inserted).
    pub fn merge_into(&self, table: &mut EvidenceTable, records: Vec<NormalizedEvidence>) -> usize {
        let mut merged = 0;
        for record in records {
            if table.upsert(record, &self.precedence) {
                merged += 1;
            }
        }
        merged
    }

    pub fn validate(&self, document: &Value) -> Result<ValidationOutcome> {
        validate_document(document)
    }
}

fn rejection_reason(entry: &RawEvidenceEntry) -> Option<&'static str> {
    let a = canonical_drug_name(&entry.drug_a);
    let b = canonical_drug_name(&entry.drug_b);
    if a.is_empty() || b.is_empty() {
        Some("blank_drug")
    } else if a == b {
        Some("self_pair")
    } else if entry.source_id.trim().is_empty() {
        Some("missing_source_id")
    } else if entry.pair_key().is_none() {
        Some("malformed_drug_name")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use ddimine_common::evidence::{EvidenceLevel, EvidenceSource, Severity};
    use pretty_assertions::assert_eq;

    fn ct_entry() -> RawEvidenceEntry {
        RawEvidenceEntry::new(EvidenceSource::ClinicalTrial, "doxorubicin", "trastuzumab", "NCT00021255", "Phase 3 trial.")
            .with_effect("cardiotoxicity")
            .with_evidence_level(EvidenceLevel::B)
    }

    fn label_entry() -> RawEvidenceEntry {
        RawEvidenceEntry::new(
            EvidenceSource::Regulatory,
            "Trastuzumab",
            "Doxorubicin",
            "set-42",
            "Concurrent use increases the incidence of cardiac dysfunction.",
        )
        .with_evidence_level(EvidenceLevel::A)
    }

    #[test]
    fn test_trial_and_label_merge_into_one_record() {
        let service = NormalizationService::default();
        let (records, report) = service.normalize(&[ct_entry(), label_entry()]);

        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.drug_pair_key.as_str(), "doxorubicin|trastuzumab");
        assert_eq!(r.evidence_level, EvidenceLevel::A);
        assert_eq!(r.merged_from_count, 2);
        assert_eq!(r.mechanism_tags, vec!["cardiotoxicity"]);
        // Regulatory ranks first in the default precedence.
        assert_eq!(r.source_citations[0].kind, EvidenceSource::Regulatory);
        assert_eq!(report.entries_in, 2);
        assert_eq!(report.entries_out, 1);
        assert_eq!(report.merges, 1);
    }

    #[test]
    fn test_effect_prefers_highest_grade_contributor() {
        let service = NormalizationService::default();
        let label = label_entry().with_effect("Increased cardiac dysfunction");
        let (records, _) = service.normalize(&[ct_entry(), label]);
        assert_eq!(records[0].effect, "Increased cardiac dysfunction");
    }

    #[test]
    fn test_precedence_breaks_grade_ties() {
        let a = RawEvidenceEntry::new(EvidenceSource::Publication, "warfarin", "aspirin", "111", "x")
            .with_evidence_level(EvidenceLevel::B)
            .with_effect("from publication");
        let b = RawEvidenceEntry::new(EvidenceSource::ClinicalTrial, "warfarin", "aspirin", "NCT1", "y")
            .with_evidence_level(EvidenceLevel::B)
            .with_effect("from trial");

        let (records, _) = NormalizationService::default().normalize(&[a.clone(), b.clone()]);
        assert_eq!(records[0].effect, "from trial");

        let pubs_first = SourcePrecedence::new(vec![
            EvidenceSource::Publication,
            EvidenceSource::Regulatory,
            EvidenceSource::ClinicalTrial,
        ]);
        let (records, _) = NormalizationService::new(pubs_first).normalize(&[a, b]);
        assert_eq!(records[0].effect, "from publication");
    }

    #[test]
    fn test_severity_takes_maximum() {
        let mild = RawEvidenceEntry::new(EvidenceSource::Publication, "warfarin", "aspirin", "1", "x")
            .with_severity(Severity::Minor);
        let severe = RawEvidenceEntry::new(EvidenceSource::Publication, "warfarin", "aspirin", "2", "y")
            .with_severity(Severity::Major);
        let (records, _) = NormalizationService::default().normalize(&[mild, severe]);
        assert_eq!(records[0].severity, Severity::Major);
    }

    #[test]
    fn test_rejections_are_counted_by_reason() {
        let entries = vec![
            RawEvidenceEntry::new(EvidenceSource::Publication, " ", "aspirin", "1", "x"),
            RawEvidenceEntry::new(EvidenceSource::Publication, "Aspirin", "aspirin", "2", "x"),
            RawEvidenceEntry::new(EvidenceSource::Publication, "warfarin", "aspirin", "", "x"),
            RawEvidenceEntry::new(EvidenceSource::Publication, "warfarin", "aspirin", "3", "x"),
        ];
        let (records, report) = NormalizationService::default().normalize(&entries);
        assert_eq!(records.len(), 1);
        assert_eq!(report.rejected, 3);
        assert_eq!(report.rejected_by_reason["self_pair"], 1);
        assert_eq!(report.rejected_by_reason["missing_source_id"], 1);
    }

    #[test]
    fn test_duplicate_citation_counts_once() {
        let e = label_entry();
        let (records, report) = NormalizationService::default().normalize(&[e.clone(), e]);
        assert_eq!(records[0].merged_from_count, 1);
        assert_eq!(records[0].source_citations.len(), 1);
        assert_eq!(report.merges, 1);
    }

    #[test]
    fn test_confidence_is_noisy_or() {
        let (records, _) = NormalizationService::default().normalize(&[ct_entry(), label_entry()]);
        let expected = 1.0 - (1.0 - 0.60) * (1.0 - 0.85);
        assert!((records[0].confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_merge_into_is_idempotent_for_known_citations() {
        let service = NormalizationService::default();
        let mut table = EvidenceTable::new();
        let (first, _) = service.normalize(&[ct_entry()]);
        assert_eq!(service.merge_into(&mut table, first.clone()), 0);
        assert_eq!(service.merge_into(&mut table, first), 1);

        let key = DrugPairKey::new("doxorubicin", "trastuzumab").unwrap();
        assert_eq!(table.get(&key).unwrap().merged_from_count, 1);

        let (second, _) = service.normalize(&[label_entry()]);
        service.merge_into(&mut table, second);
        let merged = table.get(&key).unwrap();
        assert_eq!(merged.merged_from_count, 2);
        assert_eq!(merged.evidence_level, EvidenceLevel::A);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_overlapping_batches_count_shared_citation_once() {
        let service = NormalizationService::default();
        let mut table = EvidenceTable::new();
        let (first, _) = service.normalize(&[label_entry()]);
        let (second, _) = service.normalize(&[label_entry(), ct_entry()]);
        service.merge_into(&mut table, first);
        service.merge_into(&mut table, second.clone());

        let key = DrugPairKey::new("doxorubicin", "trastuzumab").unwrap();
        let merged = table.get(&key).unwrap();
        assert_eq!(merged.merged_from_count, 2);
        assert!((merged.confidence - second[0].confidence).abs() < 1e-9);
        let expected = 1.0 - (1.0 - 0.60) * (1.0 - 0.85);
        assert!((merged.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_merge_into_tracks_seen_window() {
        let service = NormalizationService::default();
        let mut early = ct_entry();
        early.extracted_at = Utc::now() - Duration::days(2);
        let (a, _) = service.normalize(&[early.clone()]);
        let (b, _) = service.normalize(&[label_entry()]);
        let mut table = EvidenceTable::new();
        service.merge_into(&mut table, b);
        service.merge_into(&mut table, a);
        let record = &table.records()[0];
        assert_eq!(record.first_seen_at, early.extracted_at);
        assert!(record.last_updated_at > early.extracted_at);
    }
}
