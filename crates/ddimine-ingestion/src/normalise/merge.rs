//! Pair-level merging of evidence.
//!
//! Conflict policy:
//! - evidence level: the highest grade wins;
//! - effect and management come from a highest-grade contributor, with
//!   source precedence breaking ties between equal grades;
//! - severity: the maximum across contributors;
//! - citations and mechanism tags: unions (citations dedup on `(type, id)`).

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use ddimine_common::confidence::aggregate_confidence;
use ddimine_common::evidence::{
    DrugPairKey, EvidenceSource, NormalizedEvidence, RawEvidenceEntry, Severity, SourceCitation,
};

use super::mechanism::{default_management, infer_severity, infer_tags, rule_for, typical_severity};
use crate::sources::truncate_excerpt;

const EFFECT_CHARS: usize = 240;

/// Precedence order of sources (first wins ties).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePrecedence(Vec<EvidenceSource>);

impl SourcePrecedence {
    pub fn new(order: Vec<EvidenceSource>) -> Self {
        Self(order)
    }

    pub fn rank(&self, source: EvidenceSource) -> usize {
        self.0.iter().position(|s| *s == source).unwrap_or(self.0.len())
    }
}

impl Default for SourcePrecedence {
    fn default() -> Self {
        Self(vec![
            EvidenceSource::Regulatory,
            EvidenceSource::ClinicalTrial,
            EvidenceSource::Publication,
        ])
    }
}

/// Mechanism tags of an entry: the extractor's own, else inferred.
pub(crate) fn entry_tags(entry: &RawEvidenceEntry) -> Vec<String> {
    if entry.mechanism_tags.is_empty() {
        let text = format!("{} {}", entry.effect.as_deref().unwrap_or(""), entry.excerpt);
        infer_tags(&text)
    } else {
        entry.mechanism_tags.iter().map(|t| t.trim().to_lowercase()).collect()
    }
}

/// Severity of an entry: hint, else wording, else typical for its tags.
pub(crate) fn entry_severity(entry: &RawEvidenceEntry, tags: &[String]) -> Severity {
    entry
        .severity_hint
        .or_else(|| infer_severity(&entry.excerpt))
        .or_else(|| typical_severity(tags))
        .unwrap_or(Severity::Minor)
}

/// Merge a group of accepted entries sharing `key` into one record.
pub(crate) fn merge_group(
    key: DrugPairKey,
    group: &[&RawEvidenceEntry],
    precedence: &SourcePrecedence,
) -> NormalizedEvidence {
    let tagged: Vec<(&RawEvidenceEntry, Vec<String>)> =
        group.iter().map(|e| (*e, entry_tags(e))).collect();

    let evidence_level = group
        .iter()
        .map(|e| e.evidence_level())
        .max()
        .unwrap_or_else(|| EvidenceSource::Publication.default_evidence_level());

    let severity = tagged
        .iter()
        .map(|(e, tags)| entry_severity(e, tags))
        .max()
        .unwrap_or(Severity::Minor);

    let tags: BTreeSet<String> = tagged.iter().flat_map(|(_, t)| t.iter().cloned()).collect();
    let tags: Vec<String> = tags.into_iter().collect();

    // Contributors ordered best first: grade, then source precedence.
    let mut ranked: Vec<&RawEvidenceEntry> = group.to_vec();
    ranked.sort_by(|a, b| {
        b.evidence_level()
            .cmp(&a.evidence_level())
            .then(precedence.rank(a.source).cmp(&precedence.rank(b.source)))
    });

    let effect = ranked
        .iter()
        .find_map(|e| e.effect.clone().filter(|s| !s.trim().is_empty()))
        .or_else(|| tags.iter().find_map(|t| rule_for(t)).map(|r| r.description.to_string()))
        .or_else(|| ranked.first().map(|e| truncate_excerpt(&e.excerpt, EFFECT_CHARS)))
        .unwrap_or_default();

    let management = ranked
        .iter()
        .find_map(|e| e.management.clone().filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| default_management(severity).to_string());

    // One citation per (source, id), keeping the best hint any duplicate carried.
    let mut per_citation: BTreeMap<(EvidenceSource, String), SourceCitation> = BTreeMap::new();
    for entry in group {
        let slot = per_citation
            .entry((entry.source, entry.source_id.clone()))
            .or_insert_with(|| entry.citation());
        slot.confidence = slot.confidence.max(entry.confidence_hint);
        if slot.url.is_none() {
            slot.url = entry.url.clone();
        }
    }
    let mut citations: Vec<SourceCitation> = per_citation.into_values().collect();
    let confidence = citation_confidence(&citations);
    sort_citations(&mut citations, precedence);

    let first_seen_at = group.iter().map(|e| e.extracted_at).min().unwrap_or_else(Utc::now);
    let last_updated_at = group.iter().map(|e| e.extracted_at).max().unwrap_or_else(Utc::now);

    NormalizedEvidence {
        drug_pair_key: key,
        severity,
        effect,
        management,
        evidence_level,
        merged_from_count: citations.len(),
        source_citations: citations,
        mechanism_tags: tags,
        first_seen_at,
        last_updated_at,
        confidence,
    }
}

fn citation_confidence(citations: &[SourceCitation]) -> f64 {
    aggregate_confidence(&citations.iter().map(|c| c.confidence).collect::<Vec<_>>())
}

fn sort_citations(citations: &mut [SourceCitation], precedence: &SourcePrecedence) {
    citations.sort_by(|a, b| {
        precedence
            .rank(a.kind)
            .cmp(&precedence.rank(b.kind))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Fold `incoming` into `existing` (same key). Returns the number of
/// citations `incoming` contributed that `existing` lacked.
pub(crate) fn merge_records(
    existing: &mut NormalizedEvidence,
    incoming: NormalizedEvidence,
    precedence: &SourcePrecedence,
) -> usize {
    let lead_rank = |r: &NormalizedEvidence| {
        r.source_citations
            .first()
            .map(|c| precedence.rank(c.kind))
            .unwrap_or(usize::MAX)
    };
    let incoming_wins = incoming.evidence_level > existing.evidence_level
        || (incoming.evidence_level == existing.evidence_level && lead_rank(&incoming) < lead_rank(existing));
    if incoming_wins {
        existing.effect = incoming.effect.clone();
        existing.management = incoming.management.clone();
    }
    existing.evidence_level = existing.evidence_level.max(incoming.evidence_level);
    existing.severity = existing.severity.max(incoming.severity);

    let mut added = 0;
    for citation in incoming.source_citations {
        match existing
            .source_citations
            .iter_mut()
            .find(|c| c.kind == citation.kind && c.id == citation.id)
        {
            Some(known) => {
                known.confidence = known.confidence.max(citation.confidence);
                if known.url.is_none() {
                    known.url = citation.url;
                }
            }
            None => {
                existing.source_citations.push(citation);
                added += 1;
            }
        }
    }
    sort_citations(&mut existing.source_citations, precedence);

    let tags: BTreeSet<String> = existing
        .mechanism_tags
        .drain(..)
        .chain(incoming.mechanism_tags)
        .collect();
    existing.mechanism_tags = tags.into_iter().collect();

    existing.first_seen_at = existing.first_seen_at.min(incoming.first_seen_at);
    existing.last_updated_at = existing.last_updated_at.max(incoming.last_updated_at);
    existing.merged_from_count += added;
    existing.confidence = citation_confidence(&existing.source_citations);
    added
}

/// Accumulated normalized evidence, one record per pair key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceTable {
    records: BTreeMap<DrugPairKey, NormalizedEvidence>,
}

impl EvidenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &DrugPairKey) -> Option<&NormalizedEvidence> {
        self.records.get(key)
    }

    /// Records ordered by pair key.
    pub fn records(&self) -> Vec<NormalizedEvidence> {
        self.records.values().cloned().collect()
    }

    pub fn for_drug(&self, drug: &str) -> Vec<NormalizedEvidence> {
        self.records
            .values()
            .filter(|r| r.drug_pair_key.involves(drug))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Insert or merge one record. Returns true when it merged into an
    /// existing record.
    pub(crate) fn upsert(&mut self, record: NormalizedEvidence, precedence: &SourcePrecedence) -> bool {
        match self.records.get_mut(&record.drug_pair_key) {
            Some(existing) => {
                merge_records(existing, record, precedence);
                true
            }
            None => {
                self.records.insert(record.drug_pair_key.clone(), record);
                false
            }
        }
    }
}

impl FromIterator<NormalizedEvidence> for EvidenceTable {
    fn from_iter<I: IntoIterator<Item = NormalizedEvidence>>(iter: I) -> Self {
        let precedence = SourcePrecedence::default();
        let mut table = EvidenceTable::new();
        for record in iter {
            table.upsert(record, &precedence);
        }
        table
    }
}
