//! Evidence data model shared by extractors, normalisation and export.
//!
//! Two shapes exist:
//! - `RawEvidenceEntry`: one source-attributed claim, as an extractor produced it.
//! - `NormalizedEvidence`: the canonical, deduplicated record for one drug pair.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Sources ───────────────────────────────────────────────────────────────────

/// The external evidence source an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvidenceSource {
    ClinicalTrial,
    Regulatory,
    Publication,
}

impl EvidenceSource {
    pub const ALL: [EvidenceSource; 3] = [
        EvidenceSource::ClinicalTrial,
        EvidenceSource::Regulatory,
        EvidenceSource::Publication,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceSource::ClinicalTrial => "clinical-trial",
            EvidenceSource::Regulatory    => "regulatory",
            EvidenceSource::Publication   => "publication",
        }
    }

    /// Evidence level assumed when an entry carries no explicit grade.
    pub fn default_evidence_level(&self) -> EvidenceLevel {
        match self {
            EvidenceSource::Regulatory    => EvidenceLevel::A,
            EvidenceSource::ClinicalTrial => EvidenceLevel::B,
            EvidenceSource::Publication   => EvidenceLevel::C,
        }
    }
}

impl fmt::Display for EvidenceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvidenceSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "clinical-trial" | "clinical-trials" | "clinicaltrials" => Ok(EvidenceSource::ClinicalTrial),
            "regulatory" | "label" | "openfda"                       => Ok(EvidenceSource::Regulatory),
            "publication" | "pubmed" | "literature"                  => Ok(EvidenceSource::Publication),
            other => Err(format!("unknown evidence source: {other}")),
        }
    }
}

// ── Grades ────────────────────────────────────────────────────────────────────

/// Clinical severity tier. Ordered: `Minor < Moderate < Major`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Minor,
    Moderate,
    Major,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Minor    => "minor",
            Severity::Moderate => "moderate",
            Severity::Major    => "major",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "minor"                                => Some(Severity::Minor),
            "moderate"                             => Some(Severity::Moderate),
            "major" | "severe" | "contraindicated" => Some(Severity::Major),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strength of the supporting evidence. Ordered: `D < C < B < A`.
///
/// - A: regulatory label or controlled clinical data
/// - B: clinical trial / cohort data
/// - C: case reports and published observations
/// - D: theoretical or in vitro only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EvidenceLevel {
    D,
    C,
    B,
    A,
}

impl EvidenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceLevel::A => "A",
            EvidenceLevel::B => "B",
            EvidenceLevel::C => "C",
            EvidenceLevel::D => "D",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "A" => Some(EvidenceLevel::A),
            "B" => Some(EvidenceLevel::B),
            "C" => Some(EvidenceLevel::C),
            "D" => Some(EvidenceLevel::D),
            _ => None,
        }
    }
}

impl fmt::Display for EvidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Pair key ──────────────────────────────────────────────────────────────────

/// Lower-case, trim and collapse inner whitespace of a drug name.
pub fn canonical_drug_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Order-independent identifier of a drug pair: `"<a>|<b>"` with `a < b`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DrugPairKey(String);

impl DrugPairKey {
    pub const SEPARATOR: char = '|';

    /// Build the key for two drug names. Returns `None` for blank names,
    /// names containing the separator, or a drug paired with itself.
    pub fn new(drug_a: &str, drug_b: &str) -> Option<Self> {
        let a = canonical_drug_name(drug_a);
        let b = canonical_drug_name(drug_b);
        if a.is_empty() || b.is_empty() || a == b {
            return None;
        }
        if a.contains(Self::SEPARATOR) || b.contains(Self::SEPARATOR) {
            return None;
        }
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Some(Self(format!("{first}{}{second}", Self::SEPARATOR)))
    }

    /// Accept an already-built key only if it is in canonical form.
    pub fn parse(raw: &str) -> Option<Self> {
        let (a, b) = raw.split_once(Self::SEPARATOR)?;
        let key = Self::new(a, b)?;
        (key.0 == raw).then_some(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn drugs(&self) -> (&str, &str) {
        self.0
            .split_once(Self::SEPARATOR)
            .unwrap_or((self.0.as_str(), ""))
    }

    pub fn involves(&self, drug: &str) -> bool {
        let drug = canonical_drug_name(drug);
        let (a, b) = self.drugs();
        a == drug || b == drug
    }
}

impl fmt::Display for DrugPairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Citations ─────────────────────────────────────────────────────────────────

/// Provenance of one piece of evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCitation {
    #[serde(rename = "type")]
    pub kind: EvidenceSource,
    pub id: String,
    pub url: Option<String>,
    /// Best confidence hint among the raw entries citing this id.
    #[serde(default)]
    pub confidence: f64,
}

impl SourceCitation {
    /// Compact `type:id` form used in flat exports.
    pub fn label(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

// ── Raw entries ───────────────────────────────────────────────────────────────

/// One source-attributed DDI claim as extracted, before normalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvidenceEntry {
    pub source: EvidenceSource,
    pub drug_a: String,
    pub drug_b: String,
    /// NCT id, label set id or PMID depending on `source`.
    pub source_id: String,
    pub excerpt: String,
    pub extracted_at: DateTime<Utc>,
    /// Extractor's own confidence in the claim, in [0, 1].
    pub confidence_hint: f64,
    #[serde(default)]
    pub severity_hint: Option<Severity>,
    #[serde(default)]
    pub evidence_level_hint: Option<EvidenceLevel>,
    #[serde(default)]
    pub effect: Option<String>,
    #[serde(default)]
    pub management: Option<String>,
    #[serde(default)]
    pub mechanism_tags: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl RawEvidenceEntry {
    /// Minimal entry; optional fields are filled with the builder-style setters.
    pub fn new(
        source: EvidenceSource,
        drug_a: impl Into<String>,
        drug_b: impl Into<String>,
        source_id: impl Into<String>,
        excerpt: impl Into<String>,
    ) -> Self {
        Self {
            source,
            drug_a: drug_a.into(),
            drug_b: drug_b.into(),
            source_id: source_id.into(),
            excerpt: excerpt.into(),
            extracted_at: Utc::now(),
            confidence_hint: crate::confidence::source_base_confidence(source),
            severity_hint: None,
            evidence_level_hint: None,
            effect: None,
            management: None,
            mechanism_tags: Vec::new(),
            url: None,
        }
    }

    pub fn with_evidence_level(mut self, level: EvidenceLevel) -> Self {
        self.evidence_level_hint = Some(level);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity_hint = Some(severity);
        self
    }

    pub fn with_effect(mut self, effect: impl Into<String>) -> Self {
        self.effect = Some(effect.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence_hint = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn pair_key(&self) -> Option<DrugPairKey> {
        DrugPairKey::new(&self.drug_a, &self.drug_b)
    }

    pub fn citation(&self) -> SourceCitation {
        SourceCitation {
            kind: self.source,
            id: self.source_id.clone(),
            url: self.url.clone(),
            confidence: self.confidence_hint,
        }
    }

    /// Explicit grade if the extractor set one, otherwise the source default.
    pub fn evidence_level(&self) -> EvidenceLevel {
        self.evidence_level_hint
            .unwrap_or_else(|| self.source.default_evidence_level())
    }
}

// ── Normalised records ────────────────────────────────────────────────────────

/// Canonical, merged evidence for one drug pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvidence {
    pub drug_pair_key: DrugPairKey,
    pub severity: Severity,
    pub effect: String,
    pub management: String,
    pub evidence_level: EvidenceLevel,
    pub source_citations: Vec<SourceCitation>,
    pub mechanism_tags: Vec<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub merged_from_count: usize,
    /// Noisy-OR over the per-citation confidences.
    #[serde(default)]
    pub confidence: f64,
}

// ── Validation reasons ────────────────────────────────────────────────────────

/// Why an entry was quarantined by schema validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationReason {
    NotAnObject,
    MissingField,
    MalformedPairKey,
    InvalidEvidenceLevel,
    InvalidSeverity,
    MalformedCitation,
    SchemaMismatch,
}

impl ValidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationReason::NotAnObject          => "not_an_object",
            ValidationReason::MissingField         => "missing_field",
            ValidationReason::MalformedPairKey     => "malformed_pair_key",
            ValidationReason::InvalidEvidenceLevel => "invalid_evidence_level",
            ValidationReason::InvalidSeverity      => "invalid_severity",
            ValidationReason::MalformedCitation    => "malformed_citation",
            ValidationReason::SchemaMismatch       => "schema_mismatch",
        }
    }
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
