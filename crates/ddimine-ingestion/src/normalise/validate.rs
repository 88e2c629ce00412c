//! Schema validation of normalized evidence supplied as JSON.
//!
//! Invalid entries are quarantined with a reason code, never dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ddimine_common::error::DdiError;
use ddimine_common::evidence::{
    DrugPairKey, EvidenceLevel, EvidenceSource, NormalizedEvidence, Severity, ValidationReason,
};

use super::mechanism::is_known_tag;

const REQUIRED_FIELDS: &[&str] = &[
    "drug_pair_key",
    "severity",
    "effect",
    "management",
    "evidence_level",
    "source_citations",
    "mechanism_tags",
    "first_seen_at",
    "last_updated_at",
    "merged_from_count",
];

/// An entry that failed validation, kept with its original JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedEntry {
    pub index: usize,
    pub reason: ValidationReason,
    pub message: String,
    pub entry: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub index: usize,
    pub drug_pair_key: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: Vec<NormalizedEvidence>,
    pub invalid: Vec<QuarantinedEntry>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationOutcome {
    pub fn valid_count(&self) -> usize {
        self.valid.len()
    }

    pub fn invalid_count(&self) -> usize {
        self.invalid.len()
    }
}

/// Check each entry against the normalized evidence schema.
pub fn validate_entries(entries: &[Value]) -> ValidationOutcome {
    let mut outcome = ValidationOutcome::default();
    for (index, entry) in entries.iter().enumerate() {
        match check_entry(entry) {
            Ok(record) => {
                outcome.warnings.extend(warnings_for(index, &record));
                outcome.valid.push(record);
            }
            Err((reason, message)) => outcome.invalid.push(QuarantinedEntry {
                index,
                reason,
                message,
                entry: entry.clone(),
            }),
        }
    }
    outcome
}

/// Validate a bare array of records or a JSON export document
/// (`{"records": [...]}`). Any other shape is rejected as a whole.
pub fn validate_document(document: &Value) -> ddimine_common::error::Result<ValidationOutcome> {
    let entries = document
        .as_array()
        .or_else(|| document.get("records").and_then(Value::as_array))
        .ok_or_else(|| DdiError::Validation {
            reason: ValidationReason::SchemaMismatch,
            message: "expected an array of records or an export document with `records`".to_string(),
        })?;
    Ok(validate_entries(entries))
}

fn check_entry(entry: &Value) -> Result<NormalizedEvidence, (ValidationReason, String)> {
    let Some(obj) = entry.as_object() else {
        return Err((ValidationReason::NotAnObject, "entry is not a JSON object".into()));
    };

    if let Some(missing) = REQUIRED_FIELDS.iter().find(|f| obj.get(**f).map_or(true, Value::is_null)) {
        return Err((ValidationReason::MissingField, format!("missing required field `{missing}`")));
    }

    let key = obj["drug_pair_key"].as_str().unwrap_or_default();
    if DrugPairKey::parse(key).is_none() {
        return Err((
            ValidationReason::MalformedPairKey,
            format!("`{key}` is not a canonical pair key (two lower-case sorted names joined by `|`)"),
        ));
    }

    let level = obj["evidence_level"].as_str().unwrap_or_default();
    if EvidenceLevel::parse(level).map(|l| l.as_str() != level).unwrap_or(true) {
        return Err((
            ValidationReason::InvalidEvidenceLevel,
            format!("evidence_level `{level}` is not one of A, B, C, D"),
        ));
    }

    let severity = obj["severity"].as_str().unwrap_or_default();
    if Severity::parse(severity).map_or(true, |s| s.as_str() != severity) {
        return Err((
            ValidationReason::InvalidSeverity,
            format!("severity `{severity}` is not one of minor, moderate, major"),
        ));
    }

    let Some(citations) = obj["source_citations"].as_array() else {
        return Err((ValidationReason::MalformedCitation, "source_citations is not an array".into()));
    };
    for (i, citation) in citations.iter().enumerate() {
        let well_formed = citation["type"]
            .as_str()
            .is_some_and(|t| t.parse::<EvidenceSource>().is_ok_and(|s| s.as_str() == t))
            && citation["id"].as_str().is_some_and(|id| !id.trim().is_empty());
        if !well_formed {
            return Err((
                ValidationReason::MalformedCitation,
                format!("source_citations[{i}] needs a known `type` and a non-empty `id`"),
            ));
        }
    }

    serde_json::from_value::<NormalizedEvidence>(entry.clone())
        .map_err(|e| (ValidationReason::SchemaMismatch, e.to_string()))
}

fn warnings_for(index: usize, record: &NormalizedEvidence) -> Vec<ValidationWarning> {
    let key = Some(record.drug_pair_key.to_string());
    let mut warnings = Vec::new();
    let mut warn = |message: String| {
        warnings.push(ValidationWarning { index, drug_pair_key: key.clone(), message })
    };

    if record.source_citations.is_empty() {
        warn("record has no source citations".into());
    }
    if record.effect.trim().is_empty() {
        warn("effect is empty".into());
    }
    for tag in record.mechanism_tags.iter().filter(|t| !is_known_tag(t)) {
        warn(format!("unknown mechanism tag `{tag}`"));
    }
    if !(0.0..=1.0).contains(&record.confidence) {
        warn(format!("confidence {} is outside [0, 1]", record.confidence));
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "drug_pair_key": "doxorubicin|trastuzumab",
            "severity": "major",
            "effect": "Additive cardiotoxicity",
            "management": "Monitor LVEF.",
            "evidence_level": "A",
            "source_citations": [{ "type": "regulatory", "id": "set-1", "url": null }],
            "mechanism_tags": ["cardiotoxicity"],
            "first_seen_at": "2024-01-01T00:00:00Z",
            "last_updated_at": "2024-01-02T00:00:00Z",
            "merged_from_count": 1
        })
    }

    fn with(field: &str, value: Value) -> Value {
        let mut v = valid();
        v[field] = value;
        v
    }

    #[test]
    fn test_valid_entry_passes() {
        let outcome = validate_entries(&[valid()]);
        assert_eq!(outcome.valid_count(), 1);
        assert_eq!(outcome.invalid_count(), 0);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_reason_codes() {
        let mut missing = valid();
        missing.as_object_mut().unwrap().remove("effect");
        let cases = vec![
            (json!("nope"), ValidationReason::NotAnObject),
            (missing, ValidationReason::MissingField),
            (with("drug_pair_key", json!("trastuzumab|doxorubicin")), ValidationReason::MalformedPairKey),
            (with("evidence_level", json!("E")), ValidationReason::InvalidEvidenceLevel),
            (with("evidence_level", json!("a")), ValidationReason::InvalidEvidenceLevel),
            (with("severity", json!("severe")), ValidationReason::InvalidSeverity),
            (with("source_citations", json!([{ "type": "blog", "id": "x" }])), ValidationReason::MalformedCitation),
            (with("merged_from_count", json!("two")), ValidationReason::SchemaMismatch),
        ];
        for (entry, reason) in cases {
            let outcome = validate_entries(&[entry]);
            assert_eq!(outcome.invalid.len(), 1, "expected {reason}");
            assert_eq!(outcome.invalid[0].reason, reason);
        }
    }

    #[test]
    fn test_invalid_entries_are_counted_separately() {
        let outcome = validate_entries(&[valid(), json!(42), valid()]);
        assert_eq!(outcome.valid_count(), 2);
        assert_eq!(outcome.invalid[0].index, 1);
        assert_eq!(outcome.invalid[0].entry, json!(42));
    }

    #[test]
    fn test_warnings() {
        let mut entry = with("source_citations", json!([]));
        entry["effect"] = json!(" ");
        entry["mechanism_tags"] = json!(["telepathy"]);
        let outcome = validate_entries(&[entry]);
        assert_eq!(outcome.valid_count(), 1);
        assert_eq!(outcome.warnings.len(), 3);
    }

    #[test]
    fn test_export_document_is_accepted() {
        let doc = json!({ "total_records": 2, "exported_records": 2, "records": [valid(), json!(7)] });
        let outcome = validate_document(&doc).unwrap();
        assert_eq!(outcome.valid_count(), 1);
        assert_eq!(outcome.invalid_count(), 1);
        assert_eq!(validate_document(&json!([valid()])).unwrap().valid_count(), 1);
    }

    #[test]
    fn test_document_of_wrong_shape_is_rejected() {
        for doc in [json!(42), json!({ "items": [] }), json!({ "records": "none" }), Value::Null] {
            let err = validate_document(&doc).unwrap_err();
            assert!(matches!(err, DdiError::Validation { reason: ValidationReason::SchemaMismatch, .. }));
            assert_eq!(err.code(), "validation");
        }
    }
}
