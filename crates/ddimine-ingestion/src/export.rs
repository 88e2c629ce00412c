//! Export of accumulated evidence as JSON, CSV or TSV.
//!
//! Output is capped at `max_export_bytes`; records are dropped from the end
//! until the document fits and `truncated` is set.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ddimine_common::error::{DdiError, Result};
use ddimine_common::evidence::NormalizedEvidence;

/// Column order of the delimited formats.
pub const EXPORT_COLUMNS: &[&str] = &[
    "drug_pair_key",
    "drug_a",
    "drug_b",
    "severity",
    "evidence_level",
    "effect",
    "management",
    "mechanism_tags",
    "citation_count",
    "citations",
    "confidence",
    "first_seen_at",
    "last_updated_at",
    "merged_from_count",
];

const LIST_SEPARATOR: &str = ";";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
    Tsv,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv  => "csv",
            ExportFormat::Tsv  => "tsv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv  => "text/csv",
            ExportFormat::Tsv  => "text/tab-separated-values",
        }
    }

    fn delimiter(&self) -> u8 {
        match self {
            ExportFormat::Tsv => b'\t',
            _ => b',',
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = DdiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "tsv" | "tab" => Ok(ExportFormat::Tsv),
            other => Err(DdiError::InvalidRequest(format!(
                "unsupported export format `{other}` (expected json, csv or tsv)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportLimits {
    pub max_bytes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportOutput {
    pub format: ExportFormat,
    pub bytes: Vec<u8>,
    /// Records written.
    pub record_count: usize,
    /// Records available before truncation.
    pub total_records: usize,
    pub truncated: bool,
}

impl ExportOutput {
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// JSON document layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonExport {
    pub generated_at: DateTime<Utc>,
    pub truncated: bool,
    pub total_records: usize,
    pub exported_records: usize,
    pub records: Vec<NormalizedEvidence>,
}

/// One flat row of the delimited formats; list columns are `;`-joined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    pub drug_pair_key: String,
    pub drug_a: String,
    pub drug_b: String,
    pub severity: String,
    pub evidence_level: String,
    pub effect: String,
    pub management: String,
    pub mechanism_tags: String,
    pub citation_count: usize,
    pub citations: String,
    pub confidence: f64,
    pub first_seen_at: String,
    pub last_updated_at: String,
    pub merged_from_count: usize,
}

impl From<&NormalizedEvidence> for ExportRow {
    fn from(r: &NormalizedEvidence) -> Self {
        let (drug_a, drug_b) = r.drug_pair_key.drugs();
        Self {
            drug_pair_key: r.drug_pair_key.to_string(),
            drug_a: drug_a.to_string(),
            drug_b: drug_b.to_string(),
            severity: r.severity.to_string(),
            evidence_level: r.evidence_level.to_string(),
            effect: r.effect.clone(),
            management: r.management.clone(),
            mechanism_tags: r.mechanism_tags.join(LIST_SEPARATOR),
            citation_count: r.source_citations.len(),
            citations: r
                .source_citations
                .iter()
                .map(|c| c.label())
                .collect::<Vec<_>>()
                .join(LIST_SEPARATOR),
            confidence: (r.confidence * 1000.0).round() / 1000.0,
            first_seen_at: r.first_seen_at.to_rfc3339(),
            last_updated_at: r.last_updated_at.to_rfc3339(),
            merged_from_count: r.merged_from_count,
        }
    }
}

pub fn export(records: &[NormalizedEvidence], format: ExportFormat, limits: ExportLimits) -> Result<ExportOutput> {
    match format {
        ExportFormat::Json => export_json(records, limits),
        ExportFormat::Csv | ExportFormat::Tsv => export_delimited(records, format, limits),
    }
}

fn export_json(records: &[NormalizedEvidence], limits: ExportLimits) -> Result<ExportOutput> {
    let generated_at = Utc::now();
    let render = |n: usize| -> Result<Vec<u8>> {
        let doc = JsonExport {
            generated_at,
            truncated: n < records.len(),
            total_records: records.len(),
            exported_records: n,
            records: records[..n].to_vec(),
        };
        Ok(serde_json::to_vec_pretty(&doc)?)
    };

    let full = render(records.len())?;
    if full.len() <= limits.max_bytes {
        return Ok(ExportOutput {
            format: ExportFormat::Json,
            bytes: full,
            record_count: records.len(),
            total_records: records.len(),
            truncated: false,
        });
    }

    // Largest prefix that fits; size grows with n.
    let (mut lo, mut hi) = (0usize, records.len());
    let mut best = None;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let bytes = render(mid)?;
        if bytes.len() <= limits.max_bytes {
            best = Some((mid, bytes));
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let (count, bytes) = best.ok_or_else(|| {
        DdiError::Export(format!("max_export_bytes ({}) is too small for an empty document", limits.max_bytes))
    })?;
    Ok(ExportOutput {
        format: ExportFormat::Json,
        bytes,
        record_count: count,
        total_records: records.len(),
        truncated: true,
    })
}

fn delimited_bytes<F>(format: ExportFormat, write: F) -> Result<Vec<u8>>
where
    F: FnOnce(&mut csv::Writer<Vec<u8>>) -> csv::Result<()>,
{
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(format.delimiter())
        .has_headers(false)
        .from_writer(vec![]);
    write(&mut wtr).map_err(|e| DdiError::Export(e.to_string()))?;
    wtr.into_inner().map_err(|e| DdiError::Export(e.to_string()))
}

fn export_delimited(records: &[NormalizedEvidence], format: ExportFormat, limits: ExportLimits) -> Result<ExportOutput> {
    let mut bytes = delimited_bytes(format, |w| w.write_record(EXPORT_COLUMNS))?;
    if bytes.len() > limits.max_bytes {
        return Err(DdiError::Export(format!(
            "max_export_bytes ({}) is too small for the header row",
            limits.max_bytes
        )));
    }

    let mut count = 0;
    for record in records {
        let row = delimited_bytes(format, |w| w.serialize(ExportRow::from(record)))?;
        if bytes.len() + row.len() > limits.max_bytes {
            break;
        }
        bytes.extend_from_slice(&row);
        count += 1;
    }

    Ok(ExportOutput {
        format,
        bytes,
        record_count: count,
        total_records: records.len(),
        truncated: count < records.len(),
    })
}
