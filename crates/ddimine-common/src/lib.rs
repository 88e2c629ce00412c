//! ddimine-common — Shared types, errors, and configuration used across all ddimine crates.

pub mod error;
pub mod evidence;
pub mod confidence;
pub mod mining_config;
pub mod sandbox;

// Re-export commonly used types
pub use error::{DdiError, Result};
pub use evidence::{
    DrugPairKey, EvidenceLevel, EvidenceSource, NormalizedEvidence, RawEvidenceEntry, Severity,
    SourceCitation, ValidationReason,
};
pub use mining_config::{MiningConfig, SourceRateConfig};
