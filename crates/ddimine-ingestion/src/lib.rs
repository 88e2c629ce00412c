//! ddimine-ingestion — DDI evidence mining pipeline.
//! - Evidence extraction (ClinicalTrials.gov, openFDA labels, PubMed)
//! - Per-source and session-wide rate limiting
//! - TTL cache of raw extractor results
//! - Normalisation, pair merging and schema validation
//! - Job progress tracking
//! - JSON / CSV / TSV export

pub mod sources;
pub mod rate_limit;
pub mod cache;
pub mod normalise;
pub mod progress;
pub mod export;
pub mod models;
pub mod vocabulary;
pub mod pipeline;
pub mod testing;

pub use pipeline::{Orchestrator, OrchestratorBuilder};

/// Lock a std mutex, recovering the data if a previous holder panicked.
/// Worker panics are caught at the job boundary, so shared state must stay
/// usable afterwards.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
