//! In-memory extractors for tests and offline runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use ddimine_common::error::{DdiError, Result};
use ddimine_common::evidence::{canonical_drug_name, EvidenceSource, RawEvidenceEntry};

use crate::lock;
use crate::models::ExtractOptions;
use crate::sources::{EvidenceExtractor, ExtractorSet};

/// Extractor serving canned entries per drug.
#[derive(Debug)]
pub struct MockExtractor {
    source: EvidenceSource,
    entries: Mutex<HashMap<String, Vec<RawEvidenceEntry>>>,
    failing: AtomicBool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockExtractor {
    pub fn new(source: EvidenceSource) -> Self {
        Self {
            source,
            entries: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_entries(self, drug: &str, entries: Vec<RawEvidenceEntry>) -> Self {
        self.set_entries(drug, entries);
        self
    }

    pub fn failing(self) -> Self {
        self.set_failing(true);
        self
    }

    pub fn set_entries(&self, drug: &str, entries: Vec<RawEvidenceEntry>) {
        lock(&self.entries).insert(canonical_drug_name(drug), entries);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `extract` calls received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EvidenceExtractor for MockExtractor {
    fn source(&self) -> EvidenceSource {
        self.source
    }

    async fn extract(&self, drug: &str, options: &ExtractOptions) -> Result<Vec<RawEvidenceEntry>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(DdiError::Transport {
                origin: self.source,
                message: "mock upstream unavailable".to_string(),
                status: Some(503),
                retryable: false,
            });
        }
        let mut entries = lock(&self.entries)
            .get(&canonical_drug_name(drug))
            .cloned()
            .unwrap_or_default();
        entries.truncate(options.max_results);
        Ok(entries)
    }
}

/// One mock per source, with handles kept for assertions.
#[derive(Debug, Clone)]
pub struct MockSources {
    pub clinical_trial: Arc<MockExtractor>,
    pub regulatory: Arc<MockExtractor>,
    pub publication: Arc<MockExtractor>,
}

impl MockSources {
    pub fn new() -> Self {
        Self::from_mocks(
            MockExtractor::new(EvidenceSource::ClinicalTrial),
            MockExtractor::new(EvidenceSource::Regulatory),
            MockExtractor::new(EvidenceSource::Publication),
        )
    }

    pub fn from_mocks(clinical_trial: MockExtractor, regulatory: MockExtractor, publication: MockExtractor) -> Self {
        Self {
            clinical_trial: Arc::new(clinical_trial),
            regulatory: Arc::new(regulatory),
            publication: Arc::new(publication),
        }
    }

    pub fn get(&self, source: EvidenceSource) -> &Arc<MockExtractor> {
        match source {
            EvidenceSource::ClinicalTrial => &self.clinical_trial,
            EvidenceSource::Regulatory => &self.regulatory,
            EvidenceSource::Publication => &self.publication,
        }
    }

    pub fn total_calls(&self) -> usize {
        EvidenceSource::ALL.iter().map(|s| self.get(*s).calls()).sum()
    }

    pub fn extractor_set(&self) -> ExtractorSet {
        ExtractorSet::new(
            self.clinical_trial.clone(),
            self.regulatory.clone(),
            self.publication.clone(),
        )
    }
}

impl Default for MockSources {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw entry with the source's default evidence level.
pub fn raw_entry(source: EvidenceSource, drug_a: &str, drug_b: &str, id: &str, excerpt: &str) -> RawEvidenceEntry {
    RawEvidenceEntry::new(source, drug_a, drug_b, id, excerpt).with_evidence_level(source.default_evidence_level())
}
