//! Evidence source extractors.
//!
//! One extractor per external source, all behind [`EvidenceExtractor`].
//! Each owns its HTTP client and rate limiter; nothing mutable is shared
//! between them.

pub mod http;
pub mod clinicaltrials;
pub mod openfda;
pub mod pubmed;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use ddimine_common::error::Result;
use ddimine_common::evidence::{EvidenceSource, RawEvidenceEntry};
use ddimine_common::mining_config::MiningConfig;

use crate::models::ExtractOptions;
use crate::rate_limit::RateLimiters;
use crate::vocabulary::DrugVocabulary;

pub use clinicaltrials::ClinicalTrialsExtractor;
pub use openfda::OpenFdaLabelExtractor;
pub use pubmed::PubMedExtractor;

/// Common interface for all evidence extractors.
#[async_trait]
pub trait EvidenceExtractor: Send + Sync {
    /// The single source this extractor queries.
    fn source(&self) -> EvidenceSource;

    /// Fetch raw evidence mentioning `drug`. An empty upstream result is
    /// `Ok(vec![])`; only transport and parse failures are errors.
    async fn extract(
        &self,
        drug: &str,
        options: &ExtractOptions,
    ) -> Result<Vec<RawEvidenceEntry>>;
}

/// Optional credentials for the live sources.
#[derive(Debug, Default)]
pub struct SourceCredentials {
    pub pubmed_api_key: Option<SecretString>,
    /// Sent to NCBI as the `email` parameter.
    pub contact_email: Option<String>,
}

/// Exactly one extractor per evidence source.
#[derive(Clone)]
pub struct ExtractorSet {
    clinical_trial: Arc<dyn EvidenceExtractor>,
    regulatory: Arc<dyn EvidenceExtractor>,
    publication: Arc<dyn EvidenceExtractor>,
}

impl ExtractorSet {
    pub fn new(
        clinical_trial: Arc<dyn EvidenceExtractor>,
        regulatory: Arc<dyn EvidenceExtractor>,
        publication: Arc<dyn EvidenceExtractor>,
    ) -> Self {
        Self { clinical_trial, regulatory, publication }
    }

    /// Extractors for the live public APIs. Rate limits are fixed from
    /// `config` at construction time.
    pub fn live(
        config: &MiningConfig,
        vocabulary: Arc<DrugVocabulary>,
        credentials: SourceCredentials,
    ) -> Result<Self> {
        let limiters = RateLimiters::from_config(config);
        let clinical_trial = ClinicalTrialsExtractor::new(
            config,
            limiters.for_source(EvidenceSource::ClinicalTrial),
            vocabulary.clone(),
        )?;
        let regulatory = OpenFdaLabelExtractor::new(
            config,
            limiters.for_source(EvidenceSource::Regulatory),
            vocabulary.clone(),
        )?;
        let publication = PubMedExtractor::new(
            config,
            limiters.for_source(EvidenceSource::Publication),
            vocabulary,
            credentials,
        )?;
        Ok(Self::new(
            Arc::new(clinical_trial),
            Arc::new(regulatory),
            Arc::new(publication),
        ))
    }

    pub fn get(&self, source: EvidenceSource) -> Arc<dyn EvidenceExtractor> {
        match source {
            EvidenceSource::ClinicalTrial => self.clinical_trial.clone(),
            EvidenceSource::Regulatory    => self.regulatory.clone(),
            EvidenceSource::Publication   => self.publication.clone(),
        }
    }
}

impl std::fmt::Debug for ExtractorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorSet")
            .field("clinical_trial", &self.clinical_trial.source())
            .field("regulatory", &self.regulatory.source())
            .field("publication", &self.publication.source())
            .finish()
    }
}

/// Cut `text` to at most `max_chars` characters on a char boundary,
/// appending an ellipsis when shortened.
pub(crate) fn truncate_excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_excerpt_respects_char_boundaries() {
        assert_eq!(truncate_excerpt("  short  ", 10), "short");
        assert_eq!(truncate_excerpt("abcdéfgh", 5), "abcdé…");
    }
}
