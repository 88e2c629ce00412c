//! PubMed E-utilities extractor (publication evidence).
//!
//! Endpoints used:
//!   esearch: https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi (JSON)
//!   efetch:  https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi  (XML)
//!
//! Articles indexed under the "Drug Interactions" MeSH heading are scanned
//! for co-mentioned vocabulary drugs. Co-mention in one sentence scores
//! higher than co-mention across the abstract.

use std::sync::Arc;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use ddimine_common::confidence::{compute_confidence, source_base_confidence, ConfidenceModifiers};
use ddimine_common::error::{DdiError, Result};
use ddimine_common::evidence::{EvidenceLevel, EvidenceSource, RawEvidenceEntry};
use ddimine_common::mining_config::MiningConfig;

use super::http::SourceHttp;
use super::{truncate_excerpt, EvidenceExtractor, SourceCredentials};
use crate::models::ExtractOptions;
use crate::rate_limit::SourceRateLimiter;
use crate::vocabulary::{split_sentences, DrugVocabulary};

const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const TOOL_NAME: &str = "ddimine";
const EXCERPT_CHARS: usize = 500;

pub struct PubMedExtractor {
    http: SourceHttp,
    base_url: String,
    vocabulary: Arc<DrugVocabulary>,
    api_key: Option<SecretString>,
    contact_email: Option<String>,
}

impl PubMedExtractor {
    pub fn new(
        config: &MiningConfig,
        limiter: SourceRateLimiter,
        vocabulary: Arc<DrugVocabulary>,
        credentials: SourceCredentials,
    ) -> Result<Self> {
        Ok(Self {
            http: SourceHttp::new(EvidenceSource::Publication, config, limiter)?,
            base_url: EUTILS_BASE.to_string(),
            vocabulary,
            api_key: credentials.pubmed_api_key,
            contact_email: credentials.contact_email,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn base_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("db", "pubmed".to_string()),
            ("tool", TOOL_NAME.to_string()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.expose_secret().to_string()));
        }
        if let Some(email) = &self.contact_email {
            params.push(("email", email.clone()));
        }
        params
    }

    /// Search PubMed and return matching PMIDs.
    async fn esearch(&self, drug: &str, options: &ExtractOptions) -> Result<Vec<String>> {
        let mut params = self.base_params();
        params.push(("term", search_term(drug)));
        params.push(("retmax", options.max_results.to_string()));
        params.push(("retmode", "json".to_string()));
        if let Some((min, max)) = date_range(options) {
            params.push(("datetype", "pdat".to_string()));
            params.push(("mindate", min));
            params.push(("maxdate", max));
        }

        let url = format!("{}/esearch.fcgi", self.base_url);
        let Some(resp) = self.http.get_json(&url, &params).await? else {
            return Ok(vec![]);
        };
        let ids = parse_esearch_ids(&resp)?;
        debug!(n = ids.len(), "PubMed esearch returned PMIDs");
        Ok(ids)
    }

    async fn efetch(&self, pmids: &[String]) -> Result<Vec<PubMedArticle>> {
        if pmids.is_empty() {
            return Ok(vec![]);
        }
        let mut params = self.base_params();
        params.push(("id", pmids.join(",")));
        params.push(("rettype", "abstract".to_string()));
        params.push(("retmode", "xml".to_string()));

        let url = format!("{}/efetch.fcgi", self.base_url);
        match self.http.get_text(&url, &params).await? {
            Some(xml) => parse_pubmed_xml(&xml),
            None => Ok(vec![]),
        }
    }
}

#[async_trait]
impl EvidenceExtractor for PubMedExtractor {
    fn source(&self) -> EvidenceSource {
        EvidenceSource::Publication
    }

    #[instrument(skip(self, options))]
    async fn extract(&self, drug: &str, options: &ExtractOptions) -> Result<Vec<RawEvidenceEntry>> {
        let pmids = self.esearch(drug, options).await?;
        let articles = self.efetch(&pmids).await?;
        let entries = articles_to_entries(drug, &articles, &self.vocabulary, options);
        debug!(drug, articles = articles.len(), n = entries.len(), "PubMed entries extracted");
        Ok(entries)
    }
}

fn search_term(drug: &str) -> String {
    format!("\"{}\"[tiab] AND \"drug interactions\"[MeSH Terms]", drug.trim())
}

/// E-utilities needs both ends of a date range.
fn date_range(options: &ExtractOptions) -> Option<(String, String)> {
    if options.year_from.is_none() && options.year_to.is_none() {
        return None;
    }
    let min = options.year_from.unwrap_or(1800);
    let max = options.year_to.unwrap_or(3000);
    Some((min.to_string(), max.to_string()))
}

/// PMIDs from an esearch JSON reply. A reply without
/// `esearchresult.idlist` is a parse error.
pub fn parse_esearch_ids(resp: &Value) -> Result<Vec<String>> {
    let result = &resp["esearchresult"];
    if let Some(err) = result["ERROR"].as_str() {
        return Err(DdiError::parse(EvidenceSource::Publication, format!("esearch error: {err}")));
    }
    let ids = result["idlist"].as_array().ok_or_else(|| {
        DdiError::parse(EvidenceSource::Publication, "esearch reply has no `esearchresult.idlist`")
    })?;
    Ok(ids.iter().filter_map(|v| v.as_str().map(String::from)).collect())
}

/// The parts of an efetch article the extractor needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PubMedArticle {
    pub pmid: String,
    pub title: String,
    pub abstract_text: String,
    pub year: Option<i32>,
}

/// Parse efetch XML (`<PubmedArticleSet><PubmedArticle>`). Structured
/// abstracts with several `AbstractText` parts are concatenated.
pub fn parse_pubmed_xml(xml: &str) -> Result<Vec<PubMedArticle>> {
    let mut articles = Vec::new();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut current: Option<PubMedArticle> = None;
    let mut in_citation_pmid = false;
    let mut pmid_seen = false;
    let mut in_title = false;
    let mut in_abstract = false;
    let mut in_pub_date = false;
    let mut in_year = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"PubmedArticle" => {
                    current = Some(PubMedArticle::default());
                    pmid_seen = false;
                }
                // Only the first PMID belongs to the article; later ones are
                // in comments and corrections.
                b"PMID" if !pmid_seen => in_citation_pmid = true,
                b"ArticleTitle" => in_title = true,
                b"AbstractText" => in_abstract = true,
                b"PubDate" => in_pub_date = true,
                b"Year" if in_pub_date => in_year = true,
                _ => {}
            },
            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|err| DdiError::parse(EvidenceSource::Publication, err.to_string()))?
                    .to_string();
                if let Some(ref mut a) = current {
                    if in_citation_pmid { a.pmid = text.clone(); }
                    if in_title { a.title.push_str(&text); }
                    if in_abstract {
                        if !a.abstract_text.is_empty() {
                            a.abstract_text.push(' ');
                        }
                        a.abstract_text.push_str(&text);
                    }
                    if in_year { a.year = text.parse().ok(); }
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"PMID" => {
                    if in_citation_pmid {
                        pmid_seen = true;
                    }
                    in_citation_pmid = false;
                }
                b"ArticleTitle" => in_title = false,
                b"AbstractText" => in_abstract = false,
                b"PubDate" => in_pub_date = false,
                b"Year" => in_year = false,
                b"PubmedArticle" => {
                    if let Some(a) = current.take() {
                        if a.pmid.is_empty() {
                            warn!("Skipping PubMed article without PMID");
                        } else {
                            articles.push(a);
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(DdiError::parse(
                    EvidenceSource::Publication,
                    format!("efetch XML error at {}: {e}", reader.buffer_position()),
                ));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(articles)
}

/// Co-mention scan over parsed articles.
pub fn articles_to_entries(
    drug: &str,
    articles: &[PubMedArticle],
    vocabulary: &DrugVocabulary,
    options: &ExtractOptions,
) -> Vec<RawEvidenceEntry> {
    let target = vocabulary.canonical(drug);
    let base = source_base_confidence(EvidenceSource::Publication);
    let mut entries = Vec::new();

    for article in articles {
        if let Some(year) = article.year {
            if !options.year_in_range(year) {
                continue;
            }
        }
        let text = format!("{}. {}", article.title.trim_end_matches('.'), article.abstract_text);
        let sentences = split_sentences(&text);
        let url = format!("https://pubmed.ncbi.nlm.nih.gov/{}/", article.pmid);

        for partner in vocabulary.mentions(&text) {
            if partner == target {
                continue;
            }
            if entries.len() >= options.max_results {
                return entries;
            }
            let shared = sentences
                .iter()
                .find(|s| vocabulary.mentions_drug(s, &partner) && vocabulary.mentions_drug(s, &target));
            let excerpt = match shared {
                Some(sentence) => sentence.clone(),
                None => article.title.clone(),
            };
            let confidence = compute_confidence(
                base,
                &ConfidenceModifiers { same_sentence: shared.is_some(), ..Default::default() },
            );
            entries.push(
                RawEvidenceEntry::new(
                    EvidenceSource::Publication,
                    &target,
                    partner,
                    &article.pmid,
                    truncate_excerpt(&excerpt, EXCERPT_CHARS),
                )
                .with_evidence_level(EvidenceLevel::C)
                .with_confidence(confidence)
                .with_url(url.clone()),
            );
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const XML: &str = r#"<?xml version="1.0"?>
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation>
      <PMID Version="1">31234567</PMID>
      <Article>
        <Journal><JournalIssue><PubDate><Year>2019</Year><Month>Jun</Month></PubDate></JournalIssue></Journal>
        <ArticleTitle>Bleeding with warfarin &amp; fluconazole co-therapy.</ArticleTitle>
        <Abstract>
          <AbstractText Label="BACKGROUND">Fluconazole inhibits CYP2C9.</AbstractText>
          <AbstractText Label="RESULTS">Warfarin with fluconazole raised INR. Simvastatin was also recorded.</AbstractText>
        </Abstract>
      </Article>
      <CommentsCorrectionsList><CommentsCorrections><PMID>11111111</PMID></CommentsCorrections></CommentsCorrectionsList>
    </MedlineCitation>
  </PubmedArticle>
</PubmedArticleSet>"#;

    #[test]
    fn test_parse_pubmed_xml() {
        let articles = parse_pubmed_xml(XML).unwrap();
        assert_eq!(articles.len(), 1);
        let a = &articles[0];
        assert_eq!(a.pmid, "31234567");
        assert_eq!(a.title, "Bleeding with warfarin & fluconazole co-therapy.");
        assert_eq!(a.year, Some(2019));
        assert!(a.abstract_text.starts_with("Fluconazole inhibits CYP2C9. Warfarin"));
    }

    #[test]
    fn test_same_sentence_scores_higher() {
        let vocab = DrugVocabulary::curated();
        let articles = parse_pubmed_xml(XML).unwrap();
        let entries = articles_to_entries("warfarin", &articles, &vocab, &ExtractOptions::new(10));
        let partners: Vec<&str> = entries.iter().map(|e| e.drug_b.as_str()).collect();
        assert_eq!(partners, vec!["fluconazole", "simvastatin"]);
        assert!(entries[0].confidence_hint > entries[1].confidence_hint);
        assert_eq!(entries[0].url.as_deref(), Some("https://pubmed.ncbi.nlm.nih.gov/31234567/"));
        assert_eq!(entries[1].excerpt, "Bleeding with warfarin & fluconazole co-therapy.");
    }

    #[test]
    fn test_malformed_xml_is_parse_error() {
        let err = parse_pubmed_xml("<PubmedArticleSet><PubmedArticle></Oops>").unwrap_err();
        assert!(matches!(err, DdiError::Parse { .. }));
    }

    #[test]
    fn test_esearch_ids() {
        let resp = json!({ "esearchresult": { "count": "2", "idlist": ["31234567", "30000001"] } });
        assert_eq!(parse_esearch_ids(&resp).unwrap(), vec!["31234567", "30000001"]);
        let none = json!({ "esearchresult": { "count": "0", "idlist": [] } });
        assert!(parse_esearch_ids(&none).unwrap().is_empty());
    }

    #[test]
    fn test_esearch_without_idlist_is_parse_error() {
        let err = parse_esearch_ids(&json!({ "header": { "type": "esearch" } })).unwrap_err();
        assert!(matches!(err, DdiError::Parse { origin: EvidenceSource::Publication, .. }));
        let err = parse_esearch_ids(&json!({ "esearchresult": { "ERROR": "Invalid query" } })).unwrap_err();
        assert!(err.to_string().contains("Invalid query"));
    }

    #[test]
    fn test_search_term_and_dates() {
        assert_eq!(
            search_term(" warfarin "),
            "\"warfarin\"[tiab] AND \"drug interactions\"[MeSH Terms]"
        );
        let opts = ExtractOptions { max_results: 5, year_from: Some(2015), year_to: None };
        assert_eq!(date_range(&opts), Some(("2015".into(), "3000".into())));
        assert_eq!(date_range(&ExtractOptions::new(5)), None);
    }
}
