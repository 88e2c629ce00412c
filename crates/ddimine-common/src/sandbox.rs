use reqwest::{Client, ClientBuilder};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;
use crate::error::DdiError;

const USER_AGENT: &str = concat!("ddimine/", env!("CARGO_PKG_VERSION"), " (evidence mining)");

/// An HTTP client capped to the evidence hosts ddimine is allowed to reach.
#[derive(Debug, Clone)]
pub struct SandboxClient {
    client: Client,
    allowlist: HashSet<String>,
}

impl SandboxClient {
    /// Creates a new SandboxClient with the default allowlist of evidence sources.
    pub fn new(timeout: Duration) -> Result<Self, DdiError> {
        let mut allowlist = HashSet::new();
        let domains = [
            "clinicaltrials.gov",      // ClinicalTrials.gov v2
            "api.fda.gov",             // openFDA drug labels
            "eutils.ncbi.nlm.nih.gov", // PubMed E-utilities
            "localhost",               // local mirrors and test servers
            "127.0.0.1",
        ];

        for d in domains {
            allowlist.insert(d.to_string());
        }

        let client = ClientBuilder::new()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DdiError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, allowlist })
    }

    /// Appends an exact hostname to the allowlist.
    pub fn allow_domain(&mut self, domain: &str) {
        self.allowlist.insert(domain.to_string());
    }

    /// Validates if a URL is permitted under the current sandbox policy.
    pub fn is_allowed(&self, url: &str) -> bool {
        if let Ok(parsed) = Url::parse(url) {
            if let Some(host) = parsed.host_str() {
                // Check exact match or if it's a subdomain of an allowed domain
                for allowed in &self.allowlist {
                    if host == allowed || host.ends_with(&format!(".{}", allowed)) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Exposes the inner `reqwest::Client` builder pattern safely for GET requests.
    pub fn get(&self, url: &str) -> Result<reqwest::RequestBuilder, DdiError> {
        if !self.is_allowed(url) {
            return Err(DdiError::Security(format!(
                "domain not in allowlist for URL {}",
                url
            )));
        }

        Ok(self.client.get(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evidence_hosts_allowed() {
        let client = SandboxClient::new(Duration::from_secs(5)).unwrap();
        assert!(client.is_allowed("https://clinicaltrials.gov/api/v2/studies"));
        assert!(client.is_allowed("https://api.fda.gov/drug/label.json"));
        assert!(client.is_allowed("https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi"));
    }

    #[test]
    fn test_foreign_host_rejected() {
        let client = SandboxClient::new(Duration::from_secs(5)).unwrap();
        assert!(!client.is_allowed("https://example.com/"));
        assert!(!client.is_allowed("not a url"));
        let err = client.get("https://evil.example.org/x").unwrap_err();
        assert!(matches!(err, DdiError::Security(_)));
    }

    #[test]
    fn test_allow_domain_extends_policy() {
        let mut client = SandboxClient::new(Duration::from_secs(5)).unwrap();
        client.allow_domain("mirror.internal");
        assert!(client.is_allowed("http://api.mirror.internal/studies"));
    }
}
