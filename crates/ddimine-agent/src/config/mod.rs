//! Configuration loading for the ddimine binary.
//! Reads ddimine.toml from the current directory or the path in DDIMINE_CONFIG.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use ddimine_common::mining_config::MiningConfig;
use ddimine_ingestion::sources::SourceCredentials;

pub const CONFIG_ENV: &str = "DDIMINE_CONFIG";
pub const PUBMED_KEY_ENV: &str = "DDIMINE_PUBMED_API_KEY";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Clone, Default, Deserialize)]
pub struct SourcesConfig {
    /// NCBI E-utilities key; raises the PubMed rate ceiling.
    #[serde(default)]
    pub pubmed_api_key: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
}

impl fmt::Debug for SourcesConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourcesConfig")
            .field("pubmed_api_key", &self.pubmed_api_key.as_ref().map(|_| "[redacted]"))
            .field("contact_email", &self.contact_email)
            .finish()
    }
}


impl Config {
    /// Load configuration from ddimine.toml.
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "ddimine.toml".to_string());

        let mut config = if Path::new(&path).exists() {
            let content = std::fs::read_to_string(&path)?;
            Self::from_toml(&content)?
        } else {
            tracing::warn!(path = %path, "config file not found, using defaults");
            Self::default()
        };

        if let Ok(key) = std::env::var(PUBMED_KEY_ENV) {
            if !key.trim().is_empty() {
                config.sources.pubmed_api_key = Some(key);
            }
        }
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.mining.validate()?;
        Ok(config)
    }

    pub fn credentials(&self) -> SourceCredentials {
        SourceCredentials {
            pubmed_api_key: self
                .sources
                .pubmed_api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .map(Into::into),
            contact_email: self.sources.contact_email.clone(),
        }
    }
}
