use thiserror::Error;
use uuid::Uuid;

use crate::evidence::{EvidenceSource, ValidationReason};

#[derive(Debug, Error)]
pub enum DdiError {
    /// Network failure or non-success status from an upstream source.
    #[error("{origin} transport error: {message}")]
    Transport {
        origin: EvidenceSource,
        message: String,
        status: Option<u16>,
        retryable: bool,
    },

    /// Malformed or unexpected upstream payload.
    #[error("{origin} payload parse error: {message}")]
    Parse {
        origin: EvidenceSource,
        message: String,
    },

    #[error("{origin} timed out after {after_ms}ms")]
    Timeout {
        origin: EvidenceSource,
        after_ms: u64,
    },

    #[error("validation failed ({reason}): {message}")]
    Validation {
        reason: ValidationReason,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("capacity exceeded: {requested} requested, limit is {limit}")]
    Capacity { requested: usize, limit: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("job {job_id} is still running")]
    Busy { job_id: Uuid },

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("every evidence source failed for {drug}")]
    AllSourcesFailed { drug: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("Security error: {0}")]
    Security(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Export error: {0}")]
    Export(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DdiError {
    /// Map a reqwest failure for `origin` into a transport error.
    pub fn transport(origin: EvidenceSource, err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let retryable = err.is_timeout()
            || err.is_connect()
            || err.is_request()
            || status.map(is_retryable_status).unwrap_or(false);
        DdiError::Transport {
            origin,
            message: err.to_string(),
            status,
            retryable,
        }
    }

    pub fn parse(origin: EvidenceSource, message: impl Into<String>) -> Self {
        DdiError::Parse { origin, message: message.into() }
    }

    /// Whether an extractor may retry the call that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DdiError::Transport { retryable: true, .. })
    }

    /// Short machine-readable code, recorded in job error logs.
    pub fn code(&self) -> &'static str {
        match self {
            DdiError::Transport { .. }        => "transport",
            DdiError::Parse { .. }            => "parse",
            DdiError::Timeout { .. }          => "timeout",
            DdiError::Validation { .. }       => "validation",
            DdiError::Config(_)               => "config",
            DdiError::Capacity { .. }         => "capacity",
            DdiError::InvalidRequest(_)       => "invalid_request",
            DdiError::Busy { .. }             => "busy",
            DdiError::JobNotFound(_)          => "job_not_found",
            DdiError::AllSourcesFailed { .. } => "all_sources_failed",
            DdiError::Cancelled               => "cancelled",
            DdiError::Security(_)             => "security",
            DdiError::Serialization(_)        => "serialization",
            DdiError::Export(_)               => "export",
            DdiError::Other(_)                => "internal",
        }
    }
}

/// 429 and 5xx are worth another attempt; other statuses are not.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

pub type Result<T> = std::result::Result<T, DdiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(400));
    }

    #[test]
    fn test_only_retryable_transport_is_retryable() {
        let transient = DdiError::Transport {
            origin: EvidenceSource::Publication,
            message: "502".into(),
            status: Some(502),
            retryable: true,
        };
        let parse = DdiError::parse(EvidenceSource::Publication, "bad xml");
        assert!(transient.is_retryable());
        assert!(!parse.is_retryable());
        assert_eq!(parse.code(), "parse");
    }

    #[test]
    fn test_capacity_message() {
        let err = DdiError::Capacity { requested: 51, limit: 50 };
        assert_eq!(err.to_string(), "capacity exceeded: 51 requested, limit is 50");
    }
}
