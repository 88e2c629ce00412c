//! Outbound request budgets.
//!
//! Each extractor owns a direct governor limiter sized from
//! `SourceRateConfig`; an optional session-wide limiter is shared by all
//! three so the combined rate never exceeds `global_requests_per_second`.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;

use ddimine_common::evidence::EvidenceSource;
use ddimine_common::mining_config::MiningConfig;

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

fn quota_for(requests_per_second: u32) -> Quota {
    let rps = NonZeroU32::new(requests_per_second).unwrap_or(nonzero!(1u32));
    Quota::per_second(rps)
}

/// Per-source limiter, optionally chained to a shared global limiter.
#[derive(Clone)]
pub struct SourceRateLimiter {
    local: Arc<DirectRateLimiter>,
    global: Option<Arc<DirectRateLimiter>>,
}

impl SourceRateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        Self {
            local: Arc::new(RateLimiter::direct(quota_for(requests_per_second))),
            global: None,
        }
    }

    pub fn with_global(mut self, global: Arc<DirectRateLimiter>) -> Self {
        self.global = Some(global);
        self
    }

    /// Effectively unthrottled limiter for tests and local mirrors.
    pub fn unlimited() -> Self {
        Self::new(10_000)
    }

    /// Wait until both the source budget and the session budget allow
    /// one more request.
    pub async fn until_ready(&self) {
        self.local.until_ready().await;
        if let Some(global) = &self.global {
            global.until_ready().await;
        }
    }

    /// Non-blocking check; consumes a permit when it succeeds.
    pub fn try_acquire(&self) -> bool {
        if self.local.check().is_err() {
            return false;
        }
        match &self.global {
            Some(global) => global.check().is_ok(),
            None => true,
        }
    }
}

impl std::fmt::Debug for SourceRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRateLimiter")
            .field("global", &self.global.is_some())
            .finish()
    }
}

/// The three source limiters built from one config snapshot.
#[derive(Debug, Clone)]
pub struct RateLimiters {
    pub clinical_trial: SourceRateLimiter,
    pub regulatory: SourceRateLimiter,
    pub publication: SourceRateLimiter,
}

impl RateLimiters {
    pub fn from_config(config: &MiningConfig) -> Self {
        let global = config
            .global_requests_per_second
            .map(|rps| Arc::new(RateLimiter::direct(quota_for(rps))));
        let build = |source: EvidenceSource| {
            let limiter = SourceRateLimiter::new(config.sources.for_source(source));
            match &global {
                Some(g) => limiter.with_global(g.clone()),
                None => limiter,
            }
        };
        Self {
            clinical_trial: build(EvidenceSource::ClinicalTrial),
            regulatory: build(EvidenceSource::Regulatory),
            publication: build(EvidenceSource::Publication),
        }
    }

    pub fn for_source(&self, source: EvidenceSource) -> SourceRateLimiter {
        match source {
            EvidenceSource::ClinicalTrial => self.clinical_trial.clone(),
            EvidenceSource::Regulatory    => self.regulatory.clone(),
            EvidenceSource::Publication   => self.publication.clone(),
        }
    }
}
