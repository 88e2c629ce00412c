//! Mining orchestrator.
//!
//! Flow for one job:
//!   1. Validate the request against the current config (capacity, options)
//!   2. Claim the progress tracker (one job at a time)
//!   3. Mine drugs on a bounded worker pool (`max_concurrent_drugs`)
//!   4. Per drug: fan out to the three extractors through the cache, each
//!      call bounded by `extractor_timeout_ms` and the job's cancel token
//!   5. Normalise the union of raw entries and merge into the result table
//!   6. Emit lifecycle events via a broadcast channel
//!
//! A failing source degrades a drug; a failing drug degrades the job.
//! Neither aborts the job.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use ddimine_common::error::{DdiError, Result};
use ddimine_common::evidence::{EvidenceSource, NormalizedEvidence};
use ddimine_common::mining_config::MiningConfig;

use crate::cache::{CacheLookup, CacheStats, EvidenceCache};
use crate::export::{self, ExportFormat, ExportLimits, ExportOutput};
use crate::lock;
use crate::models::{
    DiagnosticReport, DrugStatus, ExtractOptions, JobAccepted, JobError, JobStatus, MiningEvent,
    MiningJob, MiningOptions, MiningReports,
};
use crate::normalise::{EvidenceTable, NormalizationService, ValidationOutcome};
use crate::progress::{ProgressSnapshot, ProgressState, ProgressTracker};
use crate::sources::ExtractorSet;
use crate::vocabulary::{DrugVocabulary, IndicationLookup, StaticIndicationLookup};

const EVENT_CAPACITY: usize = 256;

// ── Builder ───────────────────────────────────────────────────────────────────

pub struct OrchestratorBuilder {
    config: MiningConfig,
    extractors: Option<ExtractorSet>,
    vocabulary: Option<Arc<DrugVocabulary>>,
    indications: Option<Arc<dyn IndicationLookup>>,
}

impl OrchestratorBuilder {
    pub fn extractors(mut self, extractors: ExtractorSet) -> Self {
        self.extractors = Some(extractors);
        self
    }

    pub fn vocabulary(mut self, vocabulary: Arc<DrugVocabulary>) -> Self {
        self.vocabulary = Some(vocabulary);
        self
    }

    pub fn indication_lookup(mut self, lookup: Arc<dyn IndicationLookup>) -> Self {
        self.indications = Some(lookup);
        self
    }

    /// Validate the config and assemble the orchestrator. Extractors are
    /// required; vocabulary and indication lookup default to the built-ins.
    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        let extractors = self
            .extractors
            .ok_or_else(|| DdiError::Config("an ExtractorSet is required".to_string()))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Inner {
            config: RwLock::new(self.config),
            extractors,
            vocabulary: self.vocabulary.unwrap_or_else(|| Arc::new(DrugVocabulary::curated())),
            indications: self
                .indications
                .unwrap_or_else(|| Arc::new(StaticIndicationLookup::builtin())),
            cache: EvidenceCache::new(),
            tracker: ProgressTracker::new(),
            results: Mutex::new(EvidenceTable::new()),
            reports: Mutex::new(MiningReports::default()),
            jobs: Mutex::new(HashMap::new()),
            cancel: Mutex::new(CancellationToken::new()),
            events,
        };
        Ok(Orchestrator { inner: Arc::new(inner) })
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

struct JobEntry {
    job: MiningJob,
    handle: Option<JoinHandle<MiningJob>>,
}

struct Inner {
    config: RwLock<MiningConfig>,
    extractors: ExtractorSet,
    vocabulary: Arc<DrugVocabulary>,
    indications: Arc<dyn IndicationLookup>,
    cache: EvidenceCache,
    tracker: ProgressTracker,
    results: Mutex<EvidenceTable>,
    reports: Mutex<MiningReports>,
    jobs: Mutex<HashMap<Uuid, JobEntry>>,
    cancel: Mutex<CancellationToken>,
    events: broadcast::Sender<MiningEvent>,
}

/// Long-lived mining session. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

/// A job that passed validation and holds the tracker.
struct PreparedJob {
    job: MiningJob,
    options: MiningOptions,
    token: CancellationToken,
    config: Arc<MiningConfig>,
}

struct DrugOutcome {
    status: DrugStatus,
    records: usize,
    errors: Vec<JobError>,
}

impl DrugOutcome {
    fn cancelled() -> Self {
        Self { status: DrugStatus::Cancelled, records: 0, errors: Vec::new() }
    }
}

impl Orchestrator {
    pub fn builder(config: MiningConfig) -> OrchestratorBuilder {
        OrchestratorBuilder { config, extractors: None, vocabulary: None, indications: None }
    }

    // ── Mining entry points ──────────────────────────────────────────────────

    /// Mine one drug inline and return the accumulated records involving it.
    /// Fails with `AllSourcesFailed` when no source answered.
    #[instrument(skip(self, options))]
    pub async fn mine_single_drug(&self, name: &str, options: MiningOptions) -> Result<Vec<NormalizedEvidence>> {
        let prepared = self.prepare_job(vec![name.to_string()], options, true)?;
        let drug = prepared.job.drugs[0].clone();
        let job = Inner::run_job(self.inner.clone(), prepared).await;

        match job.drug_status.get(&drug) {
            Some(DrugStatus::Failed) => Err(DdiError::AllSourcesFailed { drug }),
            Some(DrugStatus::Cancelled) => Err(DdiError::Cancelled),
            _ => Ok(lock(&self.inner.results).for_drug(&drug)),
        }
    }

    /// Start a background job for `names`. Rejected synchronously with
    /// `Capacity` when the list exceeds `max_batch_size`; no job is created.
    #[instrument(skip(self, names, options), fields(n = names.len()))]
    pub fn mine_multiple_drugs(&self, names: Vec<String>, options: MiningOptions) -> Result<JobAccepted> {
        let prepared = self.prepare_job(names, options, true)?;
        Ok(self.spawn_job(prepared, Vec::new()))
    }

    /// Same job as `mine_multiple_drugs`, awaited inline.
    pub async fn run_multiple_drugs(&self, names: Vec<String>, options: MiningOptions) -> Result<MiningJob> {
        let prepared = self.prepare_job(names, options, true)?;
        Ok(Inner::run_job(self.inner.clone(), prepared).await)
    }

    /// Mine the whole curated vocabulary in the background. The list is
    /// processed in `max_batch_size` batches, so the capacity limit does
    /// not apply.
    #[instrument(skip(self, options))]
    pub fn mine_all_known_drugs(&self, options: MiningOptions) -> Result<JobAccepted> {
        let drugs = self.inner.vocabulary.generic_names();
        let prepared = self.prepare_job(drugs, options, false)?;
        Ok(self.spawn_job(prepared, Vec::new()))
    }

    /// Expand indications to drugs, then mine them as a background job.
    /// Indications with no known drugs are reported back, not rejected.
    #[instrument(skip(self, indications, options), fields(n = indications.len()))]
    pub async fn mine_by_indications(&self, indications: Vec<String>, options: MiningOptions) -> Result<JobAccepted> {
        if indications.iter().all(|i| i.trim().is_empty()) {
            return Err(DdiError::InvalidRequest("no indications given".to_string()));
        }
        let mut drugs = Vec::new();
        let mut unresolved = Vec::new();
        for indication in indications.iter().filter(|i| !i.trim().is_empty()) {
            let found = self.inner.indications.drugs_for(indication).await;
            if found.is_empty() {
                unresolved.push(indication.clone());
            }
            drugs.extend(found);
        }
        if drugs.is_empty() {
            return Err(DdiError::InvalidRequest(format!(
                "no drugs known for indications: {}",
                unresolved.join(", ")
            )));
        }
        let drugs = self.dedup_drugs(drugs);
        let prepared = self.prepare_job(drugs, options, true)?;
        Ok(self.spawn_job(prepared, unresolved))
    }

    // ── Jobs ─────────────────────────────────────────────────────────────────

    pub fn get_job(&self, id: Uuid) -> Result<MiningJob> {
        lock(&self.inner.jobs)
            .get(&id)
            .map(|e| e.job.clone())
            .ok_or(DdiError::JobNotFound(id))
    }

    /// All known jobs, oldest first.
    pub fn list_jobs(&self) -> Vec<MiningJob> {
        let mut jobs: Vec<MiningJob> = lock(&self.inner.jobs).values().map(|e| e.job.clone()).collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    /// Wait for a background job to reach a terminal state.
    pub async fn wait_for_job(&self, id: Uuid) -> Result<MiningJob> {
        let mut events = self.subscribe();
        let handle = {
            let mut jobs = lock(&self.inner.jobs);
            let entry = jobs.get_mut(&id).ok_or(DdiError::JobNotFound(id))?;
            if entry.job.status.is_terminal() {
                return Ok(entry.job.clone());
            }
            entry.handle.take()
        };

        match handle {
            Some(handle) => match handle.await {
                Ok(job) => Ok(job),
                Err(e) => {
                    let err = DdiError::Other(anyhow::anyhow!("job task failed: {e}"));
                    self.inner.mark_job_failed(id, &err);
                    self.get_job(id)
                }
            },
            // Someone else holds the handle; follow the event stream.
            None => loop {
                let job = self.get_job(id)?;
                if job.status.is_terminal() {
                    return Ok(job);
                }
                match events.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return self.get_job(id),
                }
            },
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn get_progress(&self) -> ProgressSnapshot {
        self.inner.tracker.snapshot()
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn get_results(&self) -> Vec<NormalizedEvidence> {
        lock(&self.inner.results).records()
    }

    pub fn get_reports(&self) -> MiningReports {
        lock(&self.inner.reports).clone()
    }

    pub fn export_results(&self, format: ExportFormat) -> Result<ExportOutput> {
        let records = self.get_results();
        let limits = ExportLimits { max_bytes: self.get_config().max_export_bytes };
        let output = export::export(&records, format, limits)?;
        if output.truncated {
            warn!(
                format = %format,
                exported = output.record_count,
                total = output.total_records,
                "export truncated to max_export_bytes"
            );
        }
        Ok(output)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MiningEvent> {
        self.inner.events.subscribe()
    }

    // ── Control ──────────────────────────────────────────────────────────────

    /// Cancel the running job, if any. In-flight extractor calls are aborted.
    /// Returns whether a job was running.
    pub fn stop(&self) -> bool {
        let running = self.inner.tracker.is_running();
        lock(&self.inner.cancel).cancel();
        if running {
            info!("mining job stop requested");
        }
        running
    }

    /// Stop, then clear results, progress and reports. Cache and job
    /// history are kept.
    pub fn reset(&self) {
        self.stop();
        let mut results = lock(&self.inner.results);
        self.inner.tracker.reset();
        results.clear();
        *lock(&self.inner.reports) = MiningReports::default();
        info!("orchestrator state reset");
    }

    pub fn clear_caches(&self) {
        self.inner.cache.clear();
        info!("evidence cache cleared");
    }

    // ── Configuration ────────────────────────────────────────────────────────

    pub fn get_config(&self) -> MiningConfig {
        self.inner.config.read().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Replace the config after validating it; on error the previous
    /// config stays in force. Rate limits keep the values the extractors
    /// were built with.
    pub fn update_config(&self, config: MiningConfig) -> Result<()> {
        config.validate()?;
        *self.inner.config.write().unwrap_or_else(std::sync::PoisonError::into_inner) = config;
        info!("mining config updated");
        Ok(())
    }

    pub fn validate_config(&self) -> Result<()> {
        self.get_config().validate()
    }

    // ── Diagnostics ──────────────────────────────────────────────────────────

    /// Run one extractor in isolation, bypassing cache and progress.
    #[instrument(skip(self, options))]
    pub async fn diagnose_extractor(
        &self,
        source: EvidenceSource,
        drug: &str,
        options: MiningOptions,
    ) -> Result<DiagnosticReport> {
        options.validate()?;
        let drug = self.inner.vocabulary.canonical(drug);
        if drug.is_empty() {
            return Err(DdiError::InvalidRequest("drug name is blank".to_string()));
        }
        let config = self.get_config();
        let extract_opts = options.extract_options(config.max_results_per_extractor);
        let extractor = self.inner.extractors.get(source);

        let started = Instant::now();
        let result = match tokio::time::timeout(config.extractor_timeout(), extractor.extract(&drug, &extract_opts)).await {
            Ok(r) => r,
            Err(_) => Err(DdiError::Timeout { origin: source, after_ms: config.extractor_timeout_ms }),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        Ok(match result {
            Ok(entries) => DiagnosticReport {
                source,
                drug,
                elapsed_ms,
                entry_count: entries.len(),
                entries,
                error: None,
                error_code: None,
            },
            Err(e) => DiagnosticReport {
                source,
                drug,
                elapsed_ms,
                entry_count: 0,
                entries: Vec::new(),
                error: Some(e.to_string()),
                error_code: Some(e.code().to_string()),
            },
        })
    }

    /// Validate externally supplied records against the evidence schema.
    pub fn validate_evidence(&self, document: &Value) -> Result<ValidationOutcome> {
        NormalizationService::from_config(&self.get_config()).validate(document)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn dedup_drugs(&self, names: Vec<String>) -> Vec<String> {
        let mut seen = HashSet::new();
        names
            .into_iter()
            .map(|n| self.inner.vocabulary.canonical(&n))
            .filter(|n| !n.is_empty() && seen.insert(n.clone()))
            .collect()
    }

    fn prepare_job(&self, names: Vec<String>, options: MiningOptions, enforce_capacity: bool) -> Result<PreparedJob> {
        options.validate()?;
        let config = self.get_config();
        if enforce_capacity && names.len() > config.max_batch_size {
            return Err(DdiError::Capacity { requested: names.len(), limit: config.max_batch_size });
        }
        let drugs = self.dedup_drugs(names);
        if drugs.is_empty() {
            return Err(DdiError::InvalidRequest("no drug names given".to_string()));
        }

        let mut job = MiningJob::new(drugs);
        self.inner.tracker.try_begin(job.id, &job.drugs, config.max_concurrent_drugs)?;

        let token = {
            let mut cancel = lock(&self.inner.cancel);
            *cancel = CancellationToken::new();
            cancel.clone()
        };
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        lock(&self.inner.jobs).insert(job.id, JobEntry { job: job.clone(), handle: None });
        self.inner.emit(MiningEvent::JobStarted { job_id: job.id, total_drugs: job.drugs.len() });
        info!(job_id = %job.id, drugs = job.drugs.len(), "mining job started");

        Ok(PreparedJob { job, options, token, config: Arc::new(config) })
    }

    fn spawn_job(&self, prepared: PreparedJob, unresolved_indications: Vec<String>) -> JobAccepted {
        let accepted = JobAccepted {
            job_id: prepared.job.id,
            total_drugs: prepared.job.drugs.len(),
            accepted_at: Utc::now(),
            unresolved_indications,
        };
        let handle = tokio::spawn(Inner::run_job(self.inner.clone(), prepared));
        if let Some(entry) = lock(&self.inner.jobs).get_mut(&accepted.job_id) {
            entry.handle = Some(handle);
        }
        accepted
    }
}

impl Inner {
    fn emit(&self, event: MiningEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn store_job(&self, job: &MiningJob) {
        if let Some(entry) = lock(&self.jobs).get_mut(&job.id) {
            entry.job = job.clone();
        }
    }

    fn mark_job_failed(&self, id: Uuid, err: &DdiError) {
        warn!(job_id = %id, error = %err, "mining job aborted");
        if let Some(entry) = lock(&self.jobs).get_mut(&id) {
            entry.job.status = JobStatus::Failed;
            entry.job.finished_at = Some(Utc::now());
            entry.job.errors.push(JobError::from_error(None, None, err));
        }
        self.tracker.finish(id, ProgressState::Failed);
        self.emit(MiningEvent::JobFinished { job_id: id, status: JobStatus::Failed });
    }

    async fn run_job(inner: Arc<Inner>, prepared: PreparedJob) -> MiningJob {
        let PreparedJob { mut job, options, token, config } = prepared;
        let job_id = job.id;
        let extract_opts = options.extract_options(config.max_results_per_extractor);

        for batch in job.drugs.clone().chunks(config.max_batch_size) {
            let mut outcomes = stream::iter(batch.to_vec())
                .map(|drug| {
                    let worker = tokio::spawn(Inner::mine_drug(
                        inner.clone(),
                        job_id,
                        drug.clone(),
                        extract_opts.clone(),
                        options.force_refresh,
                        token.clone(),
                        config.clone(),
                    ));
                    async move { (drug, worker.await) }
                })
                .buffer_unordered(config.max_concurrent_drugs);

            while let Some((drug, joined)) = outcomes.next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let err = DdiError::Other(anyhow::anyhow!("worker for {drug} failed: {e}"));
                        warn!(job_id = %job_id, drug = %drug, error = %err, "drug worker failed");
                        let job_err = JobError::from_error(Some(&drug), None, &err);
                        inner.tracker.record_error(job_id, job_err.clone());
                        DrugOutcome { status: DrugStatus::Failed, records: 0, errors: vec![job_err] }
                    }
                };
                inner.tracker.drug_finished(job_id, &drug, outcome.status);
                job.drug_status.insert(drug.clone(), outcome.status);
                job.errors.extend(outcome.errors);
                job.records_produced += outcome.records;
                inner.emit(MiningEvent::DrugCompleted {
                    job_id,
                    drug,
                    status: outcome.status,
                    records: outcome.records,
                });
            }
        }

        job.status = if token.is_cancelled() {
            for status in job.drug_status.values_mut().filter(|s| !s.is_finished()) {
                *status = DrugStatus::Cancelled;
            }
            JobStatus::Cancelled
        } else {
            JobStatus::from_outcomes(
                job.count(DrugStatus::Succeeded),
                job.count(DrugStatus::Degraded),
                job.count(DrugStatus::Failed) + job.count(DrugStatus::Cancelled),
            )
        };
        job.finished_at = Some(Utc::now());

        inner.tracker.finish(job_id, job.status.into());
        inner.store_job(&job);
        inner.emit(MiningEvent::JobFinished { job_id, status: job.status });
        info!(
            job_id = %job_id,
            status = job.status.as_str(),
            records = job.records_produced,
            errors = job.errors.len(),
            "mining job finished"
        );
        job
    }

    async fn mine_drug(
        inner: Arc<Inner>,
        job_id: Uuid,
        drug: String,
        options: ExtractOptions,
        force_refresh: bool,
        token: CancellationToken,
        config: Arc<MiningConfig>,
    ) -> DrugOutcome {
        if token.is_cancelled() {
            return DrugOutcome::cancelled();
        }
        inner.tracker.drug_started(job_id, &drug);

        let calls = EvidenceSource::ALL
            .iter()
            .map(|&source| inner.fetch_source(&drug, source, &options, force_refresh, &token, &config));
        let results = futures::future::join_all(calls).await;

        let mut raw = Vec::new();
        let mut errors = Vec::new();
        let mut answered = 0;
        for (source, result) in results {
            match result {
                Ok(lookup) => {
                    let hit = lookup.is_hit();
                    let entries = lookup.into_entries();
                    lock(&inner.reports).extraction.record_success(source, entries.len(), hit);
                    inner.tracker.record_source(job_id, source, entries.len());
                    raw.extend(entries);
                    answered += 1;
                }
                Err(DdiError::Cancelled) => {}
                Err(e) => {
                    warn!(drug = %drug, source = %source, error = %e, "extractor failed");
                    lock(&inner.reports).extraction.record_failure(source, &e);
                    let job_err = JobError::from_error(Some(&drug), Some(source), &e);
                    inner.tracker.record_error(job_id, job_err.clone());
                    errors.push(job_err);
                }
            }
        }

        if token.is_cancelled() {
            return DrugOutcome { status: DrugStatus::Cancelled, records: 0, errors };
        }
        if answered == 0 {
            let err = DdiError::AllSourcesFailed { drug: drug.clone() };
            errors.push(JobError::from_error(Some(&drug), None, &err));
            return DrugOutcome { status: DrugStatus::Failed, records: 0, errors };
        }

        let normalizer = NormalizationService::from_config(&config);
        let (records, report) = normalizer.normalize(&raw);
        let produced = records.len();
        {
            let mut table = lock(&inner.results);
            // A reset after this point must not see late records.
            if token.is_cancelled() {
                return DrugOutcome { status: DrugStatus::Cancelled, records: 0, errors };
            }
            normalizer.merge_into(&mut table, records);
        }
        lock(&inner.reports).normalization.absorb(&report);

        let status = if errors.is_empty() { DrugStatus::Succeeded } else { DrugStatus::Degraded };
        debug!(drug = %drug, records = produced, ?status, "drug mined");
        DrugOutcome { status, records: produced, errors }
    }

    async fn fetch_source(
        &self,
        drug: &str,
        source: EvidenceSource,
        options: &ExtractOptions,
        force_refresh: bool,
        token: &CancellationToken,
        config: &MiningConfig,
    ) -> (EvidenceSource, Result<CacheLookup>) {
        let extractor = self.extractors.get(source);
        let timeout = config.extractor_timeout();
        let after_ms = config.extractor_timeout_ms;
        let token = token.clone();

        let fetch = move || async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(DdiError::Cancelled),
                result = tokio::time::timeout(timeout, extractor.extract(drug, options)) => match result {
                    Ok(r) => r,
                    Err(_) => Err(DdiError::Timeout { origin: source, after_ms }),
                },
            }
        };

        let ttl = config.cache_ttl();
        let result = if force_refresh {
            match fetch().await {
                Ok(entries) => {
                    self.cache.put(drug, source, entries.clone(), ttl);
                    Ok(CacheLookup::Fetched(entries))
                }
                Err(e) => Err(e),
            }
        } else {
            self.cache.get_or_fetch(drug, source, ttl, fetch).await
        };
        (source, result)
    }
}
