//! Progress tracking for the current mining job.
//!
//! Every mutation names the job it belongs to; updates from a job that is
//! no longer current (after `reset`) are ignored.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ddimine_common::error::{DdiError, Result};
use ddimine_common::evidence::EvidenceSource;

use crate::lock;
use crate::models::{DrugStatus, JobError, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    NotStarted,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl From<JobStatus> for ProgressState {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending   => ProgressState::NotStarted,
            JobStatus::Running   => ProgressState::Running,
            JobStatus::Completed => ProgressState::Completed,
            JobStatus::Partial   => ProgressState::Partial,
            JobStatus::Failed    => ProgressState::Failed,
            JobStatus::Cancelled => ProgressState::Cancelled,
        }
    }
}

/// Point-in-time view of the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: Option<Uuid>,
    pub state: ProgressState,
    pub total_drugs: usize,
    pub processed_count: usize,
    pub succeeded_count: usize,
    pub failed_drugs: Vec<String>,
    pub per_source_counts: BTreeMap<EvidenceSource, usize>,
    pub per_drug: BTreeMap<String, DrugStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: Option<u64>,
    pub errors: Vec<JobError>,
}

#[derive(Debug)]
struct TrackerState {
    job_id: Option<Uuid>,
    state: ProgressState,
    concurrency: usize,
    processed: usize,
    succeeded: usize,
    failed_drugs: Vec<String>,
    per_source: BTreeMap<EvidenceSource, usize>,
    per_drug: BTreeMap<String, DrugStatus>,
    drug_started: HashMap<String, Instant>,
    /// Sum of per-drug wall time for finished drugs.
    drug_time: Duration,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    /// Frozen elapsed time once the job reached a terminal state.
    finished_after: Option<Duration>,
    errors: Vec<JobError>,
}

impl TrackerState {
    fn idle() -> Self {
        Self {
            job_id: None,
            state: ProgressState::NotStarted,
            concurrency: 1,
            processed: 0,
            succeeded: 0,
            failed_drugs: Vec::new(),
            per_source: BTreeMap::new(),
            per_drug: BTreeMap::new(),
            drug_started: HashMap::new(),
            drug_time: Duration::ZERO,
            started: None,
            started_at: None,
            finished_after: None,
            errors: Vec::new(),
        }
    }

    fn is_current(&self, job_id: Uuid) -> bool {
        self.job_id == Some(job_id)
    }

    fn elapsed(&self) -> Duration {
        self.finished_after
            .or_else(|| self.started.map(|s| s.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    fn estimate_remaining(&self) -> Option<Duration> {
        if self.state != ProgressState::Running || self.processed == 0 {
            return None;
        }
        let remaining = self.per_drug.len().saturating_sub(self.processed) as u32;
        let average = self.drug_time / self.processed as u32;
        Some(average * remaining / self.concurrency.max(1) as u32)
    }
}

#[derive(Debug)]
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self { state: Mutex::new(TrackerState::idle()) }
    }

    /// Start tracking `job_id`. Fails with `Busy` while another job runs.
    pub fn try_begin(&self, job_id: Uuid, drugs: &[String], concurrency: usize) -> Result<()> {
        let mut s = lock(&self.state);
        if s.state == ProgressState::Running {
            if let Some(current) = s.job_id {
                return Err(DdiError::Busy { job_id: current });
            }
        }
        *s = TrackerState::idle();
        s.job_id = Some(job_id);
        s.state = ProgressState::Running;
        s.concurrency = concurrency.max(1);
        s.per_drug = drugs.iter().map(|d| (d.clone(), DrugStatus::Pending)).collect();
        s.started = Some(Instant::now());
        s.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn drug_started(&self, job_id: Uuid, drug: &str) {
        let mut s = lock(&self.state);
        if !s.is_current(job_id) {
            return;
        }
        s.per_drug.insert(drug.to_string(), DrugStatus::Running);
        s.drug_started.insert(drug.to_string(), Instant::now());
    }

    pub fn record_source(&self, job_id: Uuid, source: EvidenceSource, entries: usize) {
        let mut s = lock(&self.state);
        if s.is_current(job_id) {
            *s.per_source.entry(source).or_default() += entries;
        }
    }

    pub fn record_error(&self, job_id: Uuid, error: JobError) {
        let mut s = lock(&self.state);
        if s.is_current(job_id) {
            s.errors.push(error);
        }
    }

    /// Mark a drug finished. `processed_count` only moves forward, once per drug.
    pub fn drug_finished(&self, job_id: Uuid, drug: &str, status: DrugStatus) {
        let mut s = lock(&self.state);
        if !s.is_current(job_id) {
            return;
        }
        let already_done = s.per_drug.get(drug).is_some_and(DrugStatus::is_finished);
        s.per_drug.insert(drug.to_string(), status);
        if already_done {
            return;
        }
        if let Some(started) = s.drug_started.remove(drug) {
            s.drug_time += started.elapsed();
        }
        s.processed += 1;
        match status {
            DrugStatus::Succeeded | DrugStatus::Degraded => s.succeeded += 1,
            DrugStatus::Failed => s.failed_drugs.push(drug.to_string()),
            _ => {}
        }
    }

    pub fn finish(&self, job_id: Uuid, state: ProgressState) {
        let mut s = lock(&self.state);
        if !s.is_current(job_id) {
            return;
        }
        s.finished_after = Some(s.elapsed());
        s.state = state;
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).state == ProgressState::Running
    }

    /// Forget the current job. Late updates from its workers are dropped.
    pub fn reset(&self) {
        *lock(&self.state) = TrackerState::idle();
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let s = lock(&self.state);
        ProgressSnapshot {
            job_id: s.job_id,
            state: s.state,
            total_drugs: s.per_drug.len(),
            processed_count: s.processed,
            succeeded_count: s.succeeded,
            failed_drugs: s.failed_drugs.clone(),
            per_source_counts: s.per_source.clone(),
            per_drug: s.per_drug.clone(),
            started_at: s.started_at,
            elapsed_ms: s.elapsed().as_millis() as u64,
            estimated_remaining_ms: s.estimate_remaining().map(|d| d.as_millis() as u64),
            errors: s.errors.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn drugs() -> Vec<String> {
        vec!["warfarin".into(), "aspirin".into(), "digoxin".into()]
    }

    #[test]
    fn test_initial_state() {
        let tracker = ProgressTracker::new();
        let snap = tracker.snapshot();
        assert_eq!(snap.state, ProgressState::NotStarted);
        assert_eq!(snap.processed_count, 0);
        assert_eq!(snap.job_id, None);
    }

    #[test]
    fn test_second_job_is_busy() {
        let tracker = ProgressTracker::new();
        let first = Uuid::new_v4();
        tracker.try_begin(first, &drugs(), 2).unwrap();
        let err = tracker.try_begin(Uuid::new_v4(), &drugs(), 2).unwrap_err();
        assert!(matches!(err, DdiError::Busy { job_id } if job_id == first));

        tracker.finish(first, ProgressState::Completed);
        assert!(tracker.try_begin(Uuid::new_v4(), &drugs(), 2).is_ok());
    }

    #[test]
    fn test_processed_count_is_monotonic() {
        let tracker = ProgressTracker::new();
        let job = Uuid::new_v4();
        tracker.try_begin(job, &drugs(), 1).unwrap();
        tracker.drug_started(job, "warfarin");
        tracker.drug_finished(job, "warfarin", DrugStatus::Succeeded);
        tracker.drug_finished(job, "warfarin", DrugStatus::Failed);
        tracker.drug_finished(job, "aspirin", DrugStatus::Failed);

        let snap = tracker.snapshot();
        assert_eq!(snap.processed_count, 2);
        assert_eq!(snap.succeeded_count, 1);
        assert_eq!(snap.failed_drugs, vec!["aspirin"]);
        assert!(snap.estimated_remaining_ms.is_some());
    }

    #[test]
    fn test_stale_job_updates_ignored_after_reset() {
        let tracker = ProgressTracker::new();
        let job = Uuid::new_v4();
        tracker.try_begin(job, &drugs(), 1).unwrap();
        tracker.reset();
        tracker.record_source(job, EvidenceSource::Regulatory, 4);
        tracker.drug_finished(job, "warfarin", DrugStatus::Succeeded);

        let snap = tracker.snapshot();
        assert_eq!(snap.state, ProgressState::NotStarted);
        assert_eq!(snap.processed_count, 0);
        assert!(snap.per_source_counts.is_empty());
    }

    #[test]
    fn test_finish_freezes_elapsed() {
        let tracker = ProgressTracker::new();
        let job = Uuid::new_v4();
        tracker.try_begin(job, &drugs(), 1).unwrap();
        tracker.record_source(job, EvidenceSource::Publication, 3);
        tracker.finish(job, ProgressState::Partial);
        let a = tracker.snapshot();
        std::thread::sleep(Duration::from_millis(5));
        let b = tracker.snapshot();
        assert_eq!(a.elapsed_ms, b.elapsed_ms);
        assert_eq!(b.state, ProgressState::Partial);
        assert_eq!(b.per_source_counts[&EvidenceSource::Publication], 3);
        assert_eq!(b.estimated_remaining_ms, None);
    }
}
