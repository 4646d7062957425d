use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::job::{Job, JobCounts, JobStatus};

/// Job records, each behind a `watch` channel so callers can await changes.
#[derive(Default)]
pub struct JobStore {
    jobs: DashMap<Uuid, watch::Sender<Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) {
        let (tx, _) = watch::channel(job);
        let id = tx.borrow().id;
        self.jobs.insert(id, tx);
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.get(&id).map(|tx| tx.borrow().clone())
    }

    /// Apply `f` to a job in place and return the updated copy.
    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut Job)) -> Option<Job> {
        let tx = self.jobs.get(&id)?;
        tx.send_modify(|job| {
            f(job);
            job.updated_at = chrono::Utc::now();
        });
        let job = tx.borrow().clone();
        Some(job)
    }

    pub fn list(&self, status: Option<JobStatus>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .map(|tx| tx.borrow().clone())
            .filter(|job| status.map_or(true, |s| job.status == s))
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for tx in self.jobs.iter() {
            match tx.borrow().status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Retrying => counts.retrying += 1,
            }
        }
        counts
    }

    /// Suspend until the job reaches Completed or Failed.
    pub async fn wait_for_terminal(&self, id: Uuid) -> Result<Job> {
        let mut rx = self
            .jobs
            .get(&id)
            .map(|tx| tx.subscribe())
            .ok_or(JobError::UnknownJob(id))?;
        let job = rx
            .wait_for(|job| job.status.is_terminal())
            .await
            .map_err(|_| JobError::UnknownJob(id))?
            .clone();
        Ok(job)
    }

    /// Drop jobs that reached Completed or Failed at least `older_than` ago,
    /// returning how many were removed. Unfinished jobs are always kept.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let before = self.jobs.len();
        self.jobs.retain(|_, tx| {
            let job = tx.borrow();
            !job.status.is_terminal() || job.finished_at.map_or(false, |at| at > cutoff)
        });
        before - self.jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
