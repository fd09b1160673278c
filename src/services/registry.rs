//! In-memory job arena.
//!
//! Every job record lives behind one lock and is only ever mutated inside a
//! single critical section, so readers see each transition or artifact commit
//! either completely or not at all.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
}

#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {id} is already {status}")]
    Terminal { id: Uuid, status: JobStatus },
}

/// How long finished jobs stay queryable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    /// Terminal jobs untouched for longer than this are evicted.
    pub ttl: Duration,
    /// Most terminal jobs kept at once; the oldest go first.
    pub max_terminal: usize,
    /// Interval between eviction sweeps.
    pub sweep_interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_terminal: 10_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) -> Uuid {
        let id = job.id;
        self.jobs.write().insert(
            id,
            JobEntry {
                job,
                cancel: CancellationToken::new(),
            },
        );
        id
    }

    /// Drop a job that never made it onto the queue.
    pub fn remove(&self, id: Uuid) -> Option<Job> {
        self.jobs.write().remove(&id).map(|entry| entry.job)
    }

    /// Consistent snapshot of a job record.
    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.read().get(&id).map(|entry| entry.job.clone())
    }

    pub fn cancel_token(&self, id: Uuid) -> Option<CancellationToken> {
        self.jobs.read().get(&id).map(|entry| entry.cancel.clone())
    }

    /// Mutate a job atomically.
    pub fn update<R>(&self, id: Uuid, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        self.jobs.write().get_mut(&id).map(|entry| f(&mut entry.job))
    }

    /// Commit stage output unless the job was cancelled or already ended.
    /// Returns whether `f` ran.
    pub fn commit(&self, id: Uuid, f: impl FnOnce(&mut Job)) -> bool {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&id) {
            Some(entry) if !entry.job.cancel_requested && !entry.job.is_terminal() => {
                f(&mut entry.job);
                true
            }
            _ => false,
        }
    }

    /// Flag a job for cancellation and fire its token.
    ///
    /// A job nobody has picked up yet is cancelled on the spot; a running job
    /// reaches `cancelled` at its next checkpoint.
    pub fn request_cancel(&self, id: Uuid) -> Result<Job, CancelError> {
        let mut jobs = self.jobs.write();
        let entry = jobs.get_mut(&id).ok_or(CancelError::NotFound(id))?;
        if entry.job.is_terminal() {
            return Err(CancelError::Terminal {
                id,
                status: entry.job.status,
            });
        }
        entry.job.cancel_requested = true;
        if entry.job.status == JobStatus::Pending {
            entry.job.transition(JobStatus::Cancelled, "Cancelled before start");
        } else {
            entry.job.stage_message = "Cancellation requested".to_string();
        }
        entry.cancel.cancel();
        Ok(entry.job.clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    /// Drop terminal jobs past the TTL, then the oldest terminal jobs beyond
    /// the cap. Active jobs are never evicted. Returns how many were dropped.
    pub fn evict_terminal(&self, now: DateTime<Utc>, policy: &RetentionPolicy) -> usize {
        let ttl = chrono::Duration::from_std(policy.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = now - ttl;

        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, entry| !(entry.job.is_terminal() && entry.job.updated_at < cutoff));

        let mut terminal: Vec<(DateTime<Utc>, Uuid)> = jobs
            .iter()
            .filter(|(_, entry)| entry.job.is_terminal())
            .map(|(id, entry)| (entry.job.updated_at, *id))
            .collect();
        if terminal.len() > policy.max_terminal {
            terminal.sort();
            let excess = terminal.len() - policy.max_terminal;
            for (_, id) in terminal.into_iter().take(excess) {
                jobs.remove(&id);
            }
        }
        before - jobs.len()
    }

    /// Jobs that have not reached a terminal state.
    pub fn active(&self) -> usize {
        self.jobs
            .read()
            .values()
            .filter(|entry| !entry.job.is_terminal())
            .count()
    }
}
