//! In-flight job registry used for superseding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::JobKey;

type JobMap = Arc<Mutex<HashMap<JobKey, RegisteredJob>>>;

struct RegisteredJob {
    id: u64,
    token: CancellationToken,
}

fn lock_jobs(jobs: &JobMap) -> MutexGuard<'_, HashMap<JobKey, RegisteredJob>> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks one cancellation scope per pull request
pub struct JobRegistry {
    shutdown: CancellationToken,
    next_id: AtomicU64,
    jobs: JobMap,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Token cancelled by [`JobRegistry::shutdown`]; a natural parent for new jobs.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start a job for `key`, cancelling any job already running for it.
    pub fn begin(&self, key: &JobKey, parent: &CancellationToken) -> JobScope {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = parent.child_token();
        if self.shutdown.is_cancelled() {
            token.cancel();
        }

        let previous = lock_jobs(&self.jobs).insert(
            key.clone(),
            RegisteredJob {
                id,
                token: token.clone(),
            },
        );

        if let Some(previous) = previous {
            info!(job = %key, superseded = previous.id, by = id, "Superseding in-flight job");
            previous.token.cancel();
        }

        JobScope {
            key: key.clone(),
            id,
            token,
            jobs: self.jobs.clone(),
        }
    }

    pub fn is_active(&self, key: &JobKey) -> bool {
        lock_jobs(&self.jobs).contains_key(key)
    }

    pub fn active_jobs(&self) -> usize {
        lock_jobs(&self.jobs).len()
    }

    /// Cancel every registered job and any job begun afterwards.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for job in lock_jobs(&self.jobs).values() {
            job.token.cancel();
        }
    }
}

/// A registered job's cancellation scope.
///
/// Dropping it unregisters the job unless a newer one has replaced it.
pub struct JobScope {
    key: JobKey,
    id: u64,
    token: CancellationToken,
    jobs: JobMap,
}

impl JobScope {
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether this scope is still the registered one for its key.
    pub fn is_current(&self) -> bool {
        lock_jobs(&self.jobs).get(&self.key).is_some_and(|job| job.id == self.id)
    }
}

impl Drop for JobScope {
    fn drop(&mut self) {
        let mut jobs = lock_jobs(&self.jobs);
        if jobs.get(&self.key).is_some_and(|job| job.id == self.id) {
            jobs.remove(&self.key);
            debug!(job = %self.key, id = self.id, "Job finished");
        }
    }
}
