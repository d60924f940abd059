// SPDX-License-Identifier: GPL-3.0-or-later
//! Timer-driven fallback dispatch, selected when the broker is unreachable
//! at startup and sticky for the process lifetime.
//!
//! A fixed-interval tick scans an in-process pending set and attempts each
//! due job once per tick. The set is a work hint only; the job store's
//! claim CAS remains the source of truth for exclusivity, so a stale entry
//! costs one lost claim, never a double execution. Single-process only:
//! two fallback pollers with separate sets would still be serialized by a
//! shared durable store, but nothing in this module assumes that.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crewdesk_domain::ReportJobId;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::executor::JobExecutor;

/// Pending job ids with their dispatch gates. An entry with a future gate
/// is ignored until the gate elapses (recurring cycles, retry backoff).
#[derive(Clone, Default)]
pub struct PendingJobs {
    inner: Arc<Mutex<HashMap<ReportJobId, Option<DateTime<Utc>>>>>,
}

impl PendingJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job_id: ReportJobId, not_before: Option<DateTime<Utc>>) {
        self.lock().insert(job_id, not_before);
    }

    pub fn remove(&self, job_id: ReportJobId) {
        self.lock().remove(&job_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every id whose gate has elapsed at `now`. Removed
    /// ids re-enter only through executor follow-ups, which serializes
    /// attempts per job within this process.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<ReportJobId> {
        let mut pending = self.lock();
        let due: Vec<ReportJobId> = pending
            .iter()
            .filter(|(_, gate)| gate.map(|t| t <= now).unwrap_or(true))
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            pending.remove(id);
        }
        due
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ReportJobId, Option<DateTime<Utc>>>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!(target: "dispatch", "pending set mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

pub struct FallbackBackend {
    executor: Arc<JobExecutor>,
    pending: PendingJobs,
    poll_interval: Duration,
    worker_count: usize,
}

impl FallbackBackend {
    pub fn new(
        executor: Arc<JobExecutor>,
        pending: PendingJobs,
        poll_interval: Duration,
        worker_count: usize,
    ) -> Self {
        Self {
            executor,
            pending,
            poll_interval,
            worker_count,
        }
    }

    pub fn start(self) -> JoinHandle<()> {
        let FallbackBackend {
            executor,
            pending,
            poll_interval,
            worker_count,
        } = self;

        tokio::spawn(async move {
            info!(
                target: "dispatch",
                interval_secs = poll_interval.as_secs_f64(),
                worker_count,
                "fallback dispatch loop started"
            );
            let semaphore = Arc::new(Semaphore::new(worker_count));
            let mut ticker = interval(poll_interval);

            loop {
                ticker.tick().await;
                let due = pending.take_due(Utc::now());
                if due.is_empty() {
                    continue;
                }
                debug!(target: "dispatch", due = due.len(), "fallback tick");

                for job_id in due {
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    let executor = executor.clone();
                    let pending = pending.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        for follow_up in executor.execute(job_id).await {
                            pending.insert(follow_up.job_id, follow_up.not_before);
                        }
                    });
                }
            }
        })
    }
}
