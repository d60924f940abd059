// SPDX-License-Identifier: GPL-3.0-or-later
//! Per-job execution, shared by both dispatch modes.
//!
//! One call to [`JobExecutor::execute`] drives exactly one attempt: claim,
//! generate, persist the outcome, notify, and arm the next recurring cycle
//! when the job is terminal. The claim is the mutual-exclusion point; a
//! lost claim means another worker (or a cancel) got there first and the
//! call is a no-op.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crewdesk_application::GeneratorRegistry;
use crewdesk_domain::{
    FailureOutcome, ReportJob, ReportJobId, ReportNotification,
};
use crewdesk_infrastructure::{NotificationSink, ReportJobStore, ResultSink};
use tracing::{debug, error, info, warn};

/// Work the backend must feed back into its queue after an attempt:
/// a retry of the same job, or the next cycle of a recurring one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowUp {
    pub job_id: ReportJobId,
    pub not_before: Option<DateTime<Utc>>,
}

/// A job that fails to persist its outcome would be stranded in
/// `generating` (the claim guard only admits `queued` rows), so the write
/// is retried before giving up.
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(250);

pub struct JobExecutor {
    store: Arc<dyn ReportJobStore>,
    registry: Arc<GeneratorRegistry>,
    result_sink: Arc<dyn ResultSink>,
    notifications: Arc<dyn NotificationSink>,
    /// Base for the exponential retry backoff gate.
    retry_base_delay: ChronoDuration,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn ReportJobStore>,
        registry: Arc<GeneratorRegistry>,
        result_sink: Arc<dyn ResultSink>,
        notifications: Arc<dyn NotificationSink>,
        retry_base_delay_secs: u64,
    ) -> Self {
        Self {
            store,
            registry,
            result_sink,
            notifications,
            retry_base_delay: ChronoDuration::seconds(retry_base_delay_secs as i64),
        }
    }

    /// Run one attempt of `job_id`. Returns the follow-ups the backend must
    /// re-enqueue; empty when the job is terminal or the claim was lost.
    pub async fn execute(&self, job_id: ReportJobId) -> Vec<FollowUp> {
        let now = Utc::now();
        let mut job = match self.store.claim(job_id, now).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(target: "dispatch", %job_id, "claim lost, skipping");
                return Vec::new();
            }
            Err(err) => {
                // Store unavailable: the job must not drop out of the
                // pending set. Hand it back with an infrastructure delay.
                error!(target: "dispatch", %job_id, error = %err, "claim failed, store unavailable");
                return vec![FollowUp {
                    job_id,
                    not_before: Some(now + self.retry_base_delay),
                }];
            }
        };

        info!(
            target: "dispatch",
            %job_id,
            kind = %job.kind,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "executing report job"
        );

        let started = Instant::now();
        match self.generate_and_store(&job).await {
            Ok(reference) => self.finish_success(job, reference, started).await,
            Err(err) => self.finish_failure(&mut job, err).await,
        }
    }

    async fn generate_and_store(&self, job: &ReportJob) -> anyhow::Result<String> {
        let generator = self
            .registry
            .get(&job.kind)
            .ok_or_else(|| anyhow::anyhow!("no generator registered for kind {}", job.kind))?;
        let bytes = generator.generate(job).await?;
        self.result_sink.store(&bytes, job.format).await
    }

    async fn finish_success(
        &self,
        mut job: ReportJob,
        reference: String,
        started: Instant,
    ) -> Vec<FollowUp> {
        let completed_at = Utc::now();
        let duration_ms = started.elapsed().as_millis() as i64;
        if let Err(err) = job.complete(reference.clone(), completed_at, duration_ms) {
            error!(target: "dispatch", job_id = %job.id, error = %err, "completion transition rejected");
            return Vec::new();
        }
        if let Err(err) = self.persist_outcome(&job).await {
            error!(target: "dispatch", job_id = %job.id, error = %err, "completion not persisted, job remains claimed");
            return Vec::new();
        }

        info!(
            target: "dispatch",
            job_id = %job.id,
            attempts = job.attempts,
            duration_ms,
            "report job completed"
        );
        self.notify(ReportNotification::completed(&job, reference))
            .await;
        self.arm_next_cycle(&job, completed_at).await
    }

    async fn finish_failure(&self, job: &mut ReportJob, err: anyhow::Error) -> Vec<FollowUp> {
        let now = Utc::now();
        // Exponential backoff gate: base * 2^(attempt-1).
        let exponent = job.attempts.saturating_sub(1).min(16);
        let delay = self.retry_base_delay * 2_i32.pow(exponent);
        let retry_gate = (delay > ChronoDuration::zero()).then(|| now + delay);

        let outcome = match job.record_failure(err.to_string(), retry_gate, now) {
            Ok(outcome) => outcome,
            Err(transition) => {
                error!(target: "dispatch", job_id = %job.id, error = %transition, "failure transition rejected");
                return Vec::new();
            }
        };
        if let Err(store_err) = self.persist_outcome(job).await {
            error!(target: "dispatch", job_id = %job.id, error = %store_err, "attempt outcome not persisted, job remains claimed");
            return Vec::new();
        }

        match outcome {
            FailureOutcome::Retry => {
                warn!(
                    target: "dispatch",
                    job_id = %job.id,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    error = %err,
                    retry_at = ?retry_gate,
                    "attempt failed, retrying"
                );
                vec![FollowUp {
                    job_id: job.id,
                    not_before: retry_gate,
                }]
            }
            FailureOutcome::Exhausted => {
                error!(
                    target: "dispatch",
                    job_id = %job.id,
                    attempts = job.attempts,
                    error = %err,
                    "report job failed, retries exhausted"
                );
                self.notify(ReportNotification::failed(job, err.to_string()))
                    .await;
                // One failed run must not disable the whole schedule: the
                // next cycle is armed after terminal failure as well.
                self.arm_next_cycle(job, now).await
            }
        }
    }

    async fn arm_next_cycle(&self, job: &ReportJob, now: DateTime<Utc>) -> Vec<FollowUp> {
        let Some(next) = job.next_cycle(now) else {
            return Vec::new();
        };
        let next_run = next.not_before;
        match self.store.insert(&next).await {
            Ok(()) => {
                info!(
                    target: "dispatch",
                    job_id = %job.id,
                    next_job_id = %next.id,
                    next_run = ?next_run,
                    "armed next recurring cycle"
                );
                vec![FollowUp {
                    job_id: next.id,
                    not_before: next_run,
                }]
            }
            Err(err) => {
                error!(target: "dispatch", job_id = %job.id, error = %err, "failed to arm next recurring cycle");
                Vec::new()
            }
        }
    }

    /// Write the attempt outcome, absorbing transient store failures. The
    /// job already left `queued` at claim time, so a dropped write here
    /// would strand it outside every dispatch path.
    async fn persist_outcome(&self, job: &ReportJob) -> anyhow::Result<()> {
        let mut attempt: u32 = 0;
        loop {
            match self.store.update_after_claim(job).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if attempt >= PERSIST_ATTEMPTS {
                        return Err(err);
                    }
                    warn!(
                        target: "dispatch",
                        job_id = %job.id,
                        error = %err,
                        attempt,
                        "attempt outcome not persisted, retrying"
                    );
                    tokio::time::sleep(PERSIST_RETRY_DELAY * attempt).await;
                }
            }
        }
    }

    async fn notify(&self, notification: ReportNotification) {
        if let Err(err) = self.notifications.notify(notification).await {
            // Notification delivery is best-effort; the job record is the
            // source of truth callers poll.
            warn!(target: "dispatch", error = %err, "notification delivery failed");
        }
    }
}
