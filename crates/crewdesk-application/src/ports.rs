// SPDX-License-Identifier: GPL-3.0-or-later
use chrono::{DateTime, Utc};
use crewdesk_domain::{ReportJob, ReportJobId};

/// Capability interface for report content generation. One implementation
/// per report kind, registered in the generator registry; the pipeline
/// never branches on the kind string itself.
#[async_trait::async_trait]
pub trait ReportGenerator: Send + Sync {
    /// Report kind this generator serves.
    fn kind(&self) -> &'static str;

    /// Human-readable generator name.
    fn name(&self) -> String;

    /// Produce formatted output bytes for the job's parameters. Any error
    /// counts as a failed attempt and is retried up to the job's limit.
    async fn generate(&self, job: &ReportJob) -> anyhow::Result<Vec<u8>>;
}

impl std::fmt::Debug for dyn ReportGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportGenerator")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

/// Hand-off point from the report service to the dispatch backend. The
/// service never blocks on execution; it enqueues and returns.
pub trait JobDispatcher: Send + Sync {
    /// Make a queued job visible to the backend, optionally not before a
    /// future instant (recurring cycles, retry backoff).
    fn enqueue(&self, job_id: ReportJobId, not_before: Option<DateTime<Utc>>);

    /// Drop a job from any pending dispatch set after a cancel. The store's
    /// claim guard makes this advisory: a forgotten id that is still
    /// delivered simply fails its claim.
    fn forget(&self, job_id: ReportJobId);
}

/// No-op dispatcher for tests and tooling that only needs the store.
pub struct NullDispatcher;

impl JobDispatcher for NullDispatcher {
    fn enqueue(&self, _job_id: ReportJobId, _not_before: Option<DateTime<Utc>>) {}

    fn forget(&self, _job_id: ReportJobId) {}
}
