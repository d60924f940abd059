// SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::Result;
use chrono::{DateTime, Utc};
use crewdesk_domain::{ReportJob, ReportJobId, ReportStatus, RequesterId};

/// Durable record of report jobs. The single source of truth for job state;
/// `claim` must be a compare-and-swap so that no two workers ever hold the
/// same job in `generating` at once, even under redelivery.
#[async_trait::async_trait]
pub trait ReportJobStore: Send + Sync {
    async fn insert(&self, job: &ReportJob) -> Result<()>;

    async fn get(&self, id: ReportJobId) -> Result<Option<ReportJob>>;

    /// Jobs for one requester, optionally filtered by status, newest first.
    async fn list_by_requester(
        &self,
        requested_by: RequesterId,
        status: Option<ReportStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReportJob>>;

    /// All queued jobs, due or gated. Used by the dispatcher recovery sweep.
    async fn list_queued(&self) -> Result<Vec<ReportJob>>;

    /// Atomic claim: `queued -> generating`, counting the attempt and
    /// consuming the dispatch gate. Returns the claimed snapshot, or `None`
    /// when the job is already claimed, terminal, or not yet due at `now`.
    async fn claim(&self, id: ReportJobId, now: DateTime<Utc>) -> Result<Option<ReportJob>>;

    /// Persist the outcome of the in-flight attempt (`completed`, `failed`
    /// or requeued). Only valid while this process holds the claim.
    async fn update_after_claim(&self, job: &ReportJob) -> Result<()>;

    /// `queued -> cancelled`. Returns false when the job was not queued.
    async fn cancel(&self, id: ReportJobId) -> Result<bool>;
}
