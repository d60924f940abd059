// SPDX-License-Identifier: GPL-3.0-or-later
//! Report service: the public entry points of the pipeline. Validates
//! requests, writes queued jobs, hands them to the dispatch backend and
//! returns immediately; completion is observed by polling `get_report`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crewdesk_config::AppConfig;
use crewdesk_domain::{
    RecurringSchedule, ReportFormat, ReportJob, ReportJobId, ReportKind, ReportParameters,
    ReportStatus, RequesterId,
};
use crewdesk_infrastructure::{ReportJobStore, ResultSink};
use thiserror::Error;
use tracing::{info, warn};

use crate::ports::JobDispatcher;
use crate::registry::GeneratorRegistry;

#[derive(Debug, Error)]
pub enum ReportServiceError {
    /// Bad input, rejected synchronously; nothing is enqueued.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Unknown id, or the job belongs to a different requester.
    #[error("report job not found")]
    NotFound,
    /// Operation not legal for the job's current status.
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type ServiceResult<T> = Result<T, ReportServiceError>;

/// Job snapshot plus a freshly resolved retrieval URL. URLs are
/// time-limited and re-resolved on every read, never persisted.
#[derive(Debug, Clone)]
pub struct ReportView {
    pub job: ReportJob,
    pub result_url: Option<String>,
}

pub struct ReportService {
    config: AppConfig,
    store: Arc<dyn ReportJobStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    result_sink: Arc<dyn ResultSink>,
    registry: Arc<GeneratorRegistry>,
}

impl ReportService {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn ReportJobStore>,
        dispatcher: Arc<dyn JobDispatcher>,
        result_sink: Arc<dyn ResultSink>,
        registry: Arc<GeneratorRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            dispatcher,
            result_sink,
            registry,
        }
    }

    /// Create a one-shot report job and hand it to the dispatch backend.
    /// Returns the queued job without waiting for generation.
    pub async fn request_report(
        &self,
        requested_by: RequesterId,
        kind: ReportKind,
        format: ReportFormat,
        parameters: ReportParameters,
    ) -> ServiceResult<ReportJob> {
        self.validate_request(&kind, &parameters)?;
        let job = ReportJob::new(requested_by, kind, format, parameters)
            .with_max_attempts(self.config.dispatch.max_attempts);
        self.submit(job).await
    }

    /// Create a recurring report job. The first cycle is gated on the
    /// schedule's computed next run.
    pub async fn schedule_report(
        &self,
        requested_by: RequesterId,
        kind: ReportKind,
        format: ReportFormat,
        parameters: ReportParameters,
        schedule: RecurringSchedule,
    ) -> ServiceResult<ReportJob> {
        self.validate_request(&kind, &parameters)?;
        schedule
            .validate()
            .map_err(|e| ReportServiceError::Validation(e.to_string()))?;

        let armed = schedule.armed(Utc::now());
        let job = ReportJob::new(requested_by, kind, format, parameters)
            .with_max_attempts(self.config.dispatch.max_attempts)
            .with_schedule(armed);
        self.submit(job).await
    }

    /// Fetch a job, scoped to its requester. Completed jobs get a fresh
    /// time-limited result URL.
    pub async fn get_report(
        &self,
        id: ReportJobId,
        requested_by: RequesterId,
    ) -> ServiceResult<ReportView> {
        let job = self.owned_job(id, requested_by).await?;

        let result_url = match (&job.status, &job.result_reference) {
            (ReportStatus::Completed, Some(reference)) => {
                let ttl = Duration::from_secs(self.config.reports.result_url_ttl_secs);
                match self.result_sink.resolve(reference, ttl).await {
                    Ok(url) => Some(url),
                    Err(err) => {
                        warn!(target: "reports", job_id = %id, error = %err, "result reference no longer resolvable");
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(ReportView { job, result_url })
    }

    /// Jobs belonging to a requester, optionally filtered by status.
    pub async fn list_reports(
        &self,
        requested_by: RequesterId,
        status: Option<ReportStatus>,
        limit: i64,
        offset: i64,
    ) -> ServiceResult<Vec<ReportJob>> {
        Ok(self
            .store
            .list_by_requester(requested_by, status, limit, offset)
            .await?)
    }

    /// Cancel a queued job. Cancellation is cooperative: a job already
    /// claimed by a worker is rejected rather than torn down mid-attempt,
    /// and terminal jobs report `InvalidState`. Cancelling an already
    /// cancelled job is a no-op.
    pub async fn cancel_report(
        &self,
        id: ReportJobId,
        requested_by: RequesterId,
    ) -> ServiceResult<()> {
        let job = self.owned_job(id, requested_by).await?;

        match job.status {
            ReportStatus::Cancelled => return Ok(()),
            ReportStatus::Completed | ReportStatus::Failed => {
                return Err(ReportServiceError::InvalidState(format!(
                    "report job is already {}",
                    job.status
                )));
            }
            ReportStatus::Generating => {
                return Err(ReportServiceError::InvalidState(
                    "report job is generating; retry once the attempt finishes".to_string(),
                ));
            }
            ReportStatus::Queued => {}
        }

        if self.store.cancel(id).await? {
            self.dispatcher.forget(id);
            info!(target: "reports", job_id = %id, "report job cancelled");
            Ok(())
        } else {
            // Lost the race against a worker claim between read and CAS.
            Err(ReportServiceError::InvalidState(
                "report job was claimed concurrently".to_string(),
            ))
        }
    }

    fn validate_request(
        &self,
        kind: &ReportKind,
        parameters: &ReportParameters,
    ) -> ServiceResult<()> {
        parameters
            .range
            .validate(self.config.reports.max_range_days)
            .map_err(ReportServiceError::Validation)?;
        if !self.registry.contains(kind) {
            return Err(ReportServiceError::Validation(format!(
                "unknown report kind: {kind}"
            )));
        }
        Ok(())
    }

    async fn submit(&self, job: ReportJob) -> ServiceResult<ReportJob> {
        self.store.insert(&job).await?;
        self.dispatcher.enqueue(job.id, job.not_before);
        info!(
            target: "reports",
            job_id = %job.id,
            kind = %job.kind,
            format = %job.format,
            recurring = job.is_recurring(),
            "report job queued"
        );
        Ok(job)
    }

    async fn owned_job(
        &self,
        id: ReportJobId,
        requested_by: RequesterId,
    ) -> ServiceResult<ReportJob> {
        let job = self
            .store
            .get(id)
            .await?
            .ok_or(ReportServiceError::NotFound)?;
        // Ownership failures are indistinguishable from unknown ids.
        if job.requested_by != requested_by {
            return Err(ReportServiceError::NotFound);
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::TimesheetSummaryGenerator;
    use crate::ports::JobDispatcher;
    use chrono::{DateTime, NaiveDate};
    use crewdesk_domain::DateRange;
    use crewdesk_infrastructure::{FsResultSink, InMemoryReportJobStore};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDispatcher {
        enqueued: Mutex<Vec<(ReportJobId, Option<DateTime<Utc>>)>>,
        forgotten: Mutex<Vec<ReportJobId>>,
    }

    impl JobDispatcher for RecordingDispatcher {
        fn enqueue(&self, job_id: ReportJobId, not_before: Option<DateTime<Utc>>) {
            self.enqueued.lock().unwrap().push((job_id, not_before));
        }

        fn forget(&self, job_id: ReportJobId) {
            self.forgotten.lock().unwrap().push(job_id);
        }
    }

    struct Fixture {
        service: ReportService,
        store: InMemoryReportJobStore,
        dispatcher: Arc<RecordingDispatcher>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryReportJobStore::new();
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let sink = Arc::new(FsResultSink::new(dir.path(), "http://localhost/files"));
        let mut registry = GeneratorRegistry::new();
        registry.register(TimesheetSummaryGenerator::default());

        let service = ReportService::new(
            AppConfig::default(),
            Arc::new(store.clone()),
            dispatcher.clone(),
            sink,
            Arc::new(registry),
        );
        Fixture {
            service,
            store,
            dispatcher,
            _dir: dir,
        }
    }

    fn parameters() -> ReportParameters {
        ReportParameters::new(DateRange::new(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
        ))
    }

    #[tokio::test]
    async fn request_returns_queued_job_and_enqueues() {
        let f = fixture();
        let requester = RequesterId::new();
        let job = f
            .service
            .request_report(
                requester,
                ReportKind::new("timesheet_summary"),
                ReportFormat::Csv,
                parameters(),
            )
            .await
            .unwrap();

        assert_eq!(job.status, ReportStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(
            f.dispatcher.enqueued.lock().unwrap().as_slice(),
            &[(job.id, None)]
        );
        assert!(f.store.get(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalid_date_range_is_rejected_before_enqueue() {
        let f = fixture();
        let inverted = ReportParameters::new(DateRange::new(
            NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        ));
        let err = f
            .service
            .request_report(
                RequesterId::new(),
                ReportKind::new("timesheet_summary"),
                ReportFormat::Csv,
                inverted,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReportServiceError::Validation(_)));
        assert!(f.dispatcher.enqueued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let f = fixture();
        let err = f
            .service
            .request_report(
                RequesterId::new(),
                ReportKind::new("quarterly_margins"),
                ReportFormat::Pdf,
                parameters(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReportServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn schedule_report_arms_first_cycle() {
        let f = fixture();
        let schedule = RecurringSchedule::daily(
            chrono::NaiveTime::from_hms_opt(6, 0, 0),
            "UTC",
            vec!["ops@example.com".to_string()],
        );
        let before = Utc::now();
        let job = f
            .service
            .schedule_report(
                RequesterId::new(),
                ReportKind::new("timesheet_summary"),
                ReportFormat::Csv,
                parameters(),
                schedule,
            )
            .await
            .unwrap();

        let armed = job.schedule.as_ref().unwrap();
        assert!(armed.next_run.unwrap() > before);
        assert_eq!(job.not_before, armed.next_run);
        // Nothing has run yet, so the first cycle carries no last run.
        assert!(armed.last_run.is_none());
        let enqueued = f.dispatcher.enqueued.lock().unwrap();
        assert_eq!(enqueued[0], (job.id, armed.next_run));
    }

    #[tokio::test]
    async fn malformed_schedule_is_rejected() {
        let f = fixture();
        let schedule = RecurringSchedule::daily(None, "UTC", vec![]);
        let err = f
            .service
            .schedule_report(
                RequesterId::new(),
                ReportKind::new("timesheet_summary"),
                ReportFormat::Csv,
                parameters(),
                schedule,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReportServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn get_report_scopes_by_requester() {
        let f = fixture();
        let owner = RequesterId::new();
        let job = f
            .service
            .request_report(
                owner,
                ReportKind::new("timesheet_summary"),
                ReportFormat::Csv,
                parameters(),
            )
            .await
            .unwrap();

        assert!(f.service.get_report(job.id, owner).await.is_ok());
        let err = f
            .service
            .get_report(job.id, RequesterId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReportServiceError::NotFound));

        let err = f
            .service
            .get_report(ReportJobId::new(), owner)
            .await
            .unwrap_err();
        assert!(matches!(err, ReportServiceError::NotFound));
    }

    #[tokio::test]
    async fn completed_report_resolves_fresh_url() {
        let f = fixture();
        let owner = RequesterId::new();
        let job = f
            .service
            .request_report(
                owner,
                ReportKind::new("timesheet_summary"),
                ReportFormat::Csv,
                parameters(),
            )
            .await
            .unwrap();

        // Simulate the dispatch backend finishing the job.
        let mut claimed = f.store.claim(job.id, Utc::now()).await.unwrap().unwrap();
        let sink = FsResultSink::new(f._dir.path(), "http://localhost/files");
        let reference = sink.store(b"data", ReportFormat::Csv).await.unwrap();
        claimed.complete(reference, Utc::now(), 5).unwrap();
        f.store.update_after_claim(&claimed).await.unwrap();

        let view = f.service.get_report(job.id, owner).await.unwrap();
        assert_eq!(view.job.status, ReportStatus::Completed);
        let url = view.result_url.expect("completed job resolves a url");
        assert!(url.contains("expires="));
    }

    #[tokio::test]
    async fn cancel_queued_then_reject_terminal() {
        let f = fixture();
        let owner = RequesterId::new();
        let job = f
            .service
            .request_report(
                owner,
                ReportKind::new("timesheet_summary"),
                ReportFormat::Csv,
                parameters(),
            )
            .await
            .unwrap();

        f.service.cancel_report(job.id, owner).await.unwrap();
        assert_eq!(f.dispatcher.forgotten.lock().unwrap().as_slice(), &[job.id]);
        let stored = f.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Cancelled);
        // A later claim attempt must no-op.
        assert!(f.store.claim(job.id, Utc::now()).await.unwrap().is_none());

        // Cancelling again is a no-op.
        f.service.cancel_report(job.id, owner).await.unwrap();

        // Completed jobs reject cancellation.
        let done = f
            .service
            .request_report(
                owner,
                ReportKind::new("timesheet_summary"),
                ReportFormat::Csv,
                parameters(),
            )
            .await
            .unwrap();
        let mut claimed = f.store.claim(done.id, Utc::now()).await.unwrap().unwrap();
        claimed.complete("r.csv".to_string(), Utc::now(), 1).unwrap();
        f.store.update_after_claim(&claimed).await.unwrap();
        let err = f.service.cancel_report(done.id, owner).await.unwrap_err();
        assert!(matches!(err, ReportServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn cancel_generating_is_rejected() {
        let f = fixture();
        let owner = RequesterId::new();
        let job = f
            .service
            .request_report(
                owner,
                ReportKind::new("timesheet_summary"),
                ReportFormat::Csv,
                parameters(),
            )
            .await
            .unwrap();
        f.store.claim(job.id, Utc::now()).await.unwrap().unwrap();

        let err = f.service.cancel_report(job.id, owner).await.unwrap_err();
        assert!(matches!(err, ReportServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn list_reports_filters_by_status() {
        let f = fixture();
        let owner = RequesterId::new();
        for _ in 0..3 {
            f.service
                .request_report(
                    owner,
                    ReportKind::new("timesheet_summary"),
                    ReportFormat::Csv,
                    parameters(),
                )
                .await
                .unwrap();
        }
        let all = f.service.list_reports(owner, None, 50, 0).await.unwrap();
        assert_eq!(all.len(), 3);
        let cancelled = f
            .service
            .list_reports(owner, Some(ReportStatus::Cancelled), 50, 0)
            .await
            .unwrap();
        assert!(cancelled.is_empty());
    }
}
