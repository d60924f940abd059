// SPDX-License-Identifier: GPL-3.0-or-later
//! Dispatch backend: turns queued report jobs into terminal states with
//! bounded concurrency, retries with backoff, and recurring rescheduling.
//!
//! Two operating modes, chosen once at startup and sticky for the process
//! lifetime: broker mode (push queue feeding a worker pool) and fallback
//! mode (fixed-interval poller over an in-process pending set). Per-job
//! execution is identical in both; see [`executor::JobExecutor`].

pub mod broker;
pub mod executor;
pub mod fallback;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crewdesk_application::{GeneratorRegistry, JobDispatcher};
use crewdesk_config::{DispatchConfig, DispatchMode};
use crewdesk_domain::ReportJobId;
use crewdesk_infrastructure::{NotificationSink, ReportJobStore, ResultSink};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use broker::{BrokerBackend, InProcessBroker};
use fallback::{FallbackBackend, PendingJobs};

pub use executor::{FollowUp, JobExecutor};

/// Hand-off surface given to the report service. Enqueueing is push in
/// broker mode and a pending-set insert in fallback mode.
pub struct DispatchHandle {
    inner: HandleInner,
}

enum HandleInner {
    Broker(mpsc::UnboundedSender<ReportJobId>),
    Fallback(PendingJobs),
}

impl JobDispatcher for DispatchHandle {
    fn enqueue(&self, job_id: ReportJobId, not_before: Option<DateTime<Utc>>) {
        match &self.inner {
            HandleInner::Broker(tx) => broker::publish(tx, job_id, not_before),
            HandleInner::Fallback(pending) => pending.insert(job_id, not_before),
        }
    }

    fn forget(&self, job_id: ReportJobId) {
        match &self.inner {
            // Broker messages cannot be recalled; the store's claim guard
            // turns a delivery for a cancelled job into a no-op.
            HandleInner::Broker(_) => {}
            HandleInner::Fallback(pending) => pending.remove(job_id),
        }
    }
}

pub struct StartedDispatcher {
    pub handle: Arc<DispatchHandle>,
    pub task: JoinHandle<()>,
    pub mode: DispatchMode,
}

pub struct Dispatcher {
    config: DispatchConfig,
    store: Arc<dyn ReportJobStore>,
    executor: Arc<JobExecutor>,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn ReportJobStore>,
        registry: Arc<GeneratorRegistry>,
        result_sink: Arc<dyn ResultSink>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            registry,
            result_sink,
            notifications,
            config.retry_base_delay_secs,
        ));
        Self {
            config,
            store,
            executor,
        }
    }

    /// Select the operating mode, start the backend, and sweep queued jobs
    /// back into the dispatch set (crash recovery). The mode decision is
    /// final: an unreachable broker is not retried mid-run.
    pub async fn start(self) -> anyhow::Result<StartedDispatcher> {
        let (handle, task, mode) = match self.config.mode {
            DispatchMode::Fallback => self.start_fallback(),
            DispatchMode::Broker => {
                let connection = InProcessBroker::connect()?;
                self.start_broker(connection)
            }
            DispatchMode::Auto => match InProcessBroker::connect() {
                Ok(connection) => self.start_broker(connection),
                Err(err) => {
                    warn!(
                        target: "dispatch",
                        error = %err,
                        "broker unreachable at startup, using fallback dispatch for the process lifetime"
                    );
                    self.start_fallback()
                }
            },
        };

        let handle = Arc::new(handle);
        let queued = self.store.list_queued().await?;
        for job in &queued {
            handle.enqueue(job.id, job.not_before);
        }
        info!(
            target: "dispatch",
            ?mode,
            recovered = queued.len(),
            "dispatch backend started"
        );

        Ok(StartedDispatcher { handle, task, mode })
    }

    fn start_broker(
        &self,
        connection: broker::BrokerConnection,
    ) -> (DispatchHandle, JoinHandle<()>, DispatchMode) {
        let handle = DispatchHandle {
            inner: HandleInner::Broker(connection.tx.clone()),
        };
        let task = BrokerBackend::new(self.executor.clone(), self.config.worker_count)
            .start(connection);
        (handle, task, DispatchMode::Broker)
    }

    fn start_fallback(&self) -> (DispatchHandle, JoinHandle<()>, DispatchMode) {
        let pending = PendingJobs::new();
        let handle = DispatchHandle {
            inner: HandleInner::Fallback(pending.clone()),
        };
        let task = FallbackBackend::new(
            self.executor.clone(),
            pending,
            Duration::from_secs(self.config.poll_interval_secs.max(1)),
            self.config.worker_count,
        )
        .start();
        (handle, task, DispatchMode::Fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use crewdesk_application::ReportGenerator;
    use crewdesk_domain::{
        DateRange, ReportFormat, ReportJob, ReportKind, ReportParameters, ReportStatus,
        RequesterId,
    };
    use crewdesk_infrastructure::{
        FsResultSink, InMemoryReportJobStore, RecordingNotificationSink,
    };
    use std::time::Duration as StdDuration;

    struct OkGenerator;

    #[async_trait::async_trait]
    impl ReportGenerator for OkGenerator {
        fn kind(&self) -> &'static str {
            "timesheet_summary"
        }

        fn name(&self) -> String {
            "Timesheet Summary".to_string()
        }

        async fn generate(&self, _job: &ReportJob) -> anyhow::Result<Vec<u8>> {
            Ok(b"ok".to_vec())
        }
    }

    struct Fixture {
        store: InMemoryReportJobStore,
        notifications: RecordingNotificationSink,
        dispatcher: Dispatcher,
        _dir: tempfile::TempDir,
    }

    fn fixture(mut config: DispatchConfig) -> Fixture {
        // Fast ticks so fallback tests finish promptly.
        config.poll_interval_secs = 1;
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryReportJobStore::new();
        let notifications = RecordingNotificationSink::new();
        let mut registry = GeneratorRegistry::new();
        registry.register(OkGenerator);

        let dispatcher = Dispatcher::new(
            config,
            Arc::new(store.clone()),
            Arc::new(registry),
            Arc::new(FsResultSink::new(dir.path(), "http://localhost/files")),
            Arc::new(notifications.clone()),
        );
        Fixture {
            store,
            notifications,
            dispatcher,
            _dir: dir,
        }
    }

    fn job() -> ReportJob {
        ReportJob::new(
            RequesterId::new(),
            ReportKind::new("timesheet_summary"),
            ReportFormat::Csv,
            ReportParameters::new(DateRange::new(
                NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            )),
        )
    }

    async fn wait_for_status(
        store: &InMemoryReportJobStore,
        id: ReportJobId,
        status: ReportStatus,
    ) {
        for _ in 0..100 {
            let job = store.get(id).await.unwrap().unwrap();
            if job.status == status {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }
        let job = store.get(id).await.unwrap().unwrap();
        panic!("job {id} stuck in {}, expected {status}", job.status);
    }

    #[tokio::test]
    async fn broker_mode_executes_enqueued_jobs() {
        let config = DispatchConfig {
            mode: DispatchMode::Broker,
            ..DispatchConfig::default()
        };
        let f = fixture(config);
        let job = job();
        f.store.insert(&job).await.unwrap();

        let started = f.dispatcher.start().await.unwrap();
        assert_eq!(started.mode, DispatchMode::Broker);
        // Recovery sweep already picked the job up; no explicit enqueue.
        wait_for_status(&f.store, job.id, ReportStatus::Completed).await;
        assert_eq!(f.notifications.len(), 1);
    }

    #[tokio::test]
    async fn auto_mode_prefers_broker() {
        let f = fixture(DispatchConfig::default());
        let started = f.dispatcher.start().await.unwrap();
        assert_eq!(started.mode, DispatchMode::Broker);
    }

    #[tokio::test]
    async fn fallback_mode_polls_pending_jobs() {
        let config = DispatchConfig {
            mode: DispatchMode::Fallback,
            ..DispatchConfig::default()
        };
        let f = fixture(config);
        let started = f.dispatcher.start().await.unwrap();
        assert_eq!(started.mode, DispatchMode::Fallback);

        let job = job();
        f.store.insert(&job).await.unwrap();
        started.handle.enqueue(job.id, None);

        wait_for_status(&f.store, job.id, ReportStatus::Completed).await;
    }

    #[tokio::test]
    async fn fallback_forget_prevents_dispatch() {
        let config = DispatchConfig {
            mode: DispatchMode::Fallback,
            ..DispatchConfig::default()
        };
        let f = fixture(config);
        let started = f.dispatcher.start().await.unwrap();

        let job = job();
        f.store.insert(&job).await.unwrap();
        started.handle.enqueue(job.id, None);
        started.handle.forget(job.id);
        f.store.cancel(job.id).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(1500)).await;
        let stored = f.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Cancelled);
        assert!(f.notifications.is_empty());
    }

    #[tokio::test]
    async fn broker_mode_delivery_for_cancelled_job_is_noop() {
        let config = DispatchConfig {
            mode: DispatchMode::Broker,
            ..DispatchConfig::default()
        };
        let f = fixture(config);
        let started = f.dispatcher.start().await.unwrap();

        let job = job();
        f.store.insert(&job).await.unwrap();
        f.store.cancel(job.id).await.unwrap();
        // The queue cannot recall the message; the claim guard absorbs it.
        started.handle.enqueue(job.id, None);

        tokio::time::sleep(StdDuration::from_millis(300)).await;
        let stored = f.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Cancelled);
        assert!(f.notifications.is_empty());
    }
}
