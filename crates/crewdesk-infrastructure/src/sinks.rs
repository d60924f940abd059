// SPDX-License-Identifier: GPL-3.0-or-later
//! External collaborator adapters: where generated bytes go and how
//! completion/failure events leave the pipeline.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use crewdesk_domain::{ReportFormat, ReportNotification};
use tracing::{info, warn};
use uuid::Uuid;

/// Persists generated output and resolves retrieval references. Resolved
/// URLs are time-limited and never persisted; callers re-resolve on read.
#[async_trait::async_trait]
pub trait ResultSink: Send + Sync {
    async fn store(&self, bytes: &[u8], format: ReportFormat) -> Result<String>;
    async fn resolve(&self, reference: &str, ttl: Duration) -> Result<String>;
}

/// Delivers completion/failure events to requestors and recipients.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: ReportNotification) -> Result<()>;
}

/// Filesystem-backed result sink. References are bare file names under the
/// configured directory; resolution produces an expiring download URL.
pub struct FsResultSink {
    dir: PathBuf,
    base_url: String,
}

impl FsResultSink {
    pub fn new(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl ResultSink for FsResultSink {
    async fn store(&self, bytes: &[u8], format: ReportFormat) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let reference = format!("{}.{}", Uuid::new_v4(), format.extension());
        let path = self.dir.join(&reference);
        tokio::fs::write(&path, bytes).await?;
        info!(target: "sinks", path = %path.display(), size = bytes.len(), "stored report output");
        Ok(reference)
    }

    async fn resolve(&self, reference: &str, ttl: Duration) -> Result<String> {
        // References are file names we produced ourselves; reject anything
        // that walks out of the result directory.
        if reference.contains('/') || reference.contains("..") {
            return Err(anyhow!("malformed result reference: {reference}"));
        }
        let path = self.dir.join(reference);
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(anyhow!("result reference {reference} no longer exists"));
        }
        let expires = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + ttl.as_secs();
        Ok(format!(
            "{}/{}?expires={}",
            self.base_url.trim_end_matches('/'),
            reference,
            expires
        ))
    }
}

/// Log-only notification sink for deployments without a delivery channel.
pub struct TracingNotificationSink;

#[async_trait::async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, notification: ReportNotification) -> Result<()> {
        info!(
            target: "sinks",
            job_id = %notification.job_id,
            kind = %notification.kind,
            recipients = notification.recipients.len(),
            outcome = ?notification.outcome,
            "report notification"
        );
        Ok(())
    }
}

/// Captures notifications in memory so tests can assert on delivery.
#[derive(Clone, Default)]
pub struct RecordingNotificationSink {
    inner: Arc<Mutex<Vec<ReportNotification>>>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retrieve and clear all captured notifications.
    pub fn drain(&self) -> Vec<ReportNotification> {
        let mut guard = self.lock();
        std::mem::take(&mut *guard)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ReportNotification>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!(target: "sinks", "notification sink mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[async_trait::async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn notify(&self, notification: ReportNotification) -> Result<()> {
        self.lock().push(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewdesk_domain::{NotificationOutcome, ReportJobId, ReportKind};

    #[tokio::test]
    async fn fs_sink_stores_and_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsResultSink::new(dir.path(), "http://localhost/files");

        let reference = sink
            .store(b"employee,hours\nana,37.5\n", ReportFormat::Csv)
            .await
            .unwrap();
        assert!(reference.ends_with(".csv"));

        let url = sink
            .resolve(&reference, Duration::from_secs(600))
            .await
            .unwrap();
        assert!(url.starts_with("http://localhost/files/"));
        assert!(url.contains("expires="));

        let stored = std::fs::read(dir.path().join(&reference)).unwrap();
        assert_eq!(stored, b"employee,hours\nana,37.5\n");
    }

    #[tokio::test]
    async fn fs_sink_rejects_unknown_and_malformed_references() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsResultSink::new(dir.path(), "http://localhost/files");

        assert!(sink
            .resolve("missing.csv", Duration::from_secs(60))
            .await
            .is_err());
        assert!(sink
            .resolve("../etc/passwd", Duration::from_secs(60))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn excel_format_uses_xlsx_extension() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsResultSink::new(dir.path(), "http://localhost/files");
        let reference = sink.store(b"stub", ReportFormat::Excel).await.unwrap();
        assert!(reference.ends_with(".xlsx"));
    }

    #[tokio::test]
    async fn recording_sink_captures_and_drains() {
        let sink = RecordingNotificationSink::new();
        assert!(sink.is_empty());

        let notification = ReportNotification {
            job_id: ReportJobId::new(),
            kind: ReportKind::new("payroll_export"),
            recipients: vec!["payroll@example.com".to_string()],
            outcome: NotificationOutcome::Failed {
                error: "generator unavailable".to_string(),
            },
            occurred_at: chrono::Utc::now(),
        };
        sink.notify(notification.clone()).await.unwrap();
        assert_eq!(sink.len(), 1);

        let drained = sink.drain();
        assert_eq!(drained, vec![notification]);
        assert!(sink.is_empty());
    }
}
