// SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use crewdesk_domain::{
    RecurringSchedule, ReportFormat, ReportJob, ReportJobId, ReportKind, ReportParameters,
    ReportStatus, RequesterId,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::stores::ReportJobStore;

/// SQLx-backed job store. The claim and cancel transitions are expressed as
/// conditional UPDATEs so the database serializes them.
pub struct SqliteReportJobStore {
    pool: SqlitePool,
}

impl SqliteReportJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ReportJobStore for SqliteReportJobStore {
    async fn insert(&self, job: &ReportJob) -> Result<()> {
        debug!(target: "store", job_id = %job.id, kind = %job.kind, "inserting report job");
        let q = r#"
            INSERT INTO report_jobs (
                id, kind, format, parameters, status, attempts, max_attempts,
                result_reference, error, schedule, not_before,
                requested_by, requested_at, completed_at, duration_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#;

        sqlx::query(q)
            .bind(job.id.to_string())
            .bind(job.kind.as_str())
            .bind(job.format.as_str())
            .bind(serde_json::to_string(&job.parameters)?)
            .bind(job.status.as_str())
            .bind(job.attempts as i64)
            .bind(job.max_attempts as i64)
            .bind(job.result_reference.clone())
            .bind(job.error.clone())
            .bind(schedule_json(job)?)
            .bind(job.not_before.map(|t| t.to_rfc3339()))
            .bind(job.requested_by.to_string())
            .bind(job.requested_at.to_rfc3339())
            .bind(job.completed_at.map(|t| t.to_rfc3339()))
            .bind(job.duration_ms)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: ReportJobId) -> Result<Option<ReportJob>> {
        debug!(target: "store", job_id = %id, "fetching report job");
        let row = sqlx::query("SELECT * FROM report_jobs WHERE id = ? LIMIT 1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    async fn list_by_requester(
        &self,
        requested_by: RequesterId,
        status: Option<ReportStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReportJob>> {
        debug!(target: "store", requester = %requested_by, ?status, limit, offset, "listing report jobs");
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    r#"SELECT * FROM report_jobs
                       WHERE requested_by = ? AND status = ?
                       ORDER BY requested_at DESC LIMIT ? OFFSET ?"#,
                )
                .bind(requested_by.to_string())
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"SELECT * FROM report_jobs
                       WHERE requested_by = ?
                       ORDER BY requested_at DESC LIMIT ? OFFSET ?"#,
                )
                .bind(requested_by.to_string())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_job).collect()
    }

    async fn list_queued(&self) -> Result<Vec<ReportJob>> {
        let rows = sqlx::query(
            "SELECT * FROM report_jobs WHERE status = 'queued' ORDER BY requested_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn claim(&self, id: ReportJobId, now: DateTime<Utc>) -> Result<Option<ReportJob>> {
        // The conditional UPDATE is the mutual-exclusion point: exactly one
        // concurrent claim can flip the row out of `queued`.
        let result = sqlx::query(
            r#"UPDATE report_jobs
               SET status = 'generating', attempts = attempts + 1, not_before = NULL
               WHERE id = ? AND status = 'queued'
                 AND (not_before IS NULL OR not_before <= ?)"#,
        )
        .bind(id.to_string())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(target: "store", job_id = %id, "claim lost, job not queued or not due");
            return Ok(None);
        }
        self.get(id).await
    }

    async fn update_after_claim(&self, job: &ReportJob) -> Result<()> {
        debug!(target: "store", job_id = %job.id, status = %job.status, "persisting attempt outcome");
        let q = r#"
            UPDATE report_jobs SET
                status = ?,
                attempts = ?,
                result_reference = ?,
                error = ?,
                schedule = ?,
                not_before = ?,
                completed_at = ?,
                duration_ms = ?
            WHERE id = ? AND status = 'generating'
        "#;

        let result = sqlx::query(q)
            .bind(job.status.as_str())
            .bind(job.attempts as i64)
            .bind(job.result_reference.clone())
            .bind(job.error.clone())
            .bind(schedule_json(job)?)
            .bind(job.not_before.map(|t| t.to_rfc3339()))
            .bind(job.completed_at.map(|t| t.to_rfc3339()))
            .bind(job.duration_ms)
            .bind(job.id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("report job {} is not in generating state", job.id));
        }
        Ok(())
    }

    async fn cancel(&self, id: ReportJobId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE report_jobs SET status = 'cancelled' WHERE id = ? AND status = 'queued'",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn schedule_json(job: &ReportJob) -> Result<Option<String>> {
    job.schedule
        .as_ref()
        .map(|s| serde_json::to_string(s).map_err(Into::into))
        .transpose()
}

fn row_to_job(row: &SqliteRow) -> Result<ReportJob> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let format: String = row.try_get("format")?;
    let parameters: String = row.try_get("parameters")?;
    let status: String = row.try_get("status")?;
    let attempts: i64 = row.try_get("attempts")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;
    let result_reference: Option<String> = row.try_get("result_reference")?;
    let error: Option<String> = row.try_get("error")?;
    let schedule: Option<String> = row.try_get("schedule")?;
    let not_before: Option<String> = row.try_get("not_before")?;
    let requested_by: String = row.try_get("requested_by")?;
    let requested_at: String = row.try_get("requested_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    let duration_ms: Option<i64> = row.try_get("duration_ms")?;

    let parameters: ReportParameters = serde_json::from_str(&parameters)?;
    let schedule: Option<RecurringSchedule> = schedule
        .map(|s| serde_json::from_str(&s))
        .transpose()?;

    Ok(ReportJob {
        id: ReportJobId::from_uuid(Uuid::parse_str(&id)?),
        kind: ReportKind::new(kind),
        format: ReportFormat::parse(&format)
            .ok_or_else(|| anyhow!("unknown report format in store: {format}"))?,
        parameters,
        status: ReportStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown report status in store: {status}"))?,
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        result_reference,
        error,
        schedule,
        not_before: parse_timestamp_opt(not_before.as_deref())?,
        requested_by: RequesterId::from_uuid(Uuid::parse_str(&requested_by)?),
        requested_at: parse_timestamp(&requested_at)?,
        completed_at: parse_timestamp_opt(completed_at.as_deref())?,
        duration_ms,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn parse_timestamp_opt(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(parse_timestamp).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use crewdesk_domain::DateRange;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteReportJobStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .expect("migrations");
        SqliteReportJobStore::new(pool)
    }

    fn job() -> ReportJob {
        ReportJob::new(
            RequesterId::new(),
            ReportKind::new("payroll_export"),
            ReportFormat::Json,
            ReportParameters::new(DateRange::new(
                NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            )),
        )
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let store = store().await;
        let job = job();
        store.insert(&job).await.unwrap();

        let fetched = store.get(job.id).await.unwrap().expect("job exists");
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.kind, job.kind);
        assert_eq!(fetched.status, ReportStatus::Queued);
        assert_eq!(fetched.parameters, job.parameters);
    }

    #[tokio::test]
    async fn claim_flips_status_and_counts_attempt() {
        let store = store().await;
        let job = job();
        store.insert(&job).await.unwrap();

        let claimed = store.claim(job.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.status, ReportStatus::Generating);
        assert_eq!(claimed.attempts, 1);

        // Second claim on the same id must lose.
        assert!(store.claim(job.id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_respects_dispatch_gate() {
        let store = store().await;
        let mut job = job();
        job.not_before = Some(Utc::now() + chrono::Duration::hours(1));
        store.insert(&job).await.unwrap();

        assert!(store.claim(job.id, Utc::now()).await.unwrap().is_none());
        let later = Utc::now() + chrono::Duration::hours(2);
        assert!(store.claim(job.id, later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_after_claim_persists_outcome() {
        let store = store().await;
        let job = job();
        store.insert(&job).await.unwrap();

        let mut claimed = store.claim(job.id, Utc::now()).await.unwrap().unwrap();
        let now = Utc::now();
        claimed
            .complete("reports/x.json".to_string(), now, 42)
            .unwrap();
        store.update_after_claim(&claimed).await.unwrap();

        let fetched = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ReportStatus::Completed);
        assert_eq!(fetched.result_reference.as_deref(), Some("reports/x.json"));
        assert_eq!(fetched.duration_ms, Some(42));
    }

    #[tokio::test]
    async fn update_without_claim_is_rejected() {
        let store = store().await;
        let mut job = job();
        store.insert(&job).await.unwrap();
        // Never claimed; forging a completed row must fail.
        job.status = ReportStatus::Completed;
        assert!(store.update_after_claim(&job).await.is_err());
    }

    #[tokio::test]
    async fn cancel_only_queued_jobs() {
        let store = store().await;
        let job = job();
        store.insert(&job).await.unwrap();
        assert!(store.cancel(job.id).await.unwrap());

        // Cancelled jobs cannot be claimed afterwards.
        assert!(store.claim(job.id, Utc::now()).await.unwrap().is_none());
        // Cancel is not idempotent: the CAS reports no transition.
        assert!(!store.cancel(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn list_by_requester_filters_status() {
        let store = store().await;
        let requester = RequesterId::new();

        let mut queued = job();
        queued.requested_by = requester;
        store.insert(&queued).await.unwrap();

        let mut other = job();
        other.requested_by = requester;
        store.insert(&other).await.unwrap();
        store.claim(other.id, Utc::now()).await.unwrap();

        let all = store
            .list_by_requester(requester, None, 50, 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let queued_only = store
            .list_by_requester(requester, Some(ReportStatus::Queued), 50, 0)
            .await
            .unwrap();
        assert_eq!(queued_only.len(), 1);
        assert_eq!(queued_only[0].id, queued.id);

        // Other requesters see nothing.
        let stranger = store
            .list_by_requester(RequesterId::new(), None, 50, 0)
            .await
            .unwrap();
        assert!(stranger.is_empty());
    }

    #[tokio::test]
    async fn schedule_survives_round_trip() {
        let store = store().await;
        let schedule = RecurringSchedule::daily(
            chrono::NaiveTime::from_hms_opt(6, 0, 0),
            "Europe/Madrid",
            vec!["payroll@example.com".to_string()],
        );
        let job = job().with_schedule(schedule.clone());
        store.insert(&job).await.unwrap();

        let fetched = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.schedule, Some(schedule));
    }
}
