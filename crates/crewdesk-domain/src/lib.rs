// SPDX-License-Identifier: GPL-3.0-or-later
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod schedule;

pub use schedule::{Frequency, RecurringSchedule, ScheduleError};

// ============================================================================
// Value Objects & IDs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportJobId(pub Uuid);

impl ReportJobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ReportJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReportJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequesterId(pub Uuid);

impl RequesterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for RequesterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequesterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Report type identifier. Opaque to the pipeline; it only selects which
/// generator runs. The registry in the application layer maps kinds to
/// generator implementations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportKind(String);

impl ReportKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReportKind {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Pdf,
    Excel,
    Csv,
    Json,
}

impl ReportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportFormat::Pdf => "pdf",
            ReportFormat::Excel => "excel",
            ReportFormat::Csv => "csv",
            ReportFormat::Json => "json",
        }
    }

    /// File extension used by result storage.
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Pdf => "pdf",
            ReportFormat::Excel => "xlsx",
            ReportFormat::Csv => "csv",
            ReportFormat::Json => "json",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pdf" => Some(ReportFormat::Pdf),
            "excel" => Some(ReportFormat::Excel),
            "csv" => Some(ReportFormat::Csv),
            "json" => Some(ReportFormat::Json),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// Inclusive reporting period. Every report request carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn span_days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    /// Checks ordering and the configured maximum span.
    pub fn validate(&self, max_span_days: i64) -> Result<(), String> {
        if self.end < self.start {
            return Err(format!(
                "date range start {} is after end {}",
                self.start, self.end
            ));
        }
        if self.span_days() > max_span_days {
            return Err(format!(
                "date range spans {} days, maximum is {}",
                self.span_days(),
                max_span_days
            ));
        }
        Ok(())
    }
}

/// Parameter bag handed through to the generator. The pipeline only
/// interprets the date range; filters are opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportParameters {
    pub range: DateRange,
    #[serde(default)]
    pub filters: serde_json::Map<String, serde_json::Value>,
}

impl ReportParameters {
    pub fn new(range: DateRange) -> Self {
        Self {
            range,
            filters: serde_json::Map::new(),
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.filters.insert(key.into(), value);
        self
    }
}

// ============================================================================
// Status & State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Queued,
    Generating,
    Completed,
    Failed,
    Cancelled,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Queued => "queued",
            ReportStatus::Generating => "generating",
            ReportStatus::Completed => "completed",
            ReportStatus::Failed => "failed",
            ReportStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(ReportStatus::Queued),
            "generating" => Some(ReportStatus::Generating),
            "completed" => Some(ReportStatus::Completed),
            "failed" => Some(ReportStatus::Failed),
            "cancelled" => Some(ReportStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal jobs never mutate again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReportStatus::Completed | ReportStatus::Failed | ReportStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid report status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ReportStatus,
    pub to: ReportStatus,
}

// ============================================================================
// ReportJob
// ============================================================================

/// One unit of report-generation work. Created by the report service,
/// mutated only by the dispatch backend and explicit cancel calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportJob {
    pub id: ReportJobId,
    pub kind: ReportKind,
    pub format: ReportFormat,
    pub parameters: ReportParameters,
    pub status: ReportStatus,
    /// Execution attempts so far; incremented when a worker claims the job.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Storage reference, present once the job completes.
    pub result_reference: Option<String>,
    /// Last execution error, present on retryable or terminal failure.
    pub error: Option<String>,
    /// Recurrence template. Presence makes the job recurring.
    pub schedule: Option<RecurringSchedule>,
    /// Dispatch gate: the job must not be claimed before this instant.
    /// Used for recurring cycles and retry backoff. Absent = due now.
    pub not_before: Option<DateTime<Utc>>,
    pub requested_by: RequesterId,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

impl ReportJob {
    pub fn new(
        requested_by: RequesterId,
        kind: ReportKind,
        format: ReportFormat,
        parameters: ReportParameters,
    ) -> Self {
        Self {
            id: ReportJobId::new(),
            kind,
            format,
            parameters,
            status: ReportStatus::Queued,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            result_reference: None,
            error: None,
            schedule: None,
            not_before: None,
            requested_by,
            requested_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn with_schedule(mut self, schedule: RecurringSchedule) -> Self {
        self.not_before = schedule.next_run;
        self.schedule = Some(schedule);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn is_recurring(&self) -> bool {
        self.schedule.is_some()
    }

    /// Whether the dispatch gate has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ReportStatus::Queued
            && self.not_before.map(|t| t <= now).unwrap_or(true)
    }

    fn transition(&mut self, to: ReportStatus) -> Result<(), TransitionError> {
        let allowed = matches!(
            (self.status, to),
            (ReportStatus::Queued, ReportStatus::Generating)
                | (ReportStatus::Generating, ReportStatus::Completed)
                | (ReportStatus::Generating, ReportStatus::Queued)
                | (ReportStatus::Generating, ReportStatus::Failed)
                | (ReportStatus::Queued, ReportStatus::Cancelled)
        );
        if !allowed {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Claim the job for execution. Counts the attempt and consumes the
    /// dispatch gate.
    pub fn begin_generation(&mut self) -> Result<(), TransitionError> {
        self.transition(ReportStatus::Generating)?;
        self.attempts += 1;
        self.not_before = None;
        Ok(())
    }

    pub fn complete(
        &mut self,
        reference: String,
        completed_at: DateTime<Utc>,
        duration_ms: i64,
    ) -> Result<(), TransitionError> {
        self.transition(ReportStatus::Completed)?;
        self.result_reference = Some(reference);
        self.error = None;
        self.completed_at = Some(completed_at);
        self.duration_ms = Some(duration_ms);
        Ok(())
    }

    /// Record a failed attempt. Returns to the queue while attempts remain,
    /// otherwise the job fails terminally.
    pub fn record_failure(
        &mut self,
        error: String,
        not_before: Option<DateTime<Utc>>,
        failed_at: DateTime<Utc>,
    ) -> Result<FailureOutcome, TransitionError> {
        if self.attempts < self.max_attempts {
            self.transition(ReportStatus::Queued)?;
            self.error = Some(error);
            self.not_before = not_before;
            Ok(FailureOutcome::Retry)
        } else {
            self.transition(ReportStatus::Failed)?;
            self.error = Some(error);
            self.completed_at = Some(failed_at);
            Ok(FailureOutcome::Exhausted)
        }
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(ReportStatus::Cancelled)
    }

    /// Materialize the next cycle of a recurring job: a fresh instance
    /// sharing kind, format, parameters and the schedule template. The
    /// current instance stays terminal and untouched.
    pub fn next_cycle(&self, now: DateTime<Utc>) -> Option<ReportJob> {
        let schedule = self.schedule.as_ref()?;
        let next = schedule.advanced(now);
        let mut job = ReportJob::new(
            self.requested_by,
            self.kind.clone(),
            self.format,
            self.parameters.clone(),
        )
        .with_max_attempts(self.max_attempts);
        job = job.with_schedule(next);
        Some(job)
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry,
    Exhausted,
}

/// Completion/failure event delivered through the notification sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportNotification {
    pub job_id: ReportJobId,
    pub kind: ReportKind,
    pub recipients: Vec<String>,
    pub outcome: NotificationOutcome,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum NotificationOutcome {
    Completed { reference: String },
    Failed { error: String },
}

impl ReportNotification {
    pub fn completed(job: &ReportJob, reference: String) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind.clone(),
            recipients: job
                .schedule
                .as_ref()
                .map(|s| s.recipients.clone())
                .unwrap_or_default(),
            outcome: NotificationOutcome::Completed { reference },
            occurred_at: Utc::now(),
        }
    }

    pub fn failed(job: &ReportJob, error: String) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind.clone(),
            recipients: job
                .schedule
                .as_ref()
                .map(|s| s.recipients.clone())
                .unwrap_or_default(),
            outcome: NotificationOutcome::Failed { error },
            occurred_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
        )
    }

    fn job() -> ReportJob {
        ReportJob::new(
            RequesterId::new(),
            ReportKind::new("timesheet_summary"),
            ReportFormat::Csv,
            ReportParameters::new(range()),
        )
    }

    #[test]
    fn new_job_is_queued_with_zero_attempts() {
        let job = job();
        assert_eq!(job.status, ReportStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.result_reference.is_none());
        assert!(job.is_due(Utc::now()));
    }

    #[test]
    fn claim_counts_the_attempt() {
        let mut job = job();
        job.begin_generation().unwrap();
        assert_eq!(job.status, ReportStatus::Generating);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn double_claim_is_rejected() {
        let mut job = job();
        job.begin_generation().unwrap();
        let err = job.begin_generation().unwrap_err();
        assert_eq!(err.from, ReportStatus::Generating);
        assert_eq!(err.to, ReportStatus::Generating);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn complete_records_result_and_timing() {
        let mut job = job();
        job.begin_generation().unwrap();
        let now = Utc::now();
        job.complete("reports/abc.csv".to_string(), now, 1234).unwrap();
        assert_eq!(job.status, ReportStatus::Completed);
        assert_eq!(job.result_reference.as_deref(), Some("reports/abc.csv"));
        assert_eq!(job.completed_at, Some(now));
        assert_eq!(job.duration_ms, Some(1234));
    }

    #[test]
    fn failure_with_attempts_remaining_requeues() {
        let mut job = job();
        job.begin_generation().unwrap();
        let outcome = job
            .record_failure("boom".to_string(), None, Utc::now())
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Retry);
        assert_eq!(job.status, ReportStatus::Queued);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn attempts_never_exceed_max() {
        let mut job = job();
        for attempt in 1..=job.max_attempts {
            job.begin_generation().unwrap();
            assert_eq!(job.attempts, attempt);
            job.record_failure("boom".to_string(), None, Utc::now())
                .unwrap();
        }
        assert_eq!(job.status, ReportStatus::Failed);
        assert_eq!(job.attempts, job.max_attempts);
        // Terminal: no further claim possible.
        assert!(job.begin_generation().is_err());
    }

    #[test]
    fn cancel_only_from_queued() {
        let mut queued = job();
        queued.cancel().unwrap();
        assert_eq!(queued.status, ReportStatus::Cancelled);
        assert!(queued.begin_generation().is_err());

        let mut generating = job();
        generating.begin_generation().unwrap();
        assert!(generating.cancel().is_err());

        let mut completed = job();
        completed.begin_generation().unwrap();
        completed
            .complete("r".to_string(), Utc::now(), 1)
            .unwrap();
        assert!(completed.cancel().is_err());
    }

    #[test]
    fn date_range_validation() {
        let ok = range();
        assert!(ok.validate(366).is_ok());

        let inverted = DateRange::new(
            NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        );
        assert!(inverted.validate(366).is_err());

        let too_long = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        );
        assert!(too_long.validate(366).is_err());
    }

    #[test]
    fn next_cycle_is_a_fresh_instance() {
        let schedule = RecurringSchedule::daily(
            chrono::NaiveTime::from_hms_opt(6, 0, 0),
            "UTC",
            vec!["payroll@example.com".to_string()],
        );
        let mut job = job().with_schedule(schedule);
        job.begin_generation().unwrap();
        let now = Utc::now();
        job.complete("r".to_string(), now, 10).unwrap();

        let next = job.next_cycle(now).expect("recurring job arms a cycle");
        assert_ne!(next.id, job.id);
        assert_eq!(next.status, ReportStatus::Queued);
        assert_eq!(next.attempts, 0);
        assert_eq!(next.kind, job.kind);
        assert_eq!(next.parameters, job.parameters);
        let sched = next.schedule.as_ref().unwrap();
        assert_eq!(sched.last_run, Some(now));
        assert!(sched.next_run.unwrap() > now);
        assert_eq!(next.not_before, sched.next_run);
        // Original stays terminal and untouched.
        assert_eq!(job.status, ReportStatus::Completed);
    }

    #[test]
    fn non_recurring_job_has_no_next_cycle() {
        let mut job = job();
        job.begin_generation().unwrap();
        job.complete("r".to_string(), Utc::now(), 1).unwrap();
        assert!(job.next_cycle(Utc::now()).is_none());
    }
}
