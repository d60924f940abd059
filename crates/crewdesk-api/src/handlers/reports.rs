// SPDX-License-Identifier: GPL-3.0-or-later
use std::str::FromStr;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{NaiveDate, NaiveTime, Weekday};
use crewdesk_application::{AppState, ReportServiceError, ReportView};
use crewdesk_domain::{
    DateRange, Frequency, RecurringSchedule, ReportFormat, ReportJob, ReportJobId, ReportKind,
    ReportParameters, ReportStatus, RequesterId,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateReportRequest {
    pub kind: String,
    pub format: String,
    /// Inclusive range start, ISO date (YYYY-MM-DD).
    pub start_date: String,
    /// Inclusive range end, ISO date (YYYY-MM-DD).
    pub end_date: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub filters: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ScheduleSpec {
    /// One of "daily", "weekly", "monthly".
    pub frequency: String,
    /// Weekday name, required for weekly schedules.
    pub day_of_week: Option<String>,
    /// 1-31, required for monthly schedules.
    pub day_of_month: Option<u32>,
    /// Local wall-clock time (HH:MM or HH:MM:SS); midnight when absent.
    pub time_of_day: Option<String>,
    /// IANA timezone name; UTC when absent.
    pub timezone: Option<String>,
    pub recipients: Vec<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ScheduleReportRequest {
    #[serde(flatten)]
    pub report: CreateReportRequest,
    pub schedule: ScheduleSpec,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListReportsQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    pub status: Option<String>,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReportResponse {
    pub id: String,
    pub kind: String,
    pub format: String,
    pub status: String,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recurring: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<String>,
    pub requested_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl ReportResponse {
    fn from_job(job: ReportJob, result_url: Option<String>) -> Self {
        Self {
            id: job.id.to_string(),
            kind: job.kind.as_str().to_string(),
            format: job.format.as_str().to_string(),
            status: job.status.to_string(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            result_url,
            error: job.error,
            recurring: job.schedule.is_some(),
            next_run: job
                .schedule
                .as_ref()
                .and_then(|s| s.next_run)
                .map(|t| t.to_rfc3339()),
            requested_at: job.requested_at.to_rfc3339(),
            completed_at: job.completed_at.map(|t| t.to_rfc3339()),
            duration_ms: job.duration_ms,
        }
    }
}

impl From<ReportJob> for ReportResponse {
    fn from(job: ReportJob) -> Self {
        Self::from_job(job, None)
    }
}

impl From<ReportView> for ReportResponse {
    fn from(view: ReportView) -> Self {
        Self::from_job(view.job, view.result_url)
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// Error mapping
// ============================================================================

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }
}

impl From<ReportServiceError> for ApiError {
    fn from(err: ReportServiceError) -> Self {
        let status = match &err {
            ReportServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ReportServiceError::NotFound => StatusCode::NOT_FOUND,
            ReportServiceError::InvalidState(_) => StatusCode::CONFLICT,
            ReportServiceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

// ============================================================================
// Conversions
// ============================================================================

/// Caller identity, carried in the `X-Requester-Id` header until the auth
/// stub grows token-backed identities.
fn requester_from_headers(headers: &HeaderMap) -> Result<RequesterId, ApiError> {
    let raw = headers
        .get("X-Requester-Id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing X-Requester-Id header"))?;
    let uuid = Uuid::parse_str(raw)
        .map_err(|_| ApiError::unauthorized("X-Requester-Id is not a valid UUID"))?;
    Ok(RequesterId::from_uuid(uuid))
}

fn parse_report_id(raw: &str) -> Result<ReportJobId, ApiError> {
    Uuid::parse_str(raw)
        .map(ReportJobId::from_uuid)
        .map_err(|_| ApiError::bad_request(format!("malformed report id: {raw}")))
}

fn parse_request(
    request: &CreateReportRequest,
) -> Result<(ReportKind, ReportFormat, ReportParameters), ApiError> {
    let format = ReportFormat::parse(&request.format)
        .ok_or_else(|| ApiError::bad_request(format!("unknown format: {}", request.format)))?;
    let start = parse_date(&request.start_date)?;
    let end = parse_date(&request.end_date)?;
    let mut parameters = ReportParameters::new(DateRange::new(start, end));
    parameters.filters = request.filters.clone();
    Ok((ReportKind::new(request.kind.clone()), format, parameters))
}

fn parse_date(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::from_str(raw)
        .map_err(|_| ApiError::bad_request(format!("malformed date: {raw}, expected YYYY-MM-DD")))
}

fn parse_schedule(spec: &ScheduleSpec) -> Result<RecurringSchedule, ApiError> {
    let frequency = match spec.frequency.as_str() {
        "daily" => Frequency::Daily,
        "weekly" => Frequency::Weekly,
        "monthly" => Frequency::Monthly,
        other => {
            return Err(ApiError::bad_request(format!(
                "unknown frequency: {other}, expected daily, weekly or monthly"
            )))
        }
    };
    let day_of_week = spec
        .day_of_week
        .as_deref()
        .map(|raw| {
            Weekday::from_str(raw)
                .map_err(|_| ApiError::bad_request(format!("malformed day_of_week: {raw}")))
        })
        .transpose()?;
    let time_of_day = spec
        .time_of_day
        .as_deref()
        .map(parse_time)
        .transpose()?;
    let timezone = spec.timezone.clone().unwrap_or_else(|| "UTC".to_string());

    Ok(RecurringSchedule {
        frequency,
        day_of_week,
        day_of_month: spec.day_of_month,
        time_of_day,
        timezone,
        recipients: spec.recipients.clone(),
        next_run: None,
        last_run: None,
    })
}

fn parse_time(raw: &str) -> Result<NaiveTime, ApiError> {
    NaiveTime::from_str(raw)
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|_| ApiError::bad_request(format!("malformed time_of_day: {raw}")))
}

// ============================================================================
// Handlers
// ============================================================================

/// Queue a one-off report for asynchronous generation.
#[utoipa::path(
    post,
    path = "/api/v1/reports",
    request_body = CreateReportRequest,
    responses(
        (status = 202, description = "Report queued", body = ReportResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 401, description = "Missing requester identity", body = ErrorResponse)
    ),
    tag = "reports"
)]
pub async fn create_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateReportRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let requester = requester_from_headers(&headers)?;
    let (kind, format, parameters) = parse_request(&request)?;
    debug!(target: "api", %requester, kind = kind.as_str(), "report requested");

    let job = state
        .reports
        .request_report(requester, kind, format, parameters)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ReportResponse::from(job))))
}

/// Register a recurring report schedule. The first cycle is queued
/// immediately, gated on the schedule's next local occurrence.
#[utoipa::path(
    post,
    path = "/api/v1/reports/schedule",
    request_body = ScheduleReportRequest,
    responses(
        (status = 202, description = "Recurring report scheduled", body = ReportResponse),
        (status = 400, description = "Invalid request or schedule", body = ErrorResponse),
        (status = 401, description = "Missing requester identity", body = ErrorResponse)
    ),
    tag = "reports"
)]
pub async fn schedule_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ScheduleReportRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let requester = requester_from_headers(&headers)?;
    let (kind, format, parameters) = parse_request(&request.report)?;
    let schedule = parse_schedule(&request.schedule)?;
    debug!(
        target: "api",
        %requester,
        kind = kind.as_str(),
        frequency = %schedule.frequency,
        "recurring report requested"
    );

    let job = state
        .reports
        .schedule_report(requester, kind, format, parameters, schedule)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ReportResponse::from(job))))
}

/// List the requester's report jobs, newest first.
#[utoipa::path(
    get,
    path = "/api/v1/reports",
    params(ListReportsQuery),
    responses(
        (status = 200, description = "Report jobs for the requester", body = Vec<ReportResponse>),
        (status = 400, description = "Invalid status filter", body = ErrorResponse),
        (status = 401, description = "Missing requester identity", body = ErrorResponse)
    ),
    tag = "reports"
)]
pub async fn list_reports(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListReportsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let requester = requester_from_headers(&headers)?;
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            ReportStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status: {raw}")))
        })
        .transpose()?;

    let jobs = state
        .reports
        .list_reports(requester, status, query.limit.clamp(1, 500), query.offset.max(0))
        .await?;
    let body: Vec<ReportResponse> = jobs.into_iter().map(ReportResponse::from).collect();
    Ok(Json(body))
}

/// Fetch a single report job. Completed jobs carry a freshly resolved,
/// time-limited result URL.
#[utoipa::path(
    get,
    path = "/api/v1/reports/{id}",
    params(
        ("id" = String, Path, description = "Report job ID")
    ),
    responses(
        (status = 200, description = "Report job", body = ReportResponse),
        (status = 404, description = "Unknown report job", body = ErrorResponse),
        (status = 401, description = "Missing requester identity", body = ErrorResponse)
    ),
    tag = "reports"
)]
pub async fn get_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let requester = requester_from_headers(&headers)?;
    let id = parse_report_id(&id)?;

    let view = state.reports.get_report(id, requester).await?;
    Ok(Json(ReportResponse::from(view)))
}

/// Cancel a queued report job. Jobs already generating or finished are
/// rejected with a conflict.
#[utoipa::path(
    delete,
    path = "/api/v1/reports/{id}",
    params(
        ("id" = String, Path, description = "Report job ID")
    ),
    responses(
        (status = 204, description = "Report cancelled"),
        (status = 404, description = "Unknown report job", body = ErrorResponse),
        (status = 409, description = "Job is not cancellable in its current state", body = ErrorResponse),
        (status = 401, description = "Missing requester identity", body = ErrorResponse)
    ),
    tag = "reports"
)]
pub async fn cancel_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let requester = requester_from_headers(&headers)?;
    let id = parse_report_id(&id)?;

    state.reports.cancel_report(id, requester).await?;
    Ok(StatusCode::NO_CONTENT)
}
