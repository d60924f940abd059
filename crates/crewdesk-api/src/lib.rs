// SPDX-License-Identifier: GPL-3.0-or-later
pub mod handlers;
pub mod middleware;

use axum::{middleware as axum_middleware, routing::get, routing::post, Json, Router};
use crewdesk_application::AppState;
use handlers::reports::{
    cancel_report, create_report, get_report, list_reports, schedule_report, CreateReportRequest,
    ErrorResponse, ReportResponse, ScheduleReportRequest, ScheduleSpec, __path_cancel_report,
    __path_create_report, __path_get_report, __path_list_reports, __path_schedule_report,
};
use middleware::auth::auth_middleware;
use serde::Serialize;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(Serialize, utoipa::ToSchema)]
struct HealthResponse {
    status: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
#[allow(dead_code)]
async fn health() -> Json<HealthResponse> {
    health_handler().await
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        create_report,
        schedule_report,
        list_reports,
        get_report,
        cancel_report,
    ),
    components(
        schemas(
            HealthResponse,
            CreateReportRequest,
            ScheduleReportRequest,
            ScheduleSpec,
            ReportResponse,
            ErrorResponse,
        )
    ),
    tags(
        (name = "system", description = "System health and status endpoints"),
        (name = "reports", description = "Asynchronous report generation endpoints")
    ),
    info(
        title = "Crewdesk API",
        version = "0.1.0",
        description = "Back-office report generation service for staffing agencies",
    )
)]
struct ApiDoc;

pub fn router(state: AppState) -> Router {
    info!(target: "api", "building router");

    let api_v1 = Router::new()
        .route("/reports", get(list_reports).post(create_report))
        .route("/reports/schedule", post(schedule_report))
        .route("/reports/:id", get(get_report).delete(cancel_report))
        .layer(axum_middleware::from_fn(auth_middleware));

    let openapi = ApiDoc::openapi();

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api/v1", api_v1)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", openapi))
        .with_state(state)
}
