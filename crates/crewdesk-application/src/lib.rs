// SPDX-License-Identifier: GPL-3.0-or-later
use crewdesk_config::AppConfig;
use std::sync::Arc;

pub mod generators;
pub mod ports;
pub mod registry;
pub mod service;

pub use generators::{
    EmptyRowProvider, PayrollExportGenerator, PlacementActivityGenerator, RowProvider,
    TimesheetSummaryGenerator,
};
pub use ports::{JobDispatcher, NullDispatcher, ReportGenerator};
pub use registry::GeneratorRegistry;
pub use service::{ReportService, ReportServiceError, ReportView, ServiceResult};

use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub reports: Arc<ReportService>,
}

impl AppState {
    pub fn new(config: AppConfig, reports: Arc<ReportService>) -> Self {
        Self { config, reports }
    }

    pub fn on_start(&self) {
        info!(target: "application", "application state initialized");
    }
}
