// SPDX-License-Identifier: GPL-3.0-or-later
//! Built-in report generators for the staffing back office.
//!
//! Content generation proper (aggregation queries, PDF/Excel rendering) is
//! an external collaborator; these generators render the request manifest
//! and whatever rows their row provider hands them, which is enough to run
//! the pipeline end to end and to exercise every dispatch path.

use crewdesk_domain::{ReportFormat, ReportJob};
use serde_json::json;
use tracing::debug;

use crate::ports::ReportGenerator;

/// Supplies data rows for a reporting period. Injected so the generators
/// stay decoupled from the persistence layer of the surrounding back office.
pub trait RowProvider: Send + Sync {
    fn header(&self) -> Vec<String>;
    fn rows(&self, job: &ReportJob) -> Vec<Vec<String>>;
}

/// Default provider: no data rows, header only. Real deployments plug in a
/// provider backed by the timesheet/payroll stores.
pub struct EmptyRowProvider {
    header: Vec<String>,
}

impl EmptyRowProvider {
    pub fn new(header: &[&str]) -> Self {
        Self {
            header: header.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RowProvider for EmptyRowProvider {
    fn header(&self) -> Vec<String> {
        self.header.clone()
    }

    fn rows(&self, _job: &ReportJob) -> Vec<Vec<String>> {
        Vec::new()
    }
}

fn render(job: &ReportJob, title: &str, provider: &dyn RowProvider) -> anyhow::Result<Vec<u8>> {
    debug!(target: "generators", job_id = %job.id, format = %job.format, "rendering {title}");
    let header = provider.header();
    let rows = provider.rows(job);
    let range = &job.parameters.range;

    let bytes = match job.format {
        ReportFormat::Json => {
            let value = json!({
                "report": title,
                "period": { "start": range.start, "end": range.end },
                "filters": job.parameters.filters,
                "columns": header,
                "rows": rows,
            });
            serde_json::to_vec_pretty(&value)?
        }
        // PDF and Excel rendering are external collaborators; until one is
        // wired in, those formats carry the same tabular payload as CSV.
        ReportFormat::Csv | ReportFormat::Pdf | ReportFormat::Excel => {
            let mut out = String::new();
            out.push_str(&format!("# {title} {} .. {}\n", range.start, range.end));
            out.push_str(&header.join(","));
            out.push('\n');
            for row in rows {
                out.push_str(&row.join(","));
                out.push('\n');
            }
            out.into_bytes()
        }
    };
    Ok(bytes)
}

/// Hours worked per employee over the reporting period.
pub struct TimesheetSummaryGenerator {
    provider: Box<dyn RowProvider>,
}

impl TimesheetSummaryGenerator {
    pub fn new(provider: impl RowProvider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
        }
    }
}

impl Default for TimesheetSummaryGenerator {
    fn default() -> Self {
        Self::new(EmptyRowProvider::new(&[
            "employee",
            "client",
            "hours",
            "overtime_hours",
        ]))
    }
}

#[async_trait::async_trait]
impl ReportGenerator for TimesheetSummaryGenerator {
    fn kind(&self) -> &'static str {
        "timesheet_summary"
    }

    fn name(&self) -> String {
        "Timesheet Summary".to_string()
    }

    async fn generate(&self, job: &ReportJob) -> anyhow::Result<Vec<u8>> {
        render(job, "Timesheet Summary", self.provider.as_ref())
    }
}

/// Gross/net payroll lines for the reporting period.
pub struct PayrollExportGenerator {
    provider: Box<dyn RowProvider>,
}

impl PayrollExportGenerator {
    pub fn new(provider: impl RowProvider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
        }
    }
}

impl Default for PayrollExportGenerator {
    fn default() -> Self {
        Self::new(EmptyRowProvider::new(&[
            "employee",
            "gross_pay",
            "deductions",
            "net_pay",
        ]))
    }
}

#[async_trait::async_trait]
impl ReportGenerator for PayrollExportGenerator {
    fn kind(&self) -> &'static str {
        "payroll_export"
    }

    fn name(&self) -> String {
        "Payroll Export".to_string()
    }

    async fn generate(&self, job: &ReportJob) -> anyhow::Result<Vec<u8>> {
        render(job, "Payroll Export", self.provider.as_ref())
    }
}

/// Placements opened, filled and closed during the reporting period.
pub struct PlacementActivityGenerator {
    provider: Box<dyn RowProvider>,
}

impl PlacementActivityGenerator {
    pub fn new(provider: impl RowProvider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
        }
    }
}

impl Default for PlacementActivityGenerator {
    fn default() -> Self {
        Self::new(EmptyRowProvider::new(&[
            "job_posting",
            "client",
            "opened",
            "filled",
            "status",
        ]))
    }
}

#[async_trait::async_trait]
impl ReportGenerator for PlacementActivityGenerator {
    fn kind(&self) -> &'static str {
        "placement_activity"
    }

    fn name(&self) -> String {
        "Placement Activity".to_string()
    }

    async fn generate(&self, job: &ReportJob) -> anyhow::Result<Vec<u8>> {
        render(job, "Placement Activity", self.provider.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use crewdesk_domain::{DateRange, ReportKind, ReportParameters, RequesterId};

    fn job(format: ReportFormat) -> ReportJob {
        ReportJob::new(
            RequesterId::new(),
            ReportKind::new("timesheet_summary"),
            format,
            ReportParameters::new(DateRange::new(
                NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            )),
        )
    }

    struct FixedRows;

    impl RowProvider for FixedRows {
        fn header(&self) -> Vec<String> {
            vec!["employee".to_string(), "hours".to_string()]
        }

        fn rows(&self, _job: &ReportJob) -> Vec<Vec<String>> {
            vec![vec!["ana".to_string(), "37.5".to_string()]]
        }
    }

    #[tokio::test]
    async fn csv_output_contains_period_and_rows() {
        let generator = TimesheetSummaryGenerator::new(FixedRows);
        let bytes = generator.generate(&job(ReportFormat::Csv)).await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("2025-01-01"));
        assert!(text.contains("employee,hours"));
        assert!(text.contains("ana,37.5"));
    }

    #[tokio::test]
    async fn json_output_is_valid_json() {
        let generator = PayrollExportGenerator::default();
        let bytes = generator.generate(&job(ReportFormat::Json)).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["report"], "Payroll Export");
        assert_eq!(value["period"]["end"], "2025-01-31");
    }

    #[test]
    fn builtin_kinds_are_distinct() {
        let kinds = [
            TimesheetSummaryGenerator::default().kind(),
            PayrollExportGenerator::default().kind(),
            PlacementActivityGenerator::default().kind(),
        ];
        let unique: std::collections::HashSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
    }
}
