// SPDX-License-Identifier: GPL-3.0-or-later
pub mod memory_store;
pub mod sinks;
pub mod sqlite_store;
pub mod stores;

use anyhow::Result;
use crewdesk_config::AppConfig;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

pub use memory_store::InMemoryReportJobStore;
pub use sinks::{
    FsResultSink, NotificationSink, RecordingNotificationSink, ResultSink,
    TracingNotificationSink,
};
pub use sqlite_store::SqliteReportJobStore;
pub use stores::ReportJobStore;

/// Open the SQLite pool and run pending migrations.
pub async fn init_database(config: &AppConfig) -> Result<SqlitePool> {
    info!(target: "infrastructure", "initializing database");

    // Normalize the database URL for SQLite on Windows
    let db_url = if config.database.url.starts_with("sqlite://")
        && !config.database.url.starts_with("sqlite://:memory:")
    {
        let db_path = config.database.url.trim_start_matches("sqlite://");
        let path = Path::new(db_path);

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
                info!(target: "infrastructure", path = %parent.display(), "created database directory");
            }
        }

        let absolute_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };

        // Forward slashes work on all platforms; add create mode so SQLite
        // can create the file on first run.
        let path_str = absolute_path.to_string_lossy().replace('\\', "/");
        format!("sqlite://{}?mode=rwc", path_str)
    } else {
        config.database.url.clone()
    };

    info!(target: "infrastructure", db_url = %db_url, "connecting to database");

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.pool_max_size)
        .connect(&db_url)
        .await?;

    info!(target: "infrastructure", "running migrations");
    sqlx::migrate!("../../migrations").run(&pool).await?;

    info!(target: "infrastructure", "database initialized successfully");
    Ok(pool)
}
