// SPDX-License-Identifier: GPL-3.0-or-later
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::serve;
use crewdesk_api::router;
use crewdesk_application::{
    AppState, GeneratorRegistry, PayrollExportGenerator, PlacementActivityGenerator,
    ReportService, TimesheetSummaryGenerator,
};
use crewdesk_config::load as load_config;
use crewdesk_dispatch::Dispatcher;
use crewdesk_infrastructure::{
    init_database, FsResultSink, SqliteReportJobStore, TracingNotificationSink,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path.as_deref())?;

    let pool = init_database(&config).await?;
    let store = Arc::new(SqliteReportJobStore::new(pool));
    let result_sink = Arc::new(FsResultSink::new(
        config.reports.result_dir.clone(),
        config.reports.result_base_url.clone(),
    ));
    let notifications = Arc::new(TracingNotificationSink);

    let mut registry = GeneratorRegistry::new();
    registry.register(TimesheetSummaryGenerator::default());
    registry.register(PayrollExportGenerator::default());
    registry.register(PlacementActivityGenerator::default());
    let registry = Arc::new(registry);

    let dispatcher = Dispatcher::new(
        config.dispatch.clone(),
        store.clone(),
        registry.clone(),
        result_sink.clone(),
        notifications,
    );
    let started = dispatcher.start().await?;
    info!(target: "cli", mode = ?started.mode, "dispatch backend running");

    let reports = ReportService::new(
        config.clone(),
        store,
        started.handle.clone(),
        result_sink,
        registry,
    );
    let state = AppState::new(config.clone(), Arc::new(reports));
    state.on_start();

    let listener = TcpListener::bind(bind_addr(&config.http)).await?;
    let addr = listener.local_addr()?;
    info!(target: "cli", "listening on {}", addr);

    serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn init_tracing() {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn bind_addr(http: &crewdesk_config::HttpConfig) -> SocketAddr {
    let addr = format!("{}:{}", http.host, http.port);
    addr.parse().expect("valid listen address")
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .expect("install SIGINT handler");

    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("install SIGTERM handler");

    #[cfg(not(unix))]
    let interrupt = tokio::signal::ctrl_c();

    #[cfg(unix)]
    tokio::select! {
        _ = interrupt.recv() => {},
        _ = terminate.recv() => {},
    }

    #[cfg(not(unix))]
    {
        interrupt.await.expect("ctrl_c handler");
    }

    info!(target: "cli", "shutdown signal received");
}
