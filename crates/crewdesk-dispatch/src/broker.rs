// SPDX-License-Identifier: GPL-3.0-or-later
//! Broker-backed dispatch: a push queue feeds a bounded worker pool.
//!
//! The transport here is an in-process channel standing in for an external
//! message broker. Delivery acknowledgement is implicit: a message is
//! consumed only once its job reaches a terminal or requeued state, and
//! retries/recurring cycles are re-published as delayed deliveries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use crewdesk_domain::ReportJobId;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::executor::JobExecutor;

/// Connected broker transport: the publish side and the consume side of
/// the job-ready queue.
pub struct BrokerConnection {
    pub(crate) tx: mpsc::UnboundedSender<ReportJobId>,
    pub(crate) rx: mpsc::UnboundedReceiver<ReportJobId>,
}

/// In-process broker transport. `connect` is where an external broker
/// would dial out; the dispatcher treats a failure here as "broker
/// unreachable" and sticks to fallback mode for the process lifetime.
pub struct InProcessBroker;

impl InProcessBroker {
    pub fn connect() -> anyhow::Result<BrokerConnection> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(BrokerConnection { tx, rx })
    }
}

/// Publish a job-ready message, delayed until `not_before` when set.
pub(crate) fn publish(
    tx: &mpsc::UnboundedSender<ReportJobId>,
    job_id: ReportJobId,
    not_before: Option<DateTime<Utc>>,
) {
    let delay = not_before
        .map(|t| t - Utc::now())
        .and_then(|d| d.to_std().ok());
    match delay {
        Some(delay) if !delay.is_zero() => {
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if tx.send(job_id).is_err() {
                    warn!(target: "dispatch", %job_id, "broker queue closed, dropping delayed delivery");
                }
            });
        }
        _ => {
            if tx.send(job_id).is_err() {
                warn!(target: "dispatch", %job_id, "broker queue closed, dropping delivery");
            }
        }
    }
}

pub struct BrokerBackend {
    executor: Arc<JobExecutor>,
    worker_count: usize,
}

impl BrokerBackend {
    pub fn new(executor: Arc<JobExecutor>, worker_count: usize) -> Self {
        Self {
            executor,
            worker_count,
        }
    }

    /// Consume job-ready messages with a bounded worker pool. Follow-ups
    /// (retries, next recurring cycles) are re-published to the queue.
    pub fn start(self, connection: BrokerConnection) -> JoinHandle<()> {
        let BrokerConnection { tx, mut rx } = connection;
        let worker_count = self.worker_count;
        let executor = self.executor;

        tokio::spawn(async move {
            info!(target: "dispatch", worker_count, "broker dispatch loop started");
            let semaphore = Arc::new(Semaphore::new(worker_count));

            while let Some(job_id) = rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let executor = executor.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    for follow_up in executor.execute(job_id).await {
                        publish(&tx, follow_up.job_id, follow_up.not_before);
                    }
                });
            }
            info!(target: "dispatch", "broker queue closed, dispatch loop exiting");
        })
    }
}
