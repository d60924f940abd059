// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use crewdesk_domain::{ReportJob, ReportJobId, ReportStatus, RequesterId};
use tracing::warn;

use crate::stores::ReportJobStore;

/// Mutex-guarded in-memory job store. Single-process only: the mutex is
/// what serializes the claim transition here, so running two processes
/// against separate instances loses the exclusivity guarantee.
#[derive(Clone, Default)]
pub struct InMemoryReportJobStore {
    inner: Arc<Mutex<HashMap<ReportJobId, ReportJob>>>,
}

impl InMemoryReportJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ReportJobId, ReportJob>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!(target: "store", "job store mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[async_trait::async_trait]
impl ReportJobStore for InMemoryReportJobStore {
    async fn insert(&self, job: &ReportJob) -> Result<()> {
        let mut jobs = self.lock();
        if jobs.contains_key(&job.id) {
            return Err(anyhow!("report job {} already exists", job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: ReportJobId) -> Result<Option<ReportJob>> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn list_by_requester(
        &self,
        requested_by: RequesterId,
        status: Option<ReportStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReportJob>> {
        let jobs = self.lock();
        let mut matching: Vec<ReportJob> = jobs
            .values()
            .filter(|j| j.requested_by == requested_by)
            .filter(|j| status.map(|s| j.status == s).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        Ok(matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_queued(&self) -> Result<Vec<ReportJob>> {
        let jobs = self.lock();
        let mut queued: Vec<ReportJob> = jobs
            .values()
            .filter(|j| j.status == ReportStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(queued)
    }

    async fn claim(&self, id: ReportJobId, now: DateTime<Utc>) -> Result<Option<ReportJob>> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !job.is_due(now) {
            return Ok(None);
        }
        match job.begin_generation() {
            Ok(()) => Ok(Some(job.clone())),
            Err(_) => Ok(None),
        }
    }

    async fn update_after_claim(&self, job: &ReportJob) -> Result<()> {
        let mut jobs = self.lock();
        match jobs.get(&job.id) {
            Some(current) if current.status == ReportStatus::Generating => {
                jobs.insert(job.id, job.clone());
                Ok(())
            }
            Some(_) => Err(anyhow!("report job {} is not in generating state", job.id)),
            None => Err(anyhow!("report job {} not found", job.id)),
        }
    }

    async fn cancel(&self, id: ReportJobId) -> Result<bool> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        Ok(job.cancel().is_ok())
    }
}
