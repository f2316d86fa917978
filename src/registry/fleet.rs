use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::RegistryConfig;
use crate::error::{Result, VdiError};
use crate::registry::worker::{HeartbeatInput, WorkerNode, WorkerView};

/// Operator request to toggle enable/drain on a worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    #[serde(default)]
    pub is_enabled: Option<bool>,
    #[serde(default)]
    pub is_draining: Option<bool>,
    /// Disable even though sessions are still running on the worker.
    #[serde(default)]
    pub force: bool,
}

/// Fleet-wide counts used by callers for admission pre-checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub total_workers: usize,
    pub healthy_workers: usize,
    pub draining_workers: usize,
    pub drained_workers: usize,
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub available_sessions: u64,
}

/// Tracks worker capacity, load and liveness.
///
/// Liveness is purely time based: a worker is healthy while enabled and its
/// last heartbeat is no older than the configured TTL.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerNode>>,
    config: RegistryConfig,
}

impl WorkerRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn heartbeat_ttl(&self) -> chrono::Duration {
        self.config.heartbeat_ttl()
    }

    pub async fn heartbeat(&self, input: HeartbeatInput) -> Result<WorkerView> {
        self.heartbeat_at(input, Utc::now()).await
    }

    /// Upsert a worker from its heartbeat.
    ///
    /// The reported capacity and session count replace the stored ones. The
    /// operator-owned flags (`is_enabled`, `is_draining`) survive the upsert,
    /// so a heartbeat never undoes an explicit disable or drain.
    pub async fn heartbeat_at(&self, input: HeartbeatInput, now: DateTime<Utc>) -> Result<WorkerView> {
        if input.code.trim().is_empty() {
            return Err(VdiError::InvalidRequest(
                "worker code cannot be empty".to_string(),
            ));
        }

        let ttl = self.heartbeat_ttl();
        let mut workers = self.workers.write().await;
        let mut record = WorkerNode::from_heartbeat(input, now);

        match workers.get(&record.code) {
            Some(existing) => {
                record.is_enabled = existing.is_enabled;
                record.is_draining = existing.is_draining;
                tracing::debug!(
                    worker = %record.code,
                    active = record.active_sessions,
                    max = record.max_sessions,
                    "Worker heartbeat"
                );
            }
            None => {
                tracing::info!(
                    worker = %record.code,
                    max_sessions = record.max_sessions,
                    "Worker registered"
                );
            }
        }

        let view = record.view_at(now, ttl);
        workers.insert(record.code.clone(), record);
        Ok(view)
    }

    pub async fn get(&self, code: &str) -> Option<WorkerView> {
        let now = Utc::now();
        let ttl = self.heartbeat_ttl();
        self.workers
            .read()
            .await
            .get(code)
            .map(|w| w.view_at(now, ttl))
    }

    /// All workers ordered by code.
    pub async fn all_workers(&self) -> Vec<WorkerView> {
        self.all_workers_at(Utc::now()).await
    }

    pub async fn all_workers_at(&self, now: DateTime<Utc>) -> Vec<WorkerView> {
        let ttl = self.heartbeat_ttl();
        let workers = self.workers.read().await;
        let mut views: Vec<WorkerView> = workers.values().map(|w| w.view_at(now, ttl)).collect();
        views.sort_by(|a, b| a.worker.code.cmp(&b.worker.code));
        views
    }

    pub async fn schedulable_workers(&self) -> Vec<WorkerView> {
        self.schedulable_workers_at(Utc::now()).await
    }

    /// Workers that can take a new session right now, best candidate first.
    ///
    /// Ordering: most free slots, then fewest active sessions, then code.
    /// The result is a snapshot; a later claim can still lose a race.
    pub async fn schedulable_workers_at(&self, now: DateTime<Utc>) -> Vec<WorkerView> {
        let ttl = self.heartbeat_ttl();
        let workers = self.workers.read().await;
        rank_schedulable(workers.values(), now, ttl)
            .into_iter()
            .map(|w| w.view_at(now, ttl))
            .collect()
    }

    /// Pick the best schedulable worker and count one more session on it,
    /// both under the same write lock.
    pub async fn claim_slot_at(&self, now: DateTime<Utc>) -> Option<WorkerView> {
        let ttl = self.heartbeat_ttl();
        let mut workers = self.workers.write().await;
        let code = rank_schedulable(workers.values(), now, ttl)
            .first()
            .map(|w| w.code.clone())?;

        let worker = workers.get_mut(&code)?;
        worker.adjust_active_sessions(1);
        tracing::info!(
            worker = %code,
            active = worker.active_sessions,
            max = worker.max_sessions,
            "Session slot claimed"
        );
        Some(worker.view_at(now, ttl))
    }

    /// Adjust a worker's active session count. Returns the new count, or
    /// `None` when the code is unknown (which is not an error).
    pub async fn bump_active_sessions(&self, code: &str, delta: i64) -> Option<u32> {
        let mut workers = self.workers.write().await;
        match workers.get_mut(code) {
            Some(worker) => {
                worker.adjust_active_sessions(delta);
                tracing::debug!(worker = %code, delta, active = worker.active_sessions, "Active sessions adjusted");
                Some(worker.active_sessions)
            }
            None => {
                tracing::debug!(worker = %code, delta, "Ignoring session bump for unknown worker");
                None
            }
        }
    }

    pub async fn set_status(&self, code: &str, change: StatusChange) -> Result<WorkerView> {
        self.set_status_at(code, change, Utc::now()).await
    }

    pub async fn set_status_at(
        &self,
        code: &str,
        change: StatusChange,
        now: DateTime<Utc>,
    ) -> Result<WorkerView> {
        let ttl = self.heartbeat_ttl();
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(code)
            .ok_or_else(|| VdiError::UnknownWorker(code.to_string()))?;

        if change.is_enabled == Some(false)
            && worker.is_enabled
            && worker.active_sessions > 0
        {
            if !change.force {
                return Err(VdiError::WorkerBusy {
                    code: code.to_string(),
                    active_sessions: worker.active_sessions,
                });
            }
            tracing::warn!(
                worker = %code,
                active = worker.active_sessions,
                "Force-disabling worker with running sessions"
            );
        }

        if let Some(enabled) = change.is_enabled {
            worker.is_enabled = enabled;
        }
        if let Some(draining) = change.is_draining {
            worker.is_draining = draining;
        }

        tracing::info!(
            worker = %code,
            enabled = worker.is_enabled,
            draining = worker.is_draining,
            "Worker status changed"
        );
        Ok(worker.view_at(now, ttl))
    }

    pub async fn cluster_summary(&self) -> ClusterSummary {
        self.cluster_summary_at(Utc::now()).await
    }

    /// Counts over the fleet. Capacity figures only include healthy workers,
    /// and available capacity only those not draining.
    pub async fn cluster_summary_at(&self, now: DateTime<Utc>) -> ClusterSummary {
        let ttl = self.heartbeat_ttl();
        let workers = self.workers.read().await;
        let mut summary = ClusterSummary {
            total_workers: workers.len(),
            ..Default::default()
        };

        for worker in workers.values().filter(|w| w.is_healthy_at(now, ttl)) {
            summary.healthy_workers += 1;
            if worker.is_draining {
                if worker.active_sessions == 0 {
                    summary.drained_workers += 1;
                } else {
                    summary.draining_workers += 1;
                }
            } else {
                summary.available_sessions += worker.available_sessions() as u64;
            }
            summary.total_sessions += worker.max_sessions as u64;
            summary.active_sessions += worker.active_sessions as u64;
        }

        summary
    }
}

fn rank_schedulable<'a>(
    workers: impl Iterator<Item = &'a WorkerNode>,
    now: DateTime<Utc>,
    ttl: chrono::Duration,
) -> Vec<&'a WorkerNode> {
    let mut ranked: Vec<&WorkerNode> = workers
        .filter(|w| w.is_schedulable_at(now, ttl))
        .collect();
    ranked.sort_by(|a, b| {
        b.available_sessions()
            .cmp(&a.available_sessions())
            .then_with(|| a.active_sessions.cmp(&b.active_sessions))
            .then_with(|| a.code.cmp(&b.code))
    });
    ranked
}
