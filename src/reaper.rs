//! Periodic reclaim of desktops whose owners went quiet.
//!
//! A desktop is reclaimed when its owner has no activity record at all, or
//! when the latest record is older than the idle timeout. Activity comes from
//! the activity log and from the desktop's own `last_activity_at` stamp,
//! whichever is newer. Each reclaim is followed by a `REVOKE` audit event;
//! that write is bounded by a timeout and its failure is only counted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::activity::{ActivityLog, AuditAction, AuditEvent};
use crate::config::ReaperConfig;
use crate::error::{Result, VdiError};
use crate::pool::{Desktop, DesktopPool};
use crate::session::BindingTable;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub scanned: usize,
    pub reclaimed: Vec<u64>,
    pub audit_failures: usize,
    /// Desktops whose release hit a storage error; retried next sweep.
    pub reclaim_failures: usize,
}

pub struct IdleReaper {
    pool: DesktopPool,
    activity: Arc<dyn ActivityLog>,
    bindings: Option<Arc<BindingTable>>,
    config: ReaperConfig,
}

impl IdleReaper {
    pub fn new(pool: DesktopPool, activity: Arc<dyn ActivityLog>, config: ReaperConfig) -> Self {
        Self {
            pool,
            activity,
            bindings: None,
            config,
        }
    }

    /// Also drop session bindings that point at reclaimed desktops.
    pub fn with_bindings(mut self, bindings: Arc<BindingTable>) -> Self {
        self.bindings = Some(bindings);
        self
    }

    /// Run sweeps on the configured interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.config.sweep_interval().as_secs(),
            idle_timeout_secs = self.config.idle_timeout_secs,
            "Idle reaper started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Idle reaper stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_at(Utc::now()).await {
                        tracing::warn!(error = %e, "Idle sweep failed");
                    }
                }
            }
        }
    }

    /// One pass over the allocated desktops as of `now`.
    ///
    /// A desktop that fails to reclaim is counted and left for the next
    /// sweep; the rest of the pass still runs.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let allocated = self.pool.allocated().await?;
        let mut report = SweepReport {
            scanned: allocated.len(),
            ..Default::default()
        };

        for desktop in allocated {
            let Some(user_id) = desktop.allocated_to_user_id else {
                continue;
            };

            let logged = match self.activity.last_activity(user_id).await {
                Ok(logged) => logged,
                Err(e) => {
                    // Retried next sweep; reclaiming on a failed lookup would evict active users.
                    tracing::warn!(user_id, desktop_id = desktop.id, error = %e, "Activity lookup failed");
                    continue;
                }
            };
            let last_seen = logged.max(desktop.last_activity_at);
            if !self.is_idle(last_seen, now) {
                continue;
            }

            // Someone else may have released or re-claimed it meanwhile.
            match self.pool.reclaim(desktop.id, user_id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(user_id, desktop_id = desktop.id, error = %e, "Failed to reclaim idle desktop");
                    report.reclaim_failures += 1;
                    continue;
                }
            }

            if let Some(ref bindings) = self.bindings {
                bindings.remove_desktop(user_id, desktop.id).await;
            }
            tracing::info!(
                user_id,
                desktop_id = desktop.id,
                last_seen = ?last_seen,
                "Reclaimed idle desktop"
            );
            report.reclaimed.push(desktop.id);

            if !self.write_revoke(&desktop, user_id, last_seen, now).await {
                report.audit_failures += 1;
            }
        }

        if report.reclaimed.is_empty() && report.reclaim_failures == 0 {
            tracing::debug!(scanned = report.scanned, "Idle sweep found nothing to reclaim");
        }
        Ok(report)
    }

    /// Best-effort audit write; `false` if it failed or timed out.
    async fn write_revoke(
        &self,
        desktop: &Desktop,
        user_id: u64,
        last_seen: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let detail = match last_seen {
            Some(at) => format!("idle since {} on desktop {}", at.to_rfc3339(), desktop.id),
            None => format!("no activity on desktop {}", desktop.id),
        };
        let event = AuditEvent::new(user_id, AuditAction::Revoke, now)
            .with_detail(detail)
            .system();

        let outcome = tokio::time::timeout(self.config.audit_timeout(), self.activity.record(event))
            .await
            .unwrap_or_else(|_| Err(VdiError::Storage("audit write timed out".to_string())));

        match outcome {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(user_id, desktop_id = desktop.id, error = %e, "Failed to write revoke event");
                false
            }
        }
    }
}
