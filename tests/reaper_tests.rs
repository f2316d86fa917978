use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use vdi_lite::activity::{ActivityLog, AuditAction, AuditEvent, MemoryActivityLog};
use vdi_lite::config::ReaperConfig;
use vdi_lite::error::{Result, VdiError};
use vdi_lite::pool::{
    Desktop, DesktopId, DesktopPool, DesktopStore, MemoryDesktopStore, NewDesktop, UserId,
};
use vdi_lite::reaper::IdleReaper;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

fn config(idle_timeout_secs: u64) -> ReaperConfig {
    ReaperConfig {
        idle_timeout_secs,
        sweep_interval_secs: 1,
        audit_timeout_ms: 100,
    }
}

async fn pool_with(ports: &[u16]) -> DesktopPool {
    let pool = DesktopPool::in_memory();
    pool.provision(ports.iter().map(|p| NewDesktop::new("10.1.0.30", *p)).collect())
        .await
        .unwrap();
    pool
}

async fn record_activity(log: &MemoryActivityLog, user_id: UserId, at: DateTime<Utc>) {
    log.record(AuditEvent::new(user_id, AuditAction::Activity, at))
        .await
        .unwrap();
}

/// Activity log whose reads work but whose writes always fail.
struct ReadOnlyLog {
    last_seen: Option<DateTime<Utc>>,
}

#[async_trait]
impl ActivityLog for ReadOnlyLog {
    async fn last_activity(&self, _user_id: UserId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.last_seen)
    }

    async fn record(&self, _event: AuditEvent) -> Result<()> {
        Err(VdiError::Storage("audit table is read-only".to_string()))
    }
}

/// Activity log whose writes never finish in time.
struct StalledLog;

#[async_trait]
impl ActivityLog for StalledLog {
    async fn last_activity(&self, _user_id: UserId) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }

    async fn record(&self, _event: AuditEvent) -> Result<()> {
        tokio::time::sleep(StdDuration::from_secs(30)).await;
        Ok(())
    }
}

/// Activity log that cannot be queried at all.
struct UnreachableLog;

#[async_trait]
impl ActivityLog for UnreachableLog {
    async fn last_activity(&self, _user_id: UserId) -> Result<Option<DateTime<Utc>>> {
        Err(VdiError::Storage("connection reset".to_string()))
    }

    async fn record(&self, _event: AuditEvent) -> Result<()> {
        Err(VdiError::Storage("connection reset".to_string()))
    }
}

#[tokio::test]
async fn test_reclaim_survives_audit_failure() {
    let pool = pool_with(&[3389]).await;
    let desktop = pool.allocate_at(1, t0()).await.unwrap();
    let log = Arc::new(ReadOnlyLog {
        last_seen: Some(t0()),
    });
    let reaper = IdleReaper::new(pool.clone(), log, config(600));

    let report = reaper
        .sweep_at(t0() + Duration::seconds(601))
        .await
        .unwrap();

    assert_eq!(report.reclaimed, vec![desktop.id]);
    assert_eq!(report.audit_failures, 1);
    assert!(pool.owned_by(1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_recent_activity_keeps_desktop() {
    let pool = pool_with(&[3389]).await;
    pool.allocate_at(1, t0()).await.unwrap();
    let log = Arc::new(MemoryActivityLog::new());
    record_activity(&log, 1, t0() + Duration::seconds(500)).await;
    let reaper = IdleReaper::new(pool.clone(), log.clone(), config(600));

    let report = reaper
        .sweep_at(t0() + Duration::seconds(1000))
        .await
        .unwrap();

    assert_eq!(report.scanned, 1);
    assert!(report.reclaimed.is_empty());
    assert!(pool.owned_by(1).await.unwrap().is_some());
    assert!(log.events().await.iter().all(|e| e.action != AuditAction::Revoke));
}

#[tokio::test]
async fn test_idle_desktop_is_reclaimed_with_revoke_event() {
    let pool = pool_with(&[3389, 3390]).await;
    let idle = pool.allocate_at(1, t0()).await.unwrap();
    pool.allocate_at(2, t0()).await.unwrap();
    let log = Arc::new(MemoryActivityLog::new());
    record_activity(&log, 1, t0()).await;
    record_activity(&log, 2, t0() + Duration::seconds(900)).await;
    let reaper = IdleReaper::new(pool.clone(), log.clone(), config(600));

    let report = reaper
        .sweep_at(t0() + Duration::seconds(1000))
        .await
        .unwrap();

    assert_eq!(report.reclaimed, vec![idle.id]);
    assert_eq!(report.audit_failures, 0);
    assert!(pool.owned_by(2).await.unwrap().is_some());

    let revokes: Vec<AuditEvent> = log
        .events_for(1)
        .await
        .into_iter()
        .filter(|e| e.action == AuditAction::Revoke)
        .collect();
    assert_eq!(revokes.len(), 1);
    assert!(revokes[0].system);
}

#[tokio::test]
async fn test_user_without_any_activity_is_reclaimed() {
    let pool = pool_with(&[3389]).await;
    pool.allocate_at(1, t0()).await.unwrap();
    let reaper = IdleReaper::new(pool.clone(), Arc::new(MemoryActivityLog::new()), config(600));

    let report = reaper.sweep_at(t0()).await.unwrap();
    assert_eq!(report.reclaimed.len(), 1);
}

#[tokio::test]
async fn test_activity_exactly_at_timeout_is_kept() {
    let pool = pool_with(&[3389]).await;
    pool.allocate_at(1, t0()).await.unwrap();
    let log = Arc::new(MemoryActivityLog::new());
    record_activity(&log, 1, t0()).await;
    let reaper = IdleReaper::new(pool.clone(), log, config(600));

    let report = reaper
        .sweep_at(t0() + Duration::seconds(600))
        .await
        .unwrap();
    assert!(report.reclaimed.is_empty());
}

#[tokio::test]
async fn test_stalled_audit_write_is_bounded() {
    let pool = pool_with(&[3389]).await;
    pool.allocate_at(1, t0()).await.unwrap();
    let reaper = IdleReaper::new(pool.clone(), Arc::new(StalledLog), config(600));

    let report = tokio::time::timeout(StdDuration::from_secs(5), reaper.sweep_at(t0()))
        .await
        .expect("sweep must not wait on the audit write")
        .unwrap();

    assert_eq!(report.reclaimed.len(), 1);
    assert_eq!(report.audit_failures, 1);
}

#[tokio::test]
async fn test_lookup_failure_skips_desktop() {
    let pool = pool_with(&[3389]).await;
    pool.allocate_at(1, t0()).await.unwrap();
    let reaper = IdleReaper::new(pool.clone(), Arc::new(UnreachableLog), config(600));

    let report = reaper
        .sweep_at(t0() + Duration::seconds(3600))
        .await
        .unwrap();
    assert_eq!(report.scanned, 1);
    assert!(report.reclaimed.is_empty());
    assert!(pool.owned_by(1).await.unwrap().is_some());
}

#[tokio::test]
async fn test_run_sweeps_until_cancelled() {
    let pool = pool_with(&[3389]).await;
    pool.allocate(1).await.unwrap();
    let reaper = Arc::new(IdleReaper::new(
        pool.clone(),
        Arc::new(MemoryActivityLog::new()),
        config(600),
    ));

    let cancel = CancellationToken::new();
    let handle = {
        let reaper = reaper.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { reaper.run(cancel).await })
    };

    // First tick fires immediately; the user has no activity record.
    let mut freed = false;
    for _ in 0..50 {
        if pool.owned_by(1).await.unwrap().is_none() {
            freed = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
    assert!(freed, "reaper never reclaimed the desktop");

    cancel.cancel();
    tokio::time::timeout(StdDuration::from_secs(2), handle)
        .await
        .expect("reaper did not stop")
        .unwrap();
}

/// How [`FlakyStore`] misbehaves on its chosen desktop.
#[derive(Clone, Copy)]
enum Flake {
    /// The release keeps failing with a storage error.
    Locked,
    /// The desktop was freed by someone else just before the release.
    AlreadyFreed,
}

/// In-memory store whose conditional release misbehaves for one desktop.
struct FlakyStore {
    inner: MemoryDesktopStore,
    desktop_id: DesktopId,
    flake: Flake,
}

#[async_trait]
impl DesktopStore for FlakyStore {
    async fn insert(&self, desktop: NewDesktop) -> Result<Desktop> {
        self.inner.insert(desktop).await
    }

    async fn list(&self) -> Result<Vec<Desktop>> {
        self.inner.list().await
    }

    async fn find_by_owner(&self, user_id: UserId) -> Result<Option<Desktop>> {
        self.inner.find_by_owner(user_id).await
    }

    async fn claim_lowest_free(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Option<Desktop>> {
        self.inner.claim_lowest_free(user_id, now).await
    }

    async fn release_owned(&self, user_id: UserId) -> Result<Option<Desktop>> {
        self.inner.release_owned(user_id).await
    }

    async fn release_if_owned(&self, desktop_id: DesktopId, user_id: UserId) -> Result<bool> {
        if desktop_id != self.desktop_id {
            return self.inner.release_if_owned(desktop_id, user_id).await;
        }
        match self.flake {
            Flake::Locked => Err(VdiError::Storage(format!("row {} locked", desktop_id))),
            Flake::AlreadyFreed => {
                self.inner.release_owned(user_id).await?;
                Ok(false)
            }
        }
    }

    async fn touch(&self, user_id: UserId, now: DateTime<Utc>) -> Result<bool> {
        self.inner.touch(user_id, now).await
    }
}

async fn flaky_pool(flake: Flake) -> DesktopPool {
    let pool = DesktopPool::new(Arc::new(FlakyStore {
        inner: MemoryDesktopStore::new(),
        desktop_id: 1,
        flake,
    }));
    pool.provision(vec![NewDesktop::new("10.1.0.30", 3389), NewDesktop::new("10.1.0.30", 3390)])
        .await
        .unwrap();
    pool
}

#[tokio::test]
async fn test_failing_reclaim_does_not_block_other_desktops() {
    let pool = flaky_pool(Flake::Locked).await;
    pool.allocate_at(1, t0()).await.unwrap();
    let second = pool.allocate_at(2, t0()).await.unwrap();
    let log = Arc::new(MemoryActivityLog::new());
    let reaper = IdleReaper::new(pool.clone(), log.clone(), config(600));

    for _ in 0..3 {
        reaper
            .sweep_at(t0() + Duration::seconds(3600))
            .await
            .unwrap();
    }
    let report = reaper
        .sweep_at(t0() + Duration::seconds(3600))
        .await
        .unwrap();

    assert_eq!(report.reclaim_failures, 1);
    assert!(pool.owned_by(2).await.unwrap().is_none());
    assert!(pool.owned_by(1).await.unwrap().is_some());

    let revoked: Vec<UserId> = log
        .events()
        .await
        .into_iter()
        .filter(|e| e.action == AuditAction::Revoke)
        .map(|e| e.user_id)
        .collect();
    assert_eq!(revoked, vec![2]);
    assert_eq!(second.id, 2);
}

#[tokio::test]
async fn test_no_revoke_when_desktop_was_already_freed() {
    let pool = flaky_pool(Flake::AlreadyFreed).await;
    pool.allocate_at(1, t0()).await.unwrap();
    let log = Arc::new(MemoryActivityLog::new());
    let reaper = IdleReaper::new(pool.clone(), log.clone(), config(600));

    let report = reaper
        .sweep_at(t0() + Duration::seconds(3600))
        .await
        .unwrap();

    assert!(report.reclaimed.is_empty());
    assert_eq!(report.reclaim_failures, 0);
    assert!(log.events().await.is_empty());
}

#[tokio::test]
async fn test_desktop_activity_stamp_keeps_desktop() {
    let pool = pool_with(&[3389]).await;
    pool.allocate_at(1, t0()).await.unwrap();
    assert!(pool.touch_at(1, t0() + Duration::seconds(500)).await.unwrap());
    // The log knows nothing about this user.
    let reaper = IdleReaper::new(pool.clone(), Arc::new(MemoryActivityLog::new()), config(600));

    let report = reaper
        .sweep_at(t0() + Duration::seconds(1000))
        .await
        .unwrap();
    assert!(report.reclaimed.is_empty());
    assert!(pool.owned_by(1).await.unwrap().is_some());

    let report = reaper
        .sweep_at(t0() + Duration::seconds(1101))
        .await
        .unwrap();
    assert_eq!(report.reclaimed.len(), 1);
}

#[tokio::test]
async fn test_newer_stamp_wins_over_stale_log() {
    let pool = pool_with(&[3389]).await;
    pool.allocate_at(1, t0()).await.unwrap();
    let log = Arc::new(MemoryActivityLog::new());
    record_activity(&log, 1, t0()).await;
    pool.touch_at(1, t0() + Duration::seconds(900)).await.unwrap();
    let reaper = IdleReaper::new(pool.clone(), log, config(600));

    let report = reaper
        .sweep_at(t0() + Duration::seconds(1000))
        .await
        .unwrap();
    assert!(report.reclaimed.is_empty());
}

#[tokio::test]
async fn test_huge_idle_timeout_never_reclaims_active_user() {
    let pool = pool_with(&[3389]).await;
    pool.allocate_at(1, t0()).await.unwrap();
    let log = Arc::new(MemoryActivityLog::new());
    record_activity(&log, 1, t0()).await;
    let reaper = IdleReaper::new(pool.clone(), log, config(u64::MAX));

    let report = reaper
        .sweep_at(t0() + Duration::seconds(1))
        .await
        .unwrap();
    assert!(report.reclaimed.is_empty());
}
