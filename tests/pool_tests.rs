use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vdi_lite::error::{Result, VdiError};
use vdi_lite::pool::{Desktop, DesktopId, DesktopPool, DesktopStore, NewDesktop, UserId};

async fn pool_with_ports(ports: &[u16]) -> DesktopPool {
    let pool = DesktopPool::in_memory();
    let desktops = ports
        .iter()
        .map(|p| NewDesktop::new("10.1.0.20", *p).with_credentials("exam", "secret"))
        .collect();
    pool.provision(desktops).await.unwrap();
    pool
}

#[tokio::test]
async fn test_lowest_port_first_and_idempotent() {
    let pool = pool_with_ports(&[3390, 3389]).await;

    let first = pool.allocate(7).await.unwrap();
    assert_eq!(first.port, 3389);
    assert_eq!(first.allocated_to_user_id, Some(7));
    assert!(first.allocated_at.is_some());

    let again = pool.allocate(7).await.unwrap();
    assert_eq!(again.id, first.id);

    let second = pool.allocate(8).await.unwrap();
    assert_eq!(second.port, 3390);

    let result = pool.allocate(9).await;
    assert!(matches!(result, Err(VdiError::PoolExhausted)));
}

#[tokio::test]
async fn test_release_frees_desktop() {
    let pool = pool_with_ports(&[3389]).await;
    let desktop = pool.allocate(1).await.unwrap();

    let freed = pool.release(1).await.unwrap().unwrap();
    assert_eq!(freed.id, desktop.id);

    let listed = pool.list().await.unwrap();
    assert!(!listed[0].allocated);
    assert_eq!(listed[0].allocated_to_user_id, None);

    // Freed desktop goes to the next user.
    let next = pool.allocate(2).await.unwrap();
    assert_eq!(next.id, desktop.id);
}

#[tokio::test]
async fn test_release_without_desktop_is_noop() {
    let pool = pool_with_ports(&[3389]).await;
    assert!(pool.release(42).await.unwrap().is_none());

    pool.allocate(1).await.unwrap();
    pool.release(1).await.unwrap();
    assert!(pool.release(1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_empty_pool_is_exhausted() {
    let pool = DesktopPool::in_memory();
    let err = pool.allocate(1).await.unwrap_err();
    assert!(err.is_capacity());
}

#[tokio::test]
async fn test_provision_rejects_empty_address() {
    let pool = DesktopPool::in_memory();
    let result = pool.provision(vec![NewDesktop::new("", 3389)]).await;
    assert!(matches!(result, Err(VdiError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_reclaim_only_when_still_owned() {
    let pool = pool_with_ports(&[3389]).await;
    let desktop = pool.allocate(1).await.unwrap();
    pool.release(1).await.unwrap();
    pool.allocate(2).await.unwrap();

    // User 1 lost the desktop already; user 2 must keep it.
    assert!(!pool.reclaim(desktop.id, 1).await.unwrap());
    assert_eq!(
        pool.owned_by(2).await.unwrap().map(|d| d.id),
        Some(desktop.id)
    );

    assert!(pool.reclaim(desktop.id, 2).await.unwrap());
    assert!(pool.owned_by(2).await.unwrap().is_none());
}

#[tokio::test]
async fn test_touch_updates_activity() {
    let pool = pool_with_ports(&[3389]).await;
    assert!(!pool.touch(1).await.unwrap());

    let desktop = pool.allocate(1).await.unwrap();
    assert!(desktop.last_activity_at.is_none());
    assert!(pool.touch(1).await.unwrap());
    let touched = pool.owned_by(1).await.unwrap().unwrap();
    assert!(touched.last_activity_at.is_some());
}

#[tokio::test]
async fn test_new_owner_starts_without_activity() {
    let pool = pool_with_ports(&[3389]).await;
    pool.allocate(1).await.unwrap();
    pool.touch(1).await.unwrap();
    pool.release(1).await.unwrap();

    let next = pool.allocate(2).await.unwrap();
    assert!(next.last_activity_at.is_none());
}

#[tokio::test]
async fn test_summary_counts() {
    let pool = pool_with_ports(&[3389, 3390, 3391]).await;
    pool.allocate(1).await.unwrap();

    let summary = pool.summary().await.unwrap();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.allocated, 1);
    assert_eq!(summary.free, 2);
    assert_eq!(pool.allocated().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_password_is_not_serialized() {
    let pool = pool_with_ports(&[3389]).await;
    let desktop = pool.allocate(1).await.unwrap();
    assert_eq!(desktop.password, "secret");

    let json = serde_json::to_value(&desktop).unwrap();
    assert!(json.get("password").is_none());
    assert_eq!(json["allocatedToUserId"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_a_desktop() {
    let ports: Vec<u16> = (3389..3399).collect();
    let pool = pool_with_ports(&ports).await;

    let mut handles = Vec::new();
    for user in 1..=20u64 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move { (user, pool.allocate(user).await) }));
    }

    let mut granted = HashSet::new();
    let mut exhausted = 0;
    for handle in handles {
        let (_, result) = handle.await.unwrap();
        match result {
            Ok(desktop) => assert!(granted.insert(desktop.id), "desktop granted twice"),
            Err(VdiError::PoolExhausted) => exhausted += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(granted.len(), 10);
    assert_eq!(exhausted, 10);
    for desktop in pool.list().await.unwrap() {
        assert!(desktop.allocated);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_for_same_user_return_one_desktop() {
    let pool = pool_with_ports(&[3389, 3390, 3391]).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move { pool.allocate(5).await }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap().unwrap().id);
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(pool.summary().await.unwrap().allocated, 1);
}

/// Store whose backing system is down.
struct BrokenStore;

#[async_trait]
impl DesktopStore for BrokenStore {
    async fn insert(&self, _desktop: NewDesktop) -> Result<Desktop> {
        Err(VdiError::Storage("connection refused".to_string()))
    }

    async fn list(&self) -> Result<Vec<Desktop>> {
        Err(VdiError::Storage("connection refused".to_string()))
    }

    async fn find_by_owner(&self, _user_id: UserId) -> Result<Option<Desktop>> {
        Err(VdiError::Storage("connection refused".to_string()))
    }

    async fn claim_lowest_free(&self, _user_id: UserId, _now: DateTime<Utc>) -> Result<Option<Desktop>> {
        Err(VdiError::Storage("connection refused".to_string()))
    }

    async fn release_owned(&self, _user_id: UserId) -> Result<Option<Desktop>> {
        Err(VdiError::Storage("connection refused".to_string()))
    }

    async fn release_if_owned(&self, _desktop_id: DesktopId, _user_id: UserId) -> Result<bool> {
        Err(VdiError::Storage("connection refused".to_string()))
    }

    async fn touch(&self, _user_id: UserId, _now: DateTime<Utc>) -> Result<bool> {
        Err(VdiError::Storage("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_storage_errors_propagate() {
    let pool = DesktopPool::new(Arc::new(BrokenStore));
    assert!(matches!(pool.allocate(1).await, Err(VdiError::Storage(_))));
    assert!(matches!(pool.release(1).await, Err(VdiError::Storage(_))));
    assert!(matches!(pool.summary().await, Err(VdiError::Storage(_))));
}
