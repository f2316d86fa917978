use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{Result, VdiError};
use crate::pool::desktop::{Desktop, DesktopId, NewDesktop, UserId};

/// Persistence for the desktop inventory.
///
/// Every mutating call is a single conditional update on one row, so two
/// concurrent claims can never both win the same desktop.
#[async_trait]
pub trait DesktopStore: Send + Sync + 'static {
    async fn insert(&self, desktop: NewDesktop) -> Result<Desktop>;

    async fn list(&self) -> Result<Vec<Desktop>>;

    async fn find_by_owner(&self, user_id: UserId) -> Result<Option<Desktop>>;

    /// Claim the lowest-port free desktop for `user_id`. If the user already
    /// owns one, that desktop is returned unchanged. `None` when nothing is
    /// free.
    async fn claim_lowest_free(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Option<Desktop>>;

    /// Free whatever `user_id` owns. Returns the desktop as it was freed.
    async fn release_owned(&self, user_id: UserId) -> Result<Option<Desktop>>;

    /// Free `desktop_id` only if it is still owned by `user_id`.
    async fn release_if_owned(&self, desktop_id: DesktopId, user_id: UserId) -> Result<bool>;

    /// Stamp the activity time on the desktop owned by `user_id`.
    async fn touch(&self, user_id: UserId, now: DateTime<Utc>) -> Result<bool>;
}

/// In-process inventory. The write lock makes each call's check-and-set atomic.
#[derive(Debug, Default)]
pub struct MemoryDesktopStore {
    inner: RwLock<Inventory>,
}

#[derive(Debug, Default)]
struct Inventory {
    desktops: BTreeMap<DesktopId, Desktop>,
    next_id: DesktopId,
}

impl MemoryDesktopStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DesktopStore for MemoryDesktopStore {
    async fn insert(&self, desktop: NewDesktop) -> Result<Desktop> {
        if desktop.address.trim().is_empty() {
            return Err(VdiError::InvalidRequest(
                "desktop address cannot be empty".to_string(),
            ));
        }

        let mut inv = self.inner.write().await;
        inv.next_id += 1;
        let record = Desktop {
            id: inv.next_id,
            address: desktop.address,
            port: desktop.port,
            username: desktop.username,
            password: desktop.password,
            allocated: false,
            allocated_to_user_id: None,
            allocated_at: None,
            last_activity_at: None,
        };
        inv.desktops.insert(record.id, record.clone());
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<Desktop>> {
        Ok(self.inner.read().await.desktops.values().cloned().collect())
    }

    async fn find_by_owner(&self, user_id: UserId) -> Result<Option<Desktop>> {
        Ok(self
            .inner
            .read()
            .await
            .desktops
            .values()
            .find(|d| d.is_owned_by(user_id))
            .cloned())
    }

    async fn claim_lowest_free(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Option<Desktop>> {
        let mut inv = self.inner.write().await;

        if let Some(owned) = inv.desktops.values().find(|d| d.is_owned_by(user_id)) {
            return Ok(Some(owned.clone()));
        }

        let candidate = inv
            .desktops
            .values()
            .filter(|d| !d.allocated)
            .min_by_key(|d| (d.port, d.id))
            .map(|d| d.id);

        Ok(candidate.and_then(|id| {
            inv.desktops.get_mut(&id).map(|desktop| {
                desktop.assign(user_id, now);
                desktop.clone()
            })
        }))
    }

    async fn release_owned(&self, user_id: UserId) -> Result<Option<Desktop>> {
        let mut inv = self.inner.write().await;
        Ok(inv
            .desktops
            .values_mut()
            .find(|d| d.is_owned_by(user_id))
            .map(|desktop| {
                let freed = desktop.clone();
                desktop.clear();
                freed
            }))
    }

    async fn release_if_owned(&self, desktop_id: DesktopId, user_id: UserId) -> Result<bool> {
        let mut inv = self.inner.write().await;
        match inv.desktops.get_mut(&desktop_id) {
            Some(desktop) if desktop.is_owned_by(user_id) => {
                desktop.clear();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch(&self, user_id: UserId, now: DateTime<Utc>) -> Result<bool> {
        let mut inv = self.inner.write().await;
        match inv.desktops.values_mut().find(|d| d.is_owned_by(user_id)) {
            Some(desktop) => {
                desktop.last_activity_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
