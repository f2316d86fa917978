//! Fixed inventory of pre-provisioned desktops.

pub mod desktop;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{Result, VdiError};

pub use desktop::{Desktop, DesktopId, NewDesktop, PoolSummary, UserId};
pub use store::{DesktopStore, MemoryDesktopStore};

/// Claims and releases desktops on behalf of users.
#[derive(Clone)]
pub struct DesktopPool {
    store: Arc<dyn DesktopStore>,
}

impl DesktopPool {
    pub fn new(store: Arc<dyn DesktopStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDesktopStore::new()))
    }

    /// Bulk import of provisioned desktops.
    pub async fn provision(&self, desktops: Vec<NewDesktop>) -> Result<Vec<Desktop>> {
        let mut created = Vec::with_capacity(desktops.len());
        for desktop in desktops {
            created.push(self.store.insert(desktop).await?);
        }
        tracing::info!(count = created.len(), "Desktops provisioned");
        Ok(created)
    }

    pub async fn allocate(&self, user_id: UserId) -> Result<Desktop> {
        self.allocate_at(user_id, Utc::now()).await
    }

    /// Return the user's desktop, claiming the lowest-port free one if the
    /// user has none yet.
    pub async fn allocate_at(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Desktop> {
        if let Some(owned) = self.store.find_by_owner(user_id).await? {
            tracing::debug!(user_id, desktop_id = owned.id, "User already owns a desktop");
            return Ok(owned);
        }

        match self.store.claim_lowest_free(user_id, now).await? {
            Some(desktop) => {
                tracing::info!(
                    user_id,
                    desktop_id = desktop.id,
                    address = %desktop.address,
                    port = desktop.port,
                    "Desktop allocated"
                );
                Ok(desktop)
            }
            None => {
                tracing::warn!(user_id, "Desktop pool exhausted");
                Err(VdiError::PoolExhausted)
            }
        }
    }

    /// Free the user's desktop. Owning nothing is not an error.
    pub async fn release(&self, user_id: UserId) -> Result<Option<Desktop>> {
        let freed = self.store.release_owned(user_id).await?;
        if let Some(ref desktop) = freed {
            tracing::info!(user_id, desktop_id = desktop.id, "Desktop released");
        }
        Ok(freed)
    }

    /// Free a specific desktop if `user_id` still owns it. Used by the
    /// reaper, which must not free a desktop someone else has claimed since.
    pub async fn reclaim(&self, desktop_id: DesktopId, user_id: UserId) -> Result<bool> {
        self.store.release_if_owned(desktop_id, user_id).await
    }

    pub async fn touch(&self, user_id: UserId) -> Result<bool> {
        self.touch_at(user_id, Utc::now()).await
    }

    /// Stamp activity on the user's desktop. `false` when they own none.
    pub async fn touch_at(&self, user_id: UserId, now: DateTime<Utc>) -> Result<bool> {
        self.store.touch(user_id, now).await
    }

    pub async fn owned_by(&self, user_id: UserId) -> Result<Option<Desktop>> {
        self.store.find_by_owner(user_id).await
    }

    pub async fn list(&self) -> Result<Vec<Desktop>> {
        self.store.list().await
    }

    pub async fn allocated(&self) -> Result<Vec<Desktop>> {
        let mut desktops = self.store.list().await?;
        desktops.retain(|d| d.allocated);
        Ok(desktops)
    }

    pub async fn summary(&self) -> Result<PoolSummary> {
        let desktops = self.store.list().await?;
        let allocated = desktops.iter().filter(|d| d.allocated).count();
        Ok(PoolSummary {
            total: desktops.len(),
            allocated,
            free: desktops.len() - allocated,
        })
    }
}
