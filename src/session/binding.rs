use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::pool::{DesktopId, UserId};
use crate::session::ExamId;

/// What a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Resource {
    #[serde(rename_all = "camelCase")]
    Desktop { desktop_id: DesktopId, port: u16 },
    #[serde(rename_all = "camelCase")]
    Worker { code: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBinding {
    pub user_id: UserId,
    pub exam_id: ExamId,
    pub resource: Resource,
    pub address: String,
    pub token: String,
    pub allocated_at: DateTime<Utc>,
}

/// Live bindings, at most one per (user, exam).
#[derive(Debug, Default)]
pub struct BindingTable {
    bindings: RwLock<HashMap<(UserId, ExamId), SessionBinding>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, user_id: UserId, exam_id: ExamId) -> Option<SessionBinding> {
        self.bindings.read().await.get(&(user_id, exam_id)).cloned()
    }

    /// Insert unless the pair is already bound. Returns the binding that is
    /// now live and whether it is the one passed in.
    pub async fn insert_if_absent(&self, binding: SessionBinding) -> (SessionBinding, bool) {
        let mut bindings = self.bindings.write().await;
        let key = (binding.user_id, binding.exam_id);
        if let Some(existing) = bindings.get(&key) {
            return (existing.clone(), false);
        }
        bindings.insert(key, binding.clone());
        (binding, true)
    }

    pub async fn remove(&self, user_id: UserId, exam_id: ExamId) -> Option<SessionBinding> {
        self.bindings.write().await.remove(&(user_id, exam_id))
    }

    /// Drop every binding of `user_id` that points at `desktop_id`.
    pub async fn remove_desktop(&self, user_id: UserId, desktop_id: DesktopId) -> Vec<SessionBinding> {
        let mut bindings = self.bindings.write().await;
        let keys: Vec<(UserId, ExamId)> = bindings
            .iter()
            .filter(|(_, b)| {
                b.user_id == user_id
                    && matches!(b.resource, Resource::Desktop { desktop_id: id, .. } if id == desktop_id)
            })
            .map(|(k, _)| *k)
            .collect();
        keys.iter().filter_map(|k| bindings.remove(k)).collect()
    }

    /// All bindings, oldest first.
    pub async fn list(&self) -> Vec<SessionBinding> {
        let mut all: Vec<SessionBinding> = self.bindings.read().await.values().cloned().collect();
        all.sort_by_key(|b| (b.allocated_at, b.user_id, b.exam_id));
        all
    }

    pub async fn len(&self) -> usize {
        self.bindings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bindings.read().await.is_empty()
    }
}
