//! Activity-log collaborator consulted by the idle reaper.
//!
//! The real log lives outside the scheduler; this module only defines the
//! seam and an in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::pool::UserId;
use crate::session::ExamId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    Allocate,
    Activity,
    Release,
    Revoke,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditAction::Allocate => write!(f, "ALLOCATE"),
            AuditAction::Activity => write!(f, "ACTIVITY"),
            AuditAction::Release => write!(f, "RELEASE"),
            AuditAction::Revoke => write!(f, "REVOKE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub user_id: UserId,
    pub exam_id: Option<ExamId>,
    pub action: AuditAction,
    pub detail: String,
    /// True for events the scheduler emits on its own.
    pub system: bool,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(user_id: UserId, action: AuditAction, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            exam_id: None,
            action,
            detail: String::new(),
            system: false,
            at,
        }
    }

    pub fn with_exam(mut self, exam_id: Option<ExamId>) -> Self {
        self.exam_id = exam_id;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn system(mut self) -> Self {
        self.system = true;
        self
    }

    /// Whether this event counts as a sign of life from the user.
    pub fn is_activity(&self) -> bool {
        matches!(self.action, AuditAction::Allocate | AuditAction::Activity)
    }
}

#[async_trait]
pub trait ActivityLog: Send + Sync + 'static {
    /// Time of the most recent activity signal from `user_id`, if any.
    async fn last_activity(&self, user_id: UserId) -> Result<Option<DateTime<Utc>>>;

    async fn record(&self, event: AuditEvent) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryActivityLog {
    inner: RwLock<LogState>,
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<AuditEvent>,
    last_seen: HashMap<UserId, DateTime<Utc>>,
}

impl MemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.inner.read().await.events.clone()
    }

    pub async fn events_for(&self, user_id: UserId) -> Vec<AuditEvent> {
        self.inner
            .read()
            .await
            .events
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ActivityLog for MemoryActivityLog {
    async fn last_activity(&self, user_id: UserId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.inner.read().await.last_seen.get(&user_id).copied())
    }

    async fn record(&self, event: AuditEvent) -> Result<()> {
        let mut state = self.inner.write().await;
        if event.is_activity() {
            let seen = state.last_seen.entry(event.user_id).or_insert(event.at);
            if event.at > *seen {
                *seen = event.at;
            }
        }
        state.events.push(event);
        Ok(())
    }
}
