use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::{ActivityLog, AuditAction, AuditEvent};
use crate::error::{Result, VdiError};
use crate::pool::{DesktopPool, UserId};
use crate::registry::{WorkerRegistry, WorkerView};
use crate::session::binding::{BindingTable, Resource, SessionBinding};
use crate::session::{DispatchMode, ExamCatalog, ExamId};
use crate::token::{ConnectionDescriptor, TokenSealer};

/// RDP port used for worker sessions when the worker does not report one.
pub const DEFAULT_WORKER_RDP_PORT: u16 = 3389;

/// Result of an allocate call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub user_id: UserId,
    pub exam_id: ExamId,
    pub resource: Resource,
    pub address: String,
    pub token: String,
    pub allocated_at: DateTime<Utc>,
}

impl From<SessionBinding> for Allocation {
    fn from(b: SessionBinding) -> Self {
        Self {
            user_id: b.user_id,
            exam_id: b.exam_id,
            resource: b.resource,
            address: b.address,
            token: b.token,
            allocated_at: b.allocated_at,
        }
    }
}

/// Decides where a session runs and mints its token.
///
/// Calling [`allocate`](Self::allocate) again for a live binding hands back
/// the same resource, so client retries never leak a second desktop or slot.
#[derive(Clone)]
pub struct SessionAllocator {
    pool: DesktopPool,
    registry: Arc<WorkerRegistry>,
    sealer: TokenSealer,
    catalog: Arc<dyn ExamCatalog>,
    bindings: Arc<BindingTable>,
    activity: Option<Arc<dyn ActivityLog>>,
}

impl SessionAllocator {
    pub fn new(
        pool: DesktopPool,
        registry: Arc<WorkerRegistry>,
        sealer: TokenSealer,
        catalog: Arc<dyn ExamCatalog>,
        bindings: Arc<BindingTable>,
    ) -> Self {
        Self {
            pool,
            registry,
            sealer,
            catalog,
            bindings,
            activity: None,
        }
    }

    /// Record allocation and release events in `log`.
    pub fn with_activity_log(mut self, log: Arc<dyn ActivityLog>) -> Self {
        self.activity = Some(log);
        self
    }

    pub fn bindings(&self) -> &Arc<BindingTable> {
        &self.bindings
    }

    pub async fn allocate(&self, user_id: UserId, exam_id: ExamId) -> Result<Allocation> {
        self.allocate_with_display(user_id, exam_id, None, None).await
    }

    /// Allocate, merging untrusted display size hints into a new token.
    pub async fn allocate_with_display(
        &self,
        user_id: UserId,
        exam_id: ExamId,
        width: Option<&Value>,
        height: Option<&Value>,
    ) -> Result<Allocation> {
        let now = Utc::now();

        if let Some(existing) = self.live_binding(user_id, exam_id).await? {
            tracing::debug!(user_id, exam_id, "Returning existing session binding");
            return Ok(existing.into());
        }

        // `inserted` is false when a concurrent call bound the pair first;
        // that call already recorded the allocation.
        let (binding, inserted) = match self.catalog.dispatch_mode(exam_id) {
            DispatchMode::DesktopPool => {
                self.bind_desktop(user_id, exam_id, width, height, now).await?
            }
            DispatchMode::WorkerDispatch => {
                self.bind_worker(user_id, exam_id, width, height, now).await?
            }
        };

        if inserted {
            self.audit(
                AuditEvent::new(user_id, AuditAction::Allocate, now)
                    .with_exam(Some(exam_id))
                    .with_detail(binding.address.clone())
                    .system(),
            )
            .await;
        }

        Ok(binding.into())
    }

    /// Release whatever the pair is bound to. Releasing twice is a no-op.
    /// Returns whether anything was freed.
    pub async fn release(&self, user_id: UserId, exam_id: ExamId) -> Result<bool> {
        let freed = match self.bindings.remove(user_id, exam_id).await {
            Some(binding) => match binding.resource {
                Resource::Desktop { desktop_id, .. } => {
                    self.bindings.remove_desktop(user_id, desktop_id).await;
                    self.pool.release(user_id).await?.is_some()
                }
                Resource::Worker { ref code } => {
                    self.registry.bump_active_sessions(code, -1).await;
                    tracing::info!(user_id, exam_id, worker = %code, "Worker session released");
                    true
                }
            },
            // Binding lost (e.g. restart): the desktop row still records the owner.
            None => match self.catalog.dispatch_mode(exam_id) {
                DispatchMode::DesktopPool => self.pool.release(user_id).await?.is_some(),
                DispatchMode::WorkerDispatch => false,
            },
        };

        if freed {
            self.audit(
                AuditEvent::new(user_id, AuditAction::Release, Utc::now())
                    .with_exam(Some(exam_id))
                    .system(),
            )
            .await;
        }
        Ok(freed)
    }

    /// Record an activity signal from the user. This is what keeps an
    /// allocated desktop from being reclaimed as idle.
    pub async fn record_activity(&self, user_id: UserId, exam_id: Option<ExamId>) -> Result<()> {
        let now = Utc::now();
        self.pool.touch(user_id).await?;
        if let Some(ref log) = self.activity {
            log.record(AuditEvent::new(user_id, AuditAction::Activity, now).with_exam(exam_id))
                .await?;
        }
        Ok(())
    }

    /// The pair's binding, if it still holds its resource. A desktop binding
    /// whose desktop was reclaimed in the meantime is dropped.
    async fn live_binding(&self, user_id: UserId, exam_id: ExamId) -> Result<Option<SessionBinding>> {
        let Some(binding) = self.bindings.get(user_id, exam_id).await else {
            return Ok(None);
        };

        if let Resource::Desktop { desktop_id, .. } = binding.resource {
            let still_owned = self
                .pool
                .owned_by(user_id)
                .await?
                .is_some_and(|d| d.id == desktop_id);
            if !still_owned {
                tracing::debug!(user_id, exam_id, desktop_id, "Dropping stale desktop binding");
                self.bindings.remove_desktop(user_id, desktop_id).await;
                return Ok(None);
            }
        }
        Ok(Some(binding))
    }

    async fn bind_desktop(
        &self,
        user_id: UserId,
        exam_id: ExamId,
        width: Option<&Value>,
        height: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<(SessionBinding, bool)> {
        let desktop = self.pool.allocate_at(user_id, now).await?;
        let descriptor = ConnectionDescriptor::rdp(desktop.address.clone(), desktop.port)
            .with_credentials(desktop.username.clone(), desktop.password.clone())
            .with_display_hints(width, height);
        let token = self.sealer.seal(&descriptor)?;

        let binding = SessionBinding {
            user_id,
            exam_id,
            resource: Resource::Desktop {
                desktop_id: desktop.id,
                port: desktop.port,
            },
            address: format!("{}:{}", desktop.address, desktop.port),
            token,
            allocated_at: now,
        };
        // The pool is idempotent per user, so losing this race still leaves
        // the same desktop behind the existing binding.
        Ok(self.bindings.insert_if_absent(binding).await)
    }

    async fn bind_worker(
        &self,
        user_id: UserId,
        exam_id: ExamId,
        width: Option<&Value>,
        height: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<(SessionBinding, bool)> {
        let view = self.registry.claim_slot_at(now).await.ok_or_else(|| {
            tracing::warn!(user_id, exam_id, "No schedulable worker");
            VdiError::NoCapacity
        })?;
        let code = view.worker.code.clone();

        let descriptor = worker_descriptor(&view).with_display_hints(width, height);
        let token = match self.sealer.seal(&descriptor) {
            Ok(token) => token,
            Err(e) => {
                self.registry.bump_active_sessions(&code, -1).await;
                return Err(e.into());
            }
        };

        let binding = SessionBinding {
            user_id,
            exam_id,
            resource: Resource::Worker { code: code.clone() },
            address: worker_address(&view),
            token,
            allocated_at: now,
        };

        let (live, inserted) = self.bindings.insert_if_absent(binding).await;
        if !inserted {
            // A concurrent call bound the pair first; give our slot back.
            self.registry.bump_active_sessions(&code, -1).await;
        } else {
            tracing::info!(user_id, exam_id, worker = %code, "Worker session allocated");
        }
        Ok((live, inserted))
    }

    async fn audit(&self, event: AuditEvent) {
        if let Some(ref log) = self.activity {
            if let Err(e) = log.record(event).await {
                tracing::warn!(error = %e, "Failed to record session event");
            }
        }
    }
}

fn worker_port(view: &WorkerView) -> u16 {
    match view.worker.metadata.get("rdpPort") {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_WORKER_RDP_PORT),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(DEFAULT_WORKER_RDP_PORT),
        _ => DEFAULT_WORKER_RDP_PORT,
    }
}

fn worker_hostname(view: &WorkerView) -> String {
    view.worker
        .host()
        .map(str::to_string)
        .unwrap_or_else(|| view.worker.code.clone())
}

fn worker_address(view: &WorkerView) -> String {
    format!("{}:{}", worker_hostname(view), worker_port(view))
}

fn worker_descriptor(view: &WorkerView) -> ConnectionDescriptor {
    let protocol = view
        .worker
        .metadata
        .get("protocol")
        .and_then(Value::as_str)
        .unwrap_or("rdp");
    ConnectionDescriptor::new(protocol, worker_hostname(view), worker_port(view))
}
