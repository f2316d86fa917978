use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Drain state derived from the draining flag and the session count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainStatus {
    Serving,
    Draining,
    Drained,
}

impl std::fmt::Display for DrainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrainStatus::Serving => write!(f, "serving"),
            DrainStatus::Draining => write!(f, "draining"),
            DrainStatus::Drained => write!(f, "drained"),
        }
    }
}

/// Periodic self-report sent by a worker host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatInput {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub api_base_url: Option<String>,
    pub total_cpu_cores: f64,
    pub total_memory_mb: f64,
    #[serde(default)]
    pub reserved_cpu_cores: f64,
    #[serde(default)]
    pub reserved_memory_mb: f64,
    pub vm_cpu_cores: f64,
    pub vm_memory_mb: f64,
    #[serde(default)]
    pub active_sessions: f64,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

/// A capacity-bearing host that runs desktop sessions on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerNode {
    pub code: String,
    pub name: String,
    pub api_base_url: Option<String>,
    pub is_enabled: bool,
    pub is_draining: bool,
    pub last_heartbeat_at: DateTime<Utc>,
    pub total_cpu_cores: f64,
    pub reserved_cpu_cores: f64,
    pub total_memory_mb: f64,
    pub reserved_memory_mb: f64,
    pub vm_cpu_cores: f64,
    pub vm_memory_mb: f64,
    pub active_sessions: u32,
    pub max_sessions: u32,
    pub metadata: Map<String, Value>,
}

/// Number of sessions a host can fit given its capacity, reservations and
/// the per-session footprint. Zero when either footprint is not positive.
pub fn compute_max_sessions(
    total_cpu: f64,
    reserved_cpu: f64,
    total_memory: f64,
    reserved_memory: f64,
    per_session_cpu: f64,
    per_session_memory: f64,
) -> u32 {
    let per_cpu = finite_or_zero(per_session_cpu);
    let per_mem = finite_or_zero(per_session_memory);
    if per_cpu <= 0.0 || per_mem <= 0.0 {
        return 0;
    }

    let usable_cpu = (finite_or_zero(total_cpu) - finite_or_zero(reserved_cpu)).max(0.0);
    let usable_mem = (finite_or_zero(total_memory) - finite_or_zero(reserved_memory)).max(0.0);

    let by_cpu = (usable_cpu / per_cpu).floor();
    let by_mem = (usable_mem / per_mem).floor();
    clamp_to_count(by_cpu.min(by_mem))
}

/// Floor a reported session count to an integer, clamped at zero.
pub fn sanitize_session_count(reported: f64) -> u32 {
    clamp_to_count(finite_or_zero(reported).floor())
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn clamp_to_count(value: f64) -> u32 {
    if value <= 0.0 {
        0
    } else if value >= u32::MAX as f64 {
        u32::MAX
    } else {
        value as u32
    }
}

impl WorkerNode {
    /// Build a fresh record from a heartbeat. Every reported field replaces
    /// what was stored before; nothing is merged.
    pub fn from_heartbeat(input: HeartbeatInput, now: DateTime<Utc>) -> Self {
        let max_sessions = compute_max_sessions(
            input.total_cpu_cores,
            input.reserved_cpu_cores,
            input.total_memory_mb,
            input.reserved_memory_mb,
            input.vm_cpu_cores,
            input.vm_memory_mb,
        );

        Self {
            code: input.code,
            name: input.name,
            api_base_url: input.api_base_url.filter(|url| !url.trim().is_empty()),
            is_enabled: true,
            is_draining: false,
            last_heartbeat_at: now,
            total_cpu_cores: input.total_cpu_cores,
            reserved_cpu_cores: input.reserved_cpu_cores,
            total_memory_mb: input.total_memory_mb,
            reserved_memory_mb: input.reserved_memory_mb,
            vm_cpu_cores: input.vm_cpu_cores,
            vm_memory_mb: input.vm_memory_mb,
            active_sessions: sanitize_session_count(input.active_sessions),
            max_sessions,
            metadata: input.metadata.unwrap_or_default(),
        }
    }

    pub fn available_sessions(&self) -> u32 {
        self.max_sessions.saturating_sub(self.active_sessions)
    }

    pub fn is_healthy_at(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.is_enabled && now.signed_duration_since(self.last_heartbeat_at) <= ttl
    }

    pub fn drain_status(&self) -> DrainStatus {
        match (self.is_draining, self.active_sessions) {
            (false, _) => DrainStatus::Serving,
            (true, 0) => DrainStatus::Drained,
            (true, _) => DrainStatus::Draining,
        }
    }

    pub fn is_schedulable_at(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.is_healthy_at(now, ttl) && !self.is_draining && self.available_sessions() > 0
    }

    /// Apply a signed delta to the session count, clamped at zero.
    pub fn adjust_active_sessions(&mut self, delta: i64) {
        let next = (self.active_sessions as i64).saturating_add(delta);
        self.active_sessions = next.clamp(0, u32::MAX as i64) as u32;
    }

    /// Host part of `api_base_url`, if one was reported.
    pub fn host(&self) -> Option<&str> {
        let url = self.api_base_url.as_deref()?;
        let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
        let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
        let authority = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
        let host = if let Some(stripped) = authority.strip_prefix('[') {
            stripped.split(']').next().unwrap_or(stripped)
        } else {
            authority.split(':').next().unwrap_or(authority)
        };
        if host.is_empty() {
            None
        } else {
            Some(host)
        }
    }

    pub fn view_at(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> WorkerView {
        WorkerView {
            available_sessions: self.available_sessions(),
            healthy: self.is_healthy_at(now, ttl),
            drain_status: self.drain_status(),
            worker: self.clone(),
        }
    }
}

/// A stored worker together with its derived fields at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerView {
    #[serde(flatten)]
    pub worker: WorkerNode,
    pub available_sessions: u32,
    pub healthy: bool,
    pub drain_status: DrainStatus,
}
