//! Binding of (user, exam) pairs to a desktop or a worker slot.

pub mod allocator;
pub mod binding;

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::VdiError;

pub use allocator::{Allocation, SessionAllocator};
pub use binding::{BindingTable, Resource, SessionBinding};

pub type ExamId = u64;

/// Where sessions for an exam come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// Pre-provisioned desktops from the pool.
    DesktopPool,
    /// A slot on the least-loaded worker host.
    WorkerDispatch,
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchMode::DesktopPool => write!(f, "desktop-pool"),
            DispatchMode::WorkerDispatch => write!(f, "worker-dispatch"),
        }
    }
}

impl FromStr for DispatchMode {
    type Err = VdiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "desktop-pool" | "desktop" | "pool" => Ok(DispatchMode::DesktopPool),
            "worker-dispatch" | "worker" => Ok(DispatchMode::WorkerDispatch),
            other => Err(VdiError::InvalidConfig(format!(
                "unknown dispatch mode: {}",
                other
            ))),
        }
    }
}

/// Exam lookup owned by the exam-management side.
pub trait ExamCatalog: Send + Sync + 'static {
    fn dispatch_mode(&self, exam_id: ExamId) -> DispatchMode;
}

/// Per-exam overrides on top of a default mode.
#[derive(Debug, Clone)]
pub struct StaticExamCatalog {
    default_mode: DispatchMode,
    overrides: HashMap<ExamId, DispatchMode>,
}

impl StaticExamCatalog {
    pub fn new(default_mode: DispatchMode) -> Self {
        Self {
            default_mode,
            overrides: HashMap::new(),
        }
    }

    pub fn with_exam(mut self, exam_id: ExamId, mode: DispatchMode) -> Self {
        self.overrides.insert(exam_id, mode);
        self
    }
}

impl ExamCatalog for StaticExamCatalog {
    fn dispatch_mode(&self, exam_id: ExamId) -> DispatchMode {
        self.overrides
            .get(&exam_id)
            .copied()
            .unwrap_or(self.default_mode)
    }
}
