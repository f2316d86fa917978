use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = u64;
pub type DesktopId = u64;

/// One pre-provisioned remote desktop endpoint.
///
/// `allocated == false` always goes with `allocated_to_user_id == None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Desktop {
    pub id: DesktopId,
    pub address: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub allocated: bool,
    pub allocated_to_user_id: Option<UserId>,
    pub allocated_at: Option<DateTime<Utc>>,
    /// Last activity signal from the current owner. Cleared on every
    /// ownership change.
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Desktop {
    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.allocated && self.allocated_to_user_id == Some(user_id)
    }

    pub(crate) fn assign(&mut self, user_id: UserId, now: DateTime<Utc>) {
        self.allocated = true;
        self.allocated_to_user_id = Some(user_id);
        self.allocated_at = Some(now);
        self.last_activity_at = None;
    }

    pub(crate) fn clear(&mut self) {
        self.allocated = false;
        self.allocated_to_user_id = None;
        self.allocated_at = None;
        self.last_activity_at = None;
    }
}

/// Provisioning input for a desktop. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDesktop {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl NewDesktop {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            username: String::new(),
            password: String::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }
}

/// Inventory counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSummary {
    pub total: usize,
    pub allocated: usize,
    pub free: usize,
}
