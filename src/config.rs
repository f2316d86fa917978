use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::VdiError;
use crate::session::DispatchMode;

/// Lowest heartbeat TTL the registry accepts, whatever is configured.
pub const MIN_HEARTBEAT_TTL_SECS: u64 = 10;

/// Longest span a `chrono::Duration` can hold, in whole seconds. Larger
/// configured values are clamped to it.
pub const MAX_DURATION_SECS: u64 = i64::MAX as u64 / 1000;

fn clamped_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// Worker liveness settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Seconds since the last heartbeat after which a worker is unhealthy.
    pub heartbeat_ttl_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_secs: 120,
        }
    }
}

impl RegistryConfig {
    /// Effective TTL, floored at [`MIN_HEARTBEAT_TTL_SECS`] and capped at
    /// [`MAX_DURATION_SECS`].
    pub fn heartbeat_ttl(&self) -> chrono::Duration {
        clamped_seconds(self.heartbeat_ttl_secs.max(MIN_HEARTBEAT_TTL_SECS))
    }
}

/// Idle reclaim settings.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// A desktop whose owner has shown no activity for this long is reclaimed.
    pub idle_timeout_secs: u64,
    /// How often the sweep runs.
    pub sweep_interval_secs: u64,
    /// Upper bound on a single audit write during a sweep.
    pub audit_timeout_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
            sweep_interval_secs: 60,
            audit_timeout_ms: 2000,
        }
    }
}

impl ReaperConfig {
    pub fn idle_timeout(&self) -> chrono::Duration {
        clamped_seconds(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn audit_timeout(&self) -> Duration {
        Duration::from_millis(self.audit_timeout_ms)
    }
}

/// Symmetric cipher used to seal connection descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenCipher {
    #[default]
    Aes256Cbc,
    ChaCha20Poly1305,
}

impl TokenCipher {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenCipher::Aes256Cbc => "aes-256-cbc",
            TokenCipher::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl std::fmt::Display for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenCipher {
    type Err = VdiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-256-cbc" | "aes256cbc" => Ok(TokenCipher::Aes256Cbc),
            "chacha20-poly1305" | "chacha20poly1305" => Ok(TokenCipher::ChaCha20Poly1305),
            other => Err(VdiError::InvalidConfig(format!(
                "unsupported token cipher: {}",
                other
            ))),
        }
    }
}

/// Shared key and cipher for sealed tokens.
///
/// The key is provisioned out of band and must be identical on the scheduler
/// and on the gateway. It is given either as 32 raw bytes or as 64 hex chars.
#[derive(Clone, Default)]
pub struct TokenConfig {
    pub key: String,
    pub cipher: TokenCipher,
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("key", &"<redacted>")
            .field("cipher", &self.cipher)
            .finish()
    }
}

impl TokenConfig {
    pub fn new(key: impl Into<String>, cipher: TokenCipher) -> Self {
        Self {
            key: key.into(),
            cipher,
        }
    }

    /// Decode the configured key into 32 bytes.
    pub fn key_bytes(&self) -> Result<[u8; 32], VdiError> {
        let raw = self.key.as_bytes();
        if raw.len() == 32 {
            let mut key = [0u8; 32];
            key.copy_from_slice(raw);
            return Ok(key);
        }
        if raw.len() == 64 {
            let decoded = hex::decode(&self.key)
                .map_err(|e| VdiError::InvalidConfig(format!("token key is not hex: {}", e)))?;
            let mut key = [0u8; 32];
            key.copy_from_slice(&decoded);
            return Ok(key);
        }
        Err(VdiError::InvalidConfig(format!(
            "token key must be 32 bytes or 64 hex chars, got {} bytes",
            raw.len()
        )))
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub registry: RegistryConfig,
    pub reaper: ReaperConfig,
    pub token: TokenConfig,
    /// Dispatch mode for exams without an explicit override.
    pub default_dispatch: DispatchMode,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            registry: RegistryConfig::default(),
            reaper: ReaperConfig::default(),
            token: TokenConfig::default(),
            default_dispatch: DispatchMode::DesktopPool,
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: SocketAddr, token: TokenConfig) -> Self {
        Self {
            listen_addr,
            token,
            ..Default::default()
        }
    }

    pub fn with_heartbeat_ttl_secs(mut self, secs: u64) -> Self {
        self.registry.heartbeat_ttl_secs = secs;
        self
    }

    pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.reaper.idle_timeout_secs = secs;
        self
    }

    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.reaper.sweep_interval_secs = secs;
        self
    }

    pub fn with_default_dispatch(mut self, mode: DispatchMode) -> Self {
        self.default_dispatch = mode;
        self
    }
}
