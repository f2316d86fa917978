use thiserror::Error;

use crate::token::TokenError;

#[derive(Error, Debug)]
pub enum VdiError {
    #[error("No free desktop left in the pool")]
    PoolExhausted,

    #[error("No schedulable worker has free capacity")]
    NoCapacity,

    #[error("Worker {code} still hosts {active_sessions} session(s); use force to disable")]
    WorkerBusy { code: String, active_sessions: u32 },

    #[error("Worker not found: {0}")]
    UnknownWorker(String),

    #[error("Token invalid: {0}")]
    TokenInvalid(#[from] TokenError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VdiError {
    /// True for the "no resource available" family that callers surface as
    /// a retry-later state.
    pub fn is_capacity(&self) -> bool {
        matches!(self, VdiError::PoolExhausted | VdiError::NoCapacity)
    }
}

pub type Result<T> = std::result::Result<T, VdiError>;
