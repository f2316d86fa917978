//! Sealed session tokens handed to the remote-desktop gateway.
//!
//! # Wire format
//!
//! ```text
//! base64( {"iv": base64(iv), "value": base64(ciphertext)} )
//! ```
//!
//! The plaintext is the JSON form of a [`ConnectionDescriptor`]. Opening never
//! panics: every failure comes back as a [`TokenError`] so the gateway can drop
//! the connection attempt quietly.

pub mod descriptor;
pub mod sealer;

use thiserror::Error;

pub use descriptor::{sanitize_dimension, Connection, ConnectionDescriptor, ConnectionSettings};
pub use sealer::{normalize_token, TokenSealer};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is not valid base64")]
    Encoding,

    #[error("token envelope is malformed")]
    Envelope,

    #[error("token could not be decrypted")]
    Decrypt,

    #[error("token payload is not a connection descriptor")]
    Payload,

    #[error("token key has the wrong length")]
    Key,
}
