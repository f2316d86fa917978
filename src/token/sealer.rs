use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::{TokenCipher, TokenConfig};
use crate::error::VdiError;
use crate::token::descriptor::ConnectionDescriptor;
use crate::token::TokenError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// IV length for AES-256-CBC.
pub const AES_IV_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305.
pub const CHACHA_NONCE_LEN: usize = 12;

/// `{iv, value}` pair, both base64, that is itself base64-encoded as the token.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    iv: String,
    value: String,
}

/// Seals connection descriptors into opaque tokens and opens them again.
///
/// Both ends hold the same static key; there is no key negotiation.
#[derive(Clone)]
pub struct TokenSealer {
    key: [u8; 32],
    cipher: TokenCipher,
}

impl std::fmt::Debug for TokenSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSealer")
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

impl TokenSealer {
    pub fn new(config: &TokenConfig) -> Result<Self, VdiError> {
        Ok(Self::from_key(config.key_bytes()?, config.cipher))
    }

    pub fn from_key(key: [u8; 32], cipher: TokenCipher) -> Self {
        Self { key, cipher }
    }

    pub fn cipher(&self) -> TokenCipher {
        self.cipher
    }

    /// Encrypt `descriptor` under a fresh random IV.
    ///
    /// Display dimensions are raised to the gateway minimum before sealing.
    pub fn seal(&self, descriptor: &ConnectionDescriptor) -> Result<String, TokenError> {
        let plaintext = serde_json::to_vec(&descriptor.clone().sanitized())
            .map_err(|_| TokenError::Payload)?;

        let (iv, ciphertext) = match self.cipher {
            TokenCipher::Aes256Cbc => {
                let iv = random_bytes::<AES_IV_LEN>();
                let enc = Aes256CbcEnc::new_from_slices(&self.key, &iv)
                    .map_err(|_| TokenError::Key)?;
                (iv.to_vec(), enc.encrypt_padded_vec_mut::<Pkcs7>(&plaintext))
            }
            TokenCipher::ChaCha20Poly1305 => {
                let nonce = random_bytes::<CHACHA_NONCE_LEN>();
                let aead = ChaCha20Poly1305::new_from_slice(&self.key)
                    .map_err(|_| TokenError::Key)?;
                let ciphertext = aead
                    .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
                    .map_err(|_| TokenError::Decrypt)?;
                (nonce.to_vec(), ciphertext)
            }
        };

        let envelope = Envelope {
            iv: STANDARD.encode(iv),
            value: STANDARD.encode(ciphertext),
        };
        let json = serde_json::to_vec(&envelope).map_err(|_| TokenError::Envelope)?;
        Ok(STANDARD.encode(json))
    }

    /// Recover the descriptor from a token that may have been mangled in
    /// transit (percent-encoded, `+` turned into spaces, URL-safe alphabet).
    pub fn open(&self, token: &str) -> Result<ConnectionDescriptor, TokenError> {
        let result = self.open_normalized(&normalize_token(token));
        if let Err(ref e) = result {
            tracing::warn!(error = %e, cipher = %self.cipher, "Rejected session token");
        }
        result
    }

    fn open_normalized(&self, token: &str) -> Result<ConnectionDescriptor, TokenError> {
        let json = STANDARD.decode(token).map_err(|_| TokenError::Encoding)?;
        let envelope: Envelope =
            serde_json::from_slice(&json).map_err(|_| TokenError::Envelope)?;
        let iv = STANDARD
            .decode(normalize_token(&envelope.iv))
            .map_err(|_| TokenError::Envelope)?;
        let ciphertext = STANDARD
            .decode(normalize_token(&envelope.value))
            .map_err(|_| TokenError::Envelope)?;

        let plaintext = match self.cipher {
            TokenCipher::Aes256Cbc => {
                let dec = Aes256CbcDec::new_from_slices(&self.key, &iv)
                    .map_err(|_| TokenError::Envelope)?;
                dec.decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
                    .map_err(|_| TokenError::Decrypt)?
            }
            TokenCipher::ChaCha20Poly1305 => {
                if iv.len() != CHACHA_NONCE_LEN {
                    return Err(TokenError::Envelope);
                }
                let aead = ChaCha20Poly1305::new_from_slice(&self.key)
                    .map_err(|_| TokenError::Key)?;
                aead.decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
                    .map_err(|_| TokenError::Decrypt)?
            }
        };

        serde_json::from_slice(&plaintext).map_err(|_| TokenError::Payload)
    }
}

/// Undo the distortions intermediaries apply to a base64 token.
pub fn normalize_token(raw: &str) -> String {
    let trimmed = raw.trim();
    let decoded = if trimmed.contains('%') {
        urlencoding::decode(trimmed)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| trimmed.to_string())
    } else {
        trimmed.to_string()
    };

    let mut token: String = decoded
        .chars()
        .map(|c| match c {
            ' ' | '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();

    let rem = token.len() % 4;
    if rem != 0 {
        token.extend(std::iter::repeat('=').take(4 - rem));
    }
    token
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
