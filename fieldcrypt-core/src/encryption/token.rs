//! Self-describing authenticated token using AES-256-GCM
//!
//! Layout: `0x80 | timestamp (u64 BE, unix seconds) | nonce (12) | ciphertext + tag (16)`.
//! The whole header is bound as associated data.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use chrono::Utc;

/// Leading marker byte of every token
pub const TOKEN_VERSION: u8 = 0x80;

const TIMESTAMP_LEN: usize = 8;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Length of the authenticated header
pub const TOKEN_HEADER_LEN: usize = 1 + TIMESTAMP_LEN + NONCE_LEN;

/// Smallest possible token (empty plaintext)
pub const MIN_TOKEN_LEN: usize = TOKEN_HEADER_LEN + TAG_LEN;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token")]
    InvalidToken,

    #[error("token encryption failed")]
    Encryption,
}

/// Cipher bound to one derived 32-byte key
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Seal `plaintext` stamped with the current time
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, TokenError> {
        let now = Utc::now().timestamp().max(0) as u64;
        self.encrypt_at(plaintext, now)
    }

    /// Seal `plaintext` with an explicit timestamp
    pub fn encrypt_at(&self, plaintext: &[u8], timestamp: u64) -> Result<Vec<u8>, TokenError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let mut token = Vec::with_capacity(MIN_TOKEN_LEN + plaintext.len());
        token.push(TOKEN_VERSION);
        token.extend_from_slice(&timestamp.to_be_bytes());
        token.extend_from_slice(&nonce);

        let sealed = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &token,
                },
            )
            .map_err(|_| TokenError::Encryption)?;

        token.extend_from_slice(&sealed);
        Ok(token)
    }

    /// Open a token; any structural or authentication failure is `InvalidToken`
    pub fn decrypt(&self, token: &[u8]) -> Result<Vec<u8>, TokenError> {
        if !looks_like_token(token) {
            return Err(TokenError::InvalidToken);
        }

        let (header, sealed) = token.split_at(TOKEN_HEADER_LEN);
        let nonce = Nonce::from_slice(&header[1 + TIMESTAMP_LEN..]);

        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: sealed,
                    aad: header,
                },
            )
            .map_err(|_| TokenError::InvalidToken)
    }
}

/// Cheap structural check: marker byte and minimum length
pub fn looks_like_token(bytes: &[u8]) -> bool {
    bytes.len() >= MIN_TOKEN_LEN && bytes[0] == TOKEN_VERSION
}

/// Creation timestamp embedded in a token (unauthenticated read)
pub fn token_timestamp(token: &[u8]) -> Result<u64, TokenError> {
    if !looks_like_token(token) {
        return Err(TokenError::InvalidToken);
    }
    let mut buf = [0u8; TIMESTAMP_LEN];
    buf.copy_from_slice(&token[1..1 + TIMESTAMP_LEN]);
    Ok(u64::from_be_bytes(buf))
}
