use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::{CacheError, CacheLookup, SharedCache};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Token pair held for a proxy-managed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session key must be 32 bytes of hex")]
    InvalidKey,
    #[error("failed to serialize session")]
    Encode,
    #[error("failed to encrypt session")]
    Encrypt,
    #[error("session store unavailable: {0}")]
    Store(#[from] CacheError),
    #[error("session not found")]
    NotFound,
    #[error("malformed session payload")]
    Malformed,
    #[error("session authentication failed")]
    Decrypt,
    #[error("failed to deserialize session")]
    Decode,
}

/// Session records encrypted at rest with AES-256-GCM.
///
/// Stored value: hex(nonce || ciphertext || tag) under `session:<id>`.
/// Expiry is delegated to the cache TTL.
#[derive(Clone)]
pub struct EncryptedSessionStore {
    cache: Arc<dyn SharedCache>,
    cipher: Aes256Gcm,
}

impl EncryptedSessionStore {
    pub fn new(cache: Arc<dyn SharedCache>, key_hex: &str) -> Result<Self, SessionError> {
        let key = hex::decode(key_hex.trim()).map_err(|_| SessionError::InvalidKey)?;
        if key.len() != KEY_LEN {
            return Err(SessionError::InvalidKey);
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Ok(Self { cache, cipher })
    }

    fn storage_key(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    /// Encrypts under a fresh random nonce. The nonce is never reused.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SessionError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, SessionError> {
        if data.len() < NONCE_LEN {
            return Err(SessionError::Malformed);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SessionError::Decrypt)
    }

    pub async fn create_session(
        &self,
        session_id: &str,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<(), SessionError> {
        let plaintext = serde_json::to_vec(record).map_err(|_| SessionError::Encode)?;
        let sealed = self.encrypt(&plaintext)?;
        self.cache
            .set_ex(&Self::storage_key(session_id), &hex::encode(sealed), ttl)
            .await?;
        debug!(ttl_secs = ttl.as_secs(), "session stored");
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionRecord, SessionError> {
        let stored = match self.cache.get(&Self::storage_key(session_id)).await {
            CacheLookup::Found(v) => v,
            CacheLookup::NotFound => return Err(SessionError::NotFound),
            CacheLookup::Unavailable(e) => return Err(SessionError::Store(e)),
        };
        let sealed = hex::decode(stored).map_err(|_| SessionError::Malformed)?;
        let plaintext = self.decrypt(&sealed)?;
        serde_json::from_slice(&plaintext).map_err(|_| SessionError::Decode)
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.cache.delete(&Self::storage_key(session_id)).await?;
        Ok(())
    }
}
