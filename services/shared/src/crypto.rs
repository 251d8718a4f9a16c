// Symmetric encryption for cross-process tokens

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::{Result, ServiceError};

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// AES-256-GCM service over the process-wide key. All cross-process tokens
/// (auth state, workflow tasks, local sessions, bootstrap codes) are sealed
/// through this service.
#[derive(Clone)]
pub struct EncryptionService {
    cipher: Aes256Gcm,
    fingerprint: String,
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl EncryptionService {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        let fingerprint = hex_prefix(&Sha256::digest(key));
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            fingerprint,
        }
    }

    /// Build from a base64url encoded key string.
    pub fn from_encoded_key(encoded: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| ServiceError::Configuration(format!("invalid encryption key: {}", e)))?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| ServiceError::Configuration("encryption key must be 32 bytes".to_string()))?;
        Ok(Self::new(&key))
    }

    /// Load the key from `path`, generating and persisting a fresh one on
    /// first run.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let encoded = std::fs::read_to_string(path)?;
            return Self::from_encoded_key(&encoded);
        }

        let key = generate_key();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, URL_SAFE_NO_PAD.encode(key))?;
        tracing::info!(path = %path.display(), "Generated new encryption key");
        Ok(Self::new(&key))
    }

    /// Short key fingerprint, safe to log.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Seal plaintext into a URL-safe token: base64url(nonce || ciphertext).
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| ServiceError::Internal("encryption failed".to_string()))?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(framed))
    }

    /// Open a sealed token. Fails closed on any framing or integrity error.
    pub fn open(&self, token: &str) -> Result<Vec<u8>> {
        let framed = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| ServiceError::InvalidState("malformed token encoding".to_string()))?;
        if framed.len() <= NONCE_LEN {
            return Err(ServiceError::InvalidState("token too short".to_string()));
        }

        let (nonce, ciphertext) = framed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ServiceError::InvalidState("token integrity check failed".to_string()))
    }
}

pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Random URL-safe token for CSRF and one-time codes.
pub fn generate_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn hex_prefix(digest: &[u8]) -> String {
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}
