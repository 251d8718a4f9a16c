// Typed encoding envelope for every cross-process payload

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::EncryptionService;
use crate::error::{Result, ServiceError};

/// Maximum encoded size for tokens that ride in URLs. Larger payloads must
/// travel in POST bodies.
pub const MAX_URL_TOKEN_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    Auth,
    WorkflowTask,
    WorkflowSignal,
    SessionLocal,
    SessionCode,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnvelopeKind::Auth => "AUTH",
            EnvelopeKind::WorkflowTask => "WORKFLOW_TASK",
            EnvelopeKind::WorkflowSignal => "WORKFLOW_SIGNAL",
            EnvelopeKind::SessionLocal => "SESSION_LOCAL",
            EnvelopeKind::SessionCode => "SESSION_CODE",
        };
        f.write_str(s)
    }
}

/// The universal cross-process payload: a typed record with a stable framing.
/// Consumers must pin the kind they expect; decryption always precedes
/// type dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: EnvelopeKind, data: &T) -> Result<Self> {
        Ok(Self {
            kind,
            data: serde_json::to_value(data)?,
        })
    }

    /// Plaintext framing: base64url over canonical JSON. Tamper-evident only
    /// through JSON structure; use `seal` for anything crossing a trust
    /// boundary.
    pub fn encode(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| ServiceError::InvalidState("malformed envelope encoding".to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| ServiceError::InvalidState("malformed envelope payload".to_string()))
    }

    /// AEAD over canonical bytes, then framing. The result is URL-safe.
    pub fn seal(&self, encryption: &EncryptionService) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        let token = encryption.seal(&bytes)?;
        if token.len() > MAX_URL_TOKEN_BYTES {
            tracing::warn!(
                kind = %self.kind,
                size = token.len(),
                "Sealed envelope exceeds URL budget; must travel in a POST body"
            );
        }
        Ok(token)
    }

    pub fn open(token: &str, encryption: &EncryptionService) -> Result<Self> {
        let bytes = encryption.open(token)?;
        serde_json::from_slice(&bytes)
            .map_err(|_| ServiceError::InvalidState("malformed envelope payload".to_string()))
    }

    /// Extract the payload, rejecting envelopes of a different kind.
    pub fn expect<T: DeserializeOwned>(&self, kind: EnvelopeKind) -> Result<T> {
        if self.kind != kind {
            return Err(ServiceError::InvalidStateType {
                expected: kind.to_string(),
                actual: self.kind.to_string(),
            });
        }
        serde_json::from_value(self.data.clone())
            .map_err(|e| ServiceError::InvalidState(format!("envelope payload: {}", e)))
    }

    /// Seal a typed payload in one step.
    pub fn seal_payload<T: Serialize>(
        kind: EnvelopeKind,
        data: &T,
        encryption: &EncryptionService,
    ) -> Result<String> {
        Envelope::new(kind, data)?.seal(encryption)
    }

    /// Open a sealed token and extract the payload, pinning the kind.
    pub fn open_payload<T: DeserializeOwned>(
        token: &str,
        kind: EnvelopeKind,
        encryption: &EncryptionService,
    ) -> Result<T> {
        Envelope::open(token, encryption)?.expect(kind)
    }

    /// True when the encoded form fits in a URL.
    pub fn fits_in_url(token: &str) -> bool {
        token.len() <= MAX_URL_TOKEN_BYTES
    }
}
