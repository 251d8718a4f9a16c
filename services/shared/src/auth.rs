// Session and auth-state types shared between server and agent

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::EncryptionService;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{Result, ServiceError};
use crate::types::UserIdentity;

/// Primary cookie carrying the active-provider attribute.
pub const COOKIE_PRIMARY: &str = "_thand";
/// Session cookie lifetime: 7 days.
pub const COOKIE_MAX_AGE_SECS: i64 = 7 * 24 * 3600;

pub fn provider_cookie_name(provider: &str) -> String {
    format!("{}_{}", COOKIE_PRIMARY, provider)
}

/// Opaque state round-tripped through OAuth2/SAML providers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthState {
    /// Post-auth URL the browser is sent back to.
    pub callback: String,
    /// Stable device identifier of the originating client.
    #[serde(default)]
    pub client_id: String,
    pub provider: String,
    /// Optional client-issued nonce, echoed back for session handoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// One-time bootstrap code for client to agent session handoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootstrapCode {
    pub callback_url: String,
    pub issued_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl BootstrapCode {
    pub fn new(callback_url: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            callback_url: callback_url.into(),
            issued_at: Utc::now(),
            ttl_secs,
        }
    }

    pub fn is_valid(&self, expected_callback: &str) -> bool {
        let age = Utc::now().signed_duration_since(self.issued_at);
        age >= Duration::zero()
            && age <= Duration::seconds(self.ttl_secs as i64)
            && self.callback_url == expected_callback
    }
}

/// Server-side session view. Only the server reads its internals; the agent
/// holds the sealed form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub uuid: String,
    pub user: UserIdentity,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user: UserIdentity, access_token: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            user,
            access_token,
            refresh_token: None,
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Client-visible, encrypted-at-rest form of a server session. The payload is
/// a sealed `SESSION_LOCAL` envelope only the server can open.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalSession {
    pub version: u32,
    pub expires_at: DateTime<Utc>,
    pub payload: String,
}

pub const LOCAL_SESSION_VERSION: u32 = 1;

impl LocalSession {
    /// Seal a server session into its client-visible form.
    pub fn seal(session: &Session, encryption: &EncryptionService) -> Result<Self> {
        let payload = Envelope::seal_payload(EnvelopeKind::SessionLocal, session, encryption)?;
        Ok(Self {
            version: LOCAL_SESSION_VERSION,
            expires_at: session.expires_at,
            payload,
        })
    }

    /// Recover the server session. Only meaningful on the server side.
    pub fn open(&self, encryption: &EncryptionService) -> Result<Session> {
        Envelope::open_payload(&self.payload, EnvelopeKind::SessionLocal, encryption)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Wire form carried in cookies and the `X-API-Key` header.
    pub fn encode(&self) -> Result<String> {
        Envelope::new(EnvelopeKind::SessionLocal, self)?.encode()
    }

    pub fn decode(token: &str) -> Result<Self> {
        Envelope::decode(token)?.expect(EnvelopeKind::SessionLocal)
    }
}

static MEMBER_EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_%+-]+(?:\.[A-Za-z0-9_%+-]+)*@[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)+$")
        .expect("member email pattern")
});

/// Validate that a member string is a plausible RFC-5322 address before it is
/// composed into a provider binding.
pub fn validate_member_email(email: &str) -> Result<()> {
    if email.len() <= 254 && MEMBER_EMAIL.is_match(email) {
        Ok(())
    } else {
        Err(ServiceError::Validation(format!(
            "invalid member address: {}",
            email
        )))
    }
}
