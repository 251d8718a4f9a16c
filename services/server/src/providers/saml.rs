// SAML service-provider authorizer

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;

use thand_shared::auth::Session;
use thand_shared::{BasicConfig, Result, ServiceError, UserIdentity};

use super::{AuthorizeSessionResponse, AuthorizeUser, Authorizer};
use crate::saml::{parse_saml_response, validate_assertion, ReplayCache, SamlExpectations};

const DEFAULT_SESSION_HOURS: u64 = 8;

pub struct SamlAuthorizer {
    name: String,
    idp_sso_url: String,
    entity_id: String,
    idp_cert_fingerprint: Option<String>,
    idp_initiated: bool,
    session_hours: u64,
    replay_cache: Arc<ReplayCache>,
}

impl SamlAuthorizer {
    pub fn new(name: &str, config: &BasicConfig, replay_cache: Arc<ReplayCache>) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            idp_sso_url: config.require("idp_sso_url")?.to_string(),
            entity_id: config.require("entity_id")?.to_string(),
            idp_cert_fingerprint: config.get("idp_cert_fingerprint").map(|s| s.to_string()),
            idp_initiated: config.get_bool("idp_initiated"),
            session_hours: config.get_u64("session_hours").unwrap_or(DEFAULT_SESSION_HOURS),
            replay_cache,
        })
    }

    pub fn idp_initiated_enabled(&self) -> bool {
        self.idp_initiated
    }
}

#[async_trait]
impl Authorizer for SamlAuthorizer {
    async fn authorize_session(&self, req: AuthorizeUser) -> Result<AuthorizeSessionResponse> {
        // SP-initiated redirect. The IdP is configured with this SP's ACS URL;
        // the opaque state rides in RelayState.
        let url = format!(
            "{}?RelayState={}",
            self.idp_sso_url,
            urlencoding::encode(&req.state),
        );
        Ok(AuthorizeSessionResponse { url })
    }

    async fn create_session(&self, req: AuthorizeUser) -> Result<Session> {
        let encoded = req.code.as_deref().ok_or_else(|| {
            ServiceError::Validation("SAMLResponse is required".to_string())
        })?;

        let assertion = parse_saml_response(encoded)?;

        let expectations = SamlExpectations {
            acs_url: req.redirect_uri.clone(),
            audience: Some(self.entity_id.clone()),
            idp_cert_fingerprint: self.idp_cert_fingerprint.clone(),
        };
        validate_assertion(&assertion, &expectations, Utc::now())?;

        // Accepted assertion IDs are remembered for the validity window;
        // duplicates are replay.
        self.replay_cache.insert(&assertion.assertion_id)?;

        let email = assertion.subject.clone();
        thand_shared::auth::validate_member_email(&email)
            .map_err(|_| ServiceError::Unauthorized("SAML subject is not an email".to_string()))?;

        let user = UserIdentity {
            id: email.clone(),
            username: email.split('@').next().unwrap_or_default().to_string(),
            name: assertion.attribute("displayName").unwrap_or_default().to_string(),
            groups: assertion.attribute_values("groups"),
            source: self.name.clone(),
            email,
        };

        let expires_at = assertion
            .not_on_or_after
            .map(|w| w + Duration::hours(self.session_hours as i64))
            .unwrap_or_else(|| Utc::now() + Duration::hours(self.session_hours as i64));

        tracing::info!(
            provider = %self.name,
            email = %user.email,
            assertion_id = %assertion.assertion_id,
            "SAML session created"
        );
        Ok(Session::new(
            user,
            thand_shared::crypto::generate_token(32),
            expires_at,
        ))
    }

    async fn validate_session(&self, session: &Session) -> Result<()> {
        if session.is_expired() {
            return Err(ServiceError::Unauthorized("session expired".to_string()));
        }
        Ok(())
    }

    async fn renew_session(&self, _session: &Session) -> Result<Session> {
        Err(ServiceError::Unauthorized(
            "SAML sessions cannot be renewed; re-authenticate with the IdP".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use std::collections::HashMap;

    fn authorizer() -> SamlAuthorizer {
        let config = BasicConfig(HashMap::from([
            (
                "idp_sso_url".to_string(),
                "https://idp.example.com/sso".to_string(),
            ),
            ("entity_id".to_string(), "https://sp.example.com".to_string()),
            ("idp_initiated".to_string(), "true".to_string()),
        ]));
        SamlAuthorizer::new(
            "corp-saml",
            &config,
            Arc::new(ReplayCache::new(std::time::Duration::from_secs(300))),
        )
        .unwrap()
    }

    fn sample_response() -> String {
        let xml = format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"
    ID="_resp1" Destination="https://sp.example.com/auth/callback/corp-saml">
  <saml:Assertion ID="_abc123">
    <saml:Subject><saml:NameID>dev@example.com</saml:NameID></saml:Subject>
    <saml:Conditions NotBefore="2024-01-01T00:00:00Z" NotOnOrAfter="{}">
      <saml:AudienceRestriction><saml:Audience>https://sp.example.com</saml:Audience></saml:AudienceRestriction>
    </saml:Conditions>
  </saml:Assertion>
</samlp:Response>"#,
            (Utc::now() + Duration::minutes(5)).to_rfc3339()
        );
        BASE64_STANDARD.encode(xml)
    }

    fn request(code: String) -> AuthorizeUser {
        AuthorizeUser {
            scopes: vec![],
            state: String::new(),
            code: Some(code),
            redirect_uri: "https://sp.example.com/auth/callback/corp-saml".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_session_from_assertion() {
        let authorizer = authorizer();
        let session = authorizer
            .create_session(request(sample_response()))
            .await
            .unwrap();
        assert_eq!(session.user.email, "dev@example.com");
        assert_eq!(session.user.source, "corp-saml");
        assert!(!session.is_expired());
    }

    #[tokio::test]
    async fn test_identical_assertion_is_replay() {
        let authorizer = authorizer();
        let encoded = sample_response();

        authorizer
            .create_session(request(encoded.clone()))
            .await
            .unwrap();
        let err = authorizer
            .create_session(request(encoded))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ReplayDetected(_)));
    }

    #[tokio::test]
    async fn test_renew_not_supported() {
        let authorizer = authorizer();
        let session = authorizer
            .create_session(request(sample_response()))
            .await
            .unwrap();
        assert!(authorizer.renew_session(&session).await.is_err());
    }

    #[tokio::test]
    async fn test_authorize_url_carries_relay_state() {
        let authorizer = authorizer();
        let response = authorizer
            .authorize_session(AuthorizeUser {
                state: "opaque".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(response.url, "https://idp.example.com/sso?RelayState=opaque");
    }
}
