// SAML service-provider support: response parsing, replay cache, CSRF tokens

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thand_shared::{Result, ServiceError};

/// Parsed and minimally validated SAML assertion content.
#[derive(Debug, Clone, Default)]
pub struct SamlAssertion {
    pub response_id: String,
    pub assertion_id: String,
    pub destination: String,
    pub subject: String,
    pub audience: String,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub attributes: HashMap<String, Vec<String>>,
    pub certificate: Option<String>,
}

impl SamlAssertion {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|values| values.first())
            .map(|s| s.as_str())
    }

    pub fn attribute_values(&self, name: &str) -> Vec<String> {
        self.attributes.get(name).cloned().unwrap_or_default()
    }
}

/// Validation expectations derived from provider configuration. The inbound
/// request must match the ACS URL exactly and parameters are taken from the
/// POST form only.
#[derive(Debug, Clone)]
pub struct SamlExpectations {
    pub acs_url: String,
    pub audience: Option<String>,
    /// Hex SHA-256 fingerprint of the IdP signing certificate.
    pub idp_cert_fingerprint: Option<String>,
}

/// Decode and parse a base64 `SAMLResponse` form value.
pub fn parse_saml_response(encoded: &str) -> Result<SamlAssertion> {
    let xml_bytes = BASE64_STANDARD
        .decode(encoded.trim().replace(['\n', '\r'], ""))
        .map_err(|_| ServiceError::Validation("malformed SAMLResponse encoding".to_string()))?;
    let xml = String::from_utf8(xml_bytes)
        .map_err(|_| ServiceError::Validation("SAMLResponse is not valid UTF-8".to_string()))?;
    parse_saml_xml(&xml)
}

fn parse_saml_xml(xml: &str) -> Result<SamlAssertion> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut assertion = SamlAssertion::default();
    let mut capture: Option<&'static str> = None;
    let mut current_attribute: Option<String> = None;
    let mut in_assertion = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                match e.local_name().as_ref() {
                    b"Response" => {
                        for attr in e.attributes().flatten() {
                            let value = attr.unescape_value().unwrap_or_default().to_string();
                            match attr.key.local_name().as_ref() {
                                b"ID" => assertion.response_id = value,
                                b"Destination" => assertion.destination = value,
                                _ => {}
                            }
                        }
                    }
                    b"Assertion" => {
                        in_assertion = true;
                        for attr in e.attributes().flatten() {
                            if attr.key.local_name().as_ref() == b"ID" {
                                assertion.assertion_id =
                                    attr.unescape_value().unwrap_or_default().to_string();
                            }
                        }
                    }
                    b"Conditions" if in_assertion => {
                        for attr in e.attributes().flatten() {
                            let value = attr.unescape_value().unwrap_or_default();
                            match attr.key.local_name().as_ref() {
                                b"NotBefore" => {
                                    assertion.not_before = parse_saml_instant(&value);
                                }
                                b"NotOnOrAfter" => {
                                    assertion.not_on_or_after = parse_saml_instant(&value);
                                }
                                _ => {}
                            }
                        }
                    }
                    b"NameID" => capture = Some("subject"),
                    b"Audience" => capture = Some("audience"),
                    b"X509Certificate" => capture = Some("certificate"),
                    b"Attribute" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.local_name().as_ref() == b"Name" {
                                current_attribute =
                                    Some(attr.unescape_value().unwrap_or_default().to_string());
                            }
                        }
                    }
                    b"AttributeValue" => capture = Some("attribute_value"),
                    _ => {}
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(target) = capture.take() {
                    let text = t.unescape().unwrap_or_default().to_string();
                    match target {
                        "subject" => assertion.subject = text,
                        "audience" => assertion.audience = text,
                        "certificate" => {
                            assertion.certificate = Some(text.replace(['\n', '\r', ' '], ""))
                        }
                        "attribute_value" => {
                            if let Some(name) = &current_attribute {
                                assertion
                                    .attributes
                                    .entry(name.clone())
                                    .or_default()
                                    .push(text);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"Attribute" {
                    current_attribute = None;
                }
                capture = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ServiceError::Validation(format!(
                    "malformed SAML response XML: {}",
                    e
                )))
            }
            _ => {}
        }
    }

    if assertion.assertion_id.is_empty() {
        return Err(ServiceError::Validation(
            "SAML response carries no assertion".to_string(),
        ));
    }
    if assertion.subject.is_empty() {
        return Err(ServiceError::Validation(
            "SAML assertion carries no subject".to_string(),
        ));
    }
    Ok(assertion)
}

fn parse_saml_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Validate an assertion against the SP's expectations: exact ACS match,
/// audience restriction, validity window and IdP certificate fingerprint.
pub fn validate_assertion(
    assertion: &SamlAssertion,
    expectations: &SamlExpectations,
    now: DateTime<Utc>,
) -> Result<()> {
    if !assertion.destination.is_empty() && assertion.destination != expectations.acs_url {
        return Err(ServiceError::Validation(format!(
            "SAML destination {} does not match ACS URL",
            assertion.destination
        )));
    }

    if let Some(audience) = &expectations.audience {
        if !assertion.audience.is_empty() && &assertion.audience != audience {
            return Err(ServiceError::Validation(format!(
                "SAML audience {} does not match entity id",
                assertion.audience
            )));
        }
    }

    if let Some(not_before) = assertion.not_before {
        if now < not_before {
            return Err(ServiceError::Validation(
                "SAML assertion not yet valid".to_string(),
            ));
        }
    }
    if let Some(not_on_or_after) = assertion.not_on_or_after {
        if now >= not_on_or_after {
            return Err(ServiceError::Validation(
                "SAML assertion expired".to_string(),
            ));
        }
    }

    if let Some(expected) = &expectations.idp_cert_fingerprint {
        let cert = assertion.certificate.as_deref().ok_or_else(|| {
            ServiceError::Validation("SAML response carries no signing certificate".to_string())
        })?;
        let der = BASE64_STANDARD
            .decode(cert)
            .map_err(|_| ServiceError::Validation("malformed signing certificate".to_string()))?;
        let fingerprint = hex_digest(&Sha256::digest(der));
        let normalized: String = expected
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .collect::<String>()
            .to_lowercase();
        if fingerprint != normalized {
            return Err(ServiceError::Unauthorized(
                "SAML signing certificate does not match configured IdP".to_string(),
            ));
        }
    }

    Ok(())
}

fn hex_digest(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// TTL-indexed set of accepted assertion IDs. Duplicates within the TTL are
/// rejected as replay; a periodic sweeper evicts expired entries.
pub struct ReplayCache {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl ReplayCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record an assertion ID, rejecting replays within the TTL.
    pub fn insert(&self, assertion_id: &str) -> Result<()> {
        let mut seen = self.seen.lock().unwrap();
        let now = Instant::now();
        if let Some(at) = seen.get(assertion_id) {
            if now.duration_since(*at) < self.ttl {
                tracing::warn!(
                    assertion_id = %assertion_id,
                    event = "security.replay_detected",
                    "SAML assertion replay rejected"
                );
                return Err(ServiceError::ReplayDetected(assertion_id.to_string()));
            }
        }
        seen.insert(assertion_id.to_string(), now);
        Ok(())
    }

    pub fn sweep(&self) {
        let mut seen = self.seen.lock().unwrap();
        let now = Instant::now();
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-use CSRF tokens for IdP-initiated flows. Consumption clears the
/// token regardless of outcome.
pub struct CsrfStore {
    tokens: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl CsrfStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn issue(&self) -> String {
        let token = thand_shared::crypto::generate_token(24);
        self.tokens
            .lock()
            .unwrap()
            .insert(token.clone(), Instant::now());
        token
    }

    /// Consume a token. Returns whether it was known and fresh; the entry is
    /// removed either way.
    pub fn consume(&self, token: &str) -> bool {
        let mut tokens = self.tokens.lock().unwrap();
        match tokens.remove(token) {
            Some(at) => at.elapsed() < self.ttl,
            None => false,
        }
    }

    pub fn sweep(&self) {
        let mut tokens = self.tokens.lock().unwrap();
        tokens.retain(|_, at| at.elapsed() < self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
    xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"
    ID="_resp1" Destination="https://sp.example.com/auth/callback/corp-saml">
  <saml:Assertion ID="_abc123" IssueInstant="2024-05-01T10:00:00Z">
    <saml:Subject>
      <saml:NameID Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress">dev@example.com</saml:NameID>
    </saml:Subject>
    <saml:Conditions NotBefore="2024-05-01T09:55:00Z" NotOnOrAfter="2034-05-01T10:05:00Z">
      <saml:AudienceRestriction>
        <saml:Audience>https://sp.example.com</saml:Audience>
      </saml:AudienceRestriction>
    </saml:Conditions>
    <saml:AttributeStatement>
      <saml:Attribute Name="groups">
        <saml:AttributeValue>engineering</saml:AttributeValue>
        <saml:AttributeValue>oncall</saml:AttributeValue>
      </saml:Attribute>
      <saml:Attribute Name="displayName">
        <saml:AttributeValue>Dev Example</saml:AttributeValue>
      </saml:Attribute>
    </saml:AttributeStatement>
  </saml:Assertion>
</samlp:Response>"#;

    fn encoded_sample() -> String {
        BASE64_STANDARD.encode(SAMPLE_RESPONSE)
    }

    fn expectations() -> SamlExpectations {
        SamlExpectations {
            acs_url: "https://sp.example.com/auth/callback/corp-saml".to_string(),
            audience: Some("https://sp.example.com".to_string()),
            idp_cert_fingerprint: None,
        }
    }

    #[test]
    fn test_parse_assertion_fields() {
        let assertion = parse_saml_response(&encoded_sample()).unwrap();
        assert_eq!(assertion.assertion_id, "_abc123");
        assert_eq!(assertion.subject, "dev@example.com");
        assert_eq!(assertion.audience, "https://sp.example.com");
        assert_eq!(
            assertion.attribute_values("groups"),
            vec!["engineering", "oncall"]
        );
        assert_eq!(assertion.attribute("displayName"), Some("Dev Example"));
        assert!(assertion.not_before.is_some());
    }

    #[test]
    fn test_validate_destination_mismatch() {
        let assertion = parse_saml_response(&encoded_sample()).unwrap();
        let mut exp = expectations();
        exp.acs_url = "https://other.example.com/acs".to_string();
        assert!(validate_assertion(&assertion, &exp, Utc::now()).is_err());
    }

    #[test]
    fn test_validate_window() {
        let assertion = parse_saml_response(&encoded_sample()).unwrap();
        let exp = expectations();
        assert!(validate_assertion(&assertion, &exp, Utc::now()).is_ok());

        let too_early = "2024-05-01T09:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(validate_assertion(&assertion, &exp, too_early).is_err());

        let too_late = "2044-05-01T10:10:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(validate_assertion(&assertion, &exp, too_late).is_err());
    }

    #[test]
    fn test_missing_subject_rejected() {
        let xml = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
            xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_r">
            <saml:Assertion ID="_a"></saml:Assertion></samlp:Response>"#;
        let encoded = BASE64_STANDARD.encode(xml);
        assert!(parse_saml_response(&encoded).is_err());
    }

    #[test]
    fn test_replay_cache_rejects_within_ttl() {
        let cache = ReplayCache::new(Duration::from_secs(300));
        cache.insert("_abc123").unwrap();
        assert!(matches!(
            cache.insert("_abc123"),
            Err(ServiceError::ReplayDetected(_))
        ));
        // A different assertion is unaffected.
        cache.insert("_def456").unwrap();
    }

    #[test]
    fn test_replay_cache_allows_after_ttl() {
        let cache = ReplayCache::new(Duration::from_millis(10));
        cache.insert("_abc123").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.insert("_abc123").is_ok());
    }

    #[test]
    fn test_replay_cache_sweep() {
        let cache = ReplayCache::new(Duration::from_millis(10));
        cache.insert("_a").unwrap();
        cache.insert("_b").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        cache.sweep();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_csrf_tokens_are_single_use() {
        let store = CsrfStore::new(Duration::from_secs(60));
        let token = store.issue();
        assert!(store.consume(&token));
        assert!(!store.consume(&token));
        assert!(!store.consume("unknown"));
    }
}
