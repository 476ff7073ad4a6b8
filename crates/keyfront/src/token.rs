//! Unverified JWT inspection and the persisted token record.
//!
//! [`decode_payload`] is a best-effort client-side read of a token's claim
//! set. It performs no signature verification and must never be used as a
//! trust boundary; server-side middleware owns verification.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Decode a JWT payload segment without verifying the signature.
///
/// Splits on `.`, base64url-decodes the middle segment and parses it as
/// JSON. Returns `None` and logs on any malformed input (wrong segment
/// count, invalid base64, invalid JSON) rather than erroring.
#[must_use]
pub fn decode_payload(jwt: &str) -> Option<Value> {
    let segments: Vec<&str> = jwt.split('.').collect();
    if segments.len() != 3 {
        warn!(segments = segments.len(), "malformed JWT: expected three segments");
        return None;
    }

    let raw = match URL_SAFE_NO_PAD.decode(segments[1].trim_end_matches('=')) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(%err, "malformed JWT: payload is not valid base64url");
            return None;
        }
    };

    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(%err, "malformed JWT: payload is not valid JSON");
            None
        }
    }
}

/// Seconds until the payload's `exp` claim, relative to now.
///
/// Negative when the token is already expired; `None` when the payload has
/// no numeric `exp` claim.
#[must_use]
pub fn expiry_seconds(payload: &Value) -> Option<i64> {
    payload.get("exp").and_then(Value::as_i64).map(|exp| exp - Utc::now().timestamp())
}

/// Whether `payload.realm_access.roles` contains `role`.
#[must_use]
pub fn has_realm_role(payload: &Value, role: &str) -> bool {
    roles_contain(payload.pointer("/realm_access/roles"), role)
}

/// Whether `payload.resource_access[client_id].roles` contains `role`.
#[must_use]
pub fn has_client_role(payload: &Value, client_id: &str, role: &str) -> bool {
    roles_contain(
        payload.get("resource_access").and_then(|ra| ra.get(client_id)).and_then(|c| c.get("roles")),
        role,
    )
}

/// Arbitrary claim lookup. Claim sets are schema-less across identity
/// providers, so this stays a generic JSON accessor.
#[must_use]
pub fn claim<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    payload.get(key)
}

fn roles_contain(roles: Option<&Value>, role: &str) -> bool {
    roles
        .and_then(Value::as_array)
        .is_some_and(|roles| roles.iter().any(|r| r.as_str() == Some(role)))
}

/// Token set persisted by external-mode platform storage.
///
/// Mirrors the token endpoint response: access token plus optional ID and
/// refresh tokens, and the optional delegated-encryption session token
/// ("doken") issued alongside them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokens {
    /// JWT access token.
    pub access_token: String,

    /// ID token (OpenID Connect), when issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    /// Refresh token, when issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Delegated-encryption session token authorizing the enclave protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doken: Option<String>,
}

impl StoredTokens {
    /// Seconds until the access token expires, decoded from its `exp` claim.
    ///
    /// `None` when the access token cannot be decoded or carries no expiry.
    #[must_use]
    pub fn expiry_seconds(&self) -> Option<i64> {
        decode_payload(&self.access_token).as_ref().and_then(expiry_seconds)
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for token inspection.
    use serde_json::json;

    use super::*;

    fn encode_jwt(payload: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        format!("{header}.{body}.sig")
    }

    #[test]
    fn test_decode_round_trip() {
        let payload = json!({"sub": "user-1", "exp": 1_900_000_000_i64});
        let decoded = decode_payload(&encode_jwt(&payload)).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_never_errors_on_malformed_input() {
        // Empty string.
        assert!(decode_payload("").is_none());
        // No separators.
        assert!(decode_payload("nodotshere").is_none());
        // Invalid base64 in the middle segment.
        assert!(decode_payload("a.!!!not-base64!!!.c").is_none());
        // Valid base64, invalid JSON.
        let bad = URL_SAFE_NO_PAD.encode(b"not json");
        assert!(decode_payload(&format!("a.{bad}.c")).is_none());
    }

    #[test]
    fn test_realm_role_membership() {
        let payload = json!({"realm_access": {"roles": ["user", "_tide_dob.selfencrypt"]}});
        assert!(has_realm_role(&payload, "user"));
        assert!(has_realm_role(&payload, "_tide_dob.selfencrypt"));
        assert!(!has_realm_role(&payload, "admin"));
        assert!(!has_realm_role(&json!({}), "user"));
    }

    #[test]
    fn test_client_role_membership() {
        let payload = json!({
            "resource_access": {"app": {"roles": ["editor"]}}
        });
        assert!(has_client_role(&payload, "app", "editor"));
        assert!(!has_client_role(&payload, "app", "viewer"));
        assert!(!has_client_role(&payload, "other", "editor"));
    }

    #[test]
    fn test_expiry_seconds_relative_to_now() {
        let soon = Utc::now().timestamp() + 120;
        let payload = json!({"exp": soon});
        let secs = expiry_seconds(&payload).unwrap();
        assert!((115..=120).contains(&secs));

        assert!(expiry_seconds(&json!({})).is_none());
        assert!(expiry_seconds(&json!({"exp": "soon"})).is_none());
    }

    #[test]
    fn test_stored_tokens_expiry_and_serde() {
        let exp = Utc::now().timestamp() + 300;
        let tokens = StoredTokens {
            access_token: encode_jwt(&json!({"exp": exp})),
            id_token: None,
            refresh_token: Some("refresh".to_string()),
            doken: Some("doken".to_string()),
        };
        let secs = tokens.expiry_seconds().unwrap();
        assert!(secs > 290 && secs <= 300);

        let round: StoredTokens =
            serde_json::from_str(&serde_json::to_string(&tokens).unwrap()).unwrap();
        assert_eq!(round.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(round.doken.as_deref(), Some("doken"));
        // Absent optionals are omitted from the serialized form.
        assert!(!serde_json::to_string(&tokens).unwrap().contains("id_token"));
    }
}
