use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 12;

/// Claims carried by an auth token. `roles` drive service/method
/// permission checks; `data` is opaque application state returned to
/// handlers, never inspected here.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AuthTokenPayload {
    pub roles: Vec<String>,
    #[serde(default)]
    pub data: Value,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl AuthTokenPayload {
    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at, 0)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|held| held == role)
    }
}

/// `Expired` and `InvalidSignature` are distinct so clients can tell a
/// stale-but-genuine token apart from a forged one.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    Malformed,
    InvalidSignature,
    Expired,
    EmptySecret,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "auth token is malformed"),
            Self::InvalidSignature => write!(f, "auth token signature is invalid"),
            Self::Expired => write!(f, "auth token has expired"),
            Self::EmptySecret => write!(f, "auth secret is empty"),
        }
    }
}

impl std::error::Error for AuthError {}

#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>, ttl_hours: i64) -> Result<Self, AuthError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(AuthError::EmptySecret);
        }
        Ok(Self {
            secret,
            ttl: Duration::hours(ttl_hours),
        })
    }

    pub fn generate(&self, roles: Vec<String>, data: Value) -> String {
        let now = Utc::now();
        let payload = AuthTokenPayload {
            roles,
            data,
            issued_at: now.timestamp(),
            expires_at: (now + self.ttl).timestamp(),
        };
        self.sign(&payload)
    }

    pub fn sign(&self, payload: &AuthTokenPayload) -> String {
        let payload_json =
            serde_json::to_vec(payload).expect("auth payload serialization cannot fail");
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload_json);
        let signature = self.compute_signature(payload_b64.as_bytes());
        format!("{payload_b64}.{}", URL_SAFE_NO_PAD.encode(signature))
    }

    /// Full verification: signature first, then expiry, so a forged token
    /// never reports `Expired`.
    pub fn verify(&self, token: &str) -> Result<AuthTokenPayload, AuthError> {
        let (payload_b64, signature_b64) = token.split_once('.').ok_or(AuthError::Malformed)?;
        if payload_b64.is_empty() || signature_b64.is_empty() || signature_b64.contains('.') {
            return Err(AuthError::Malformed);
        }

        let claimed_signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::Malformed)?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("hmac accepts keys of any length");
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&claimed_signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        let payload = decode_payload(payload_b64)?;
        if payload.expires_at <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        Ok(payload)
    }

    fn compute_signature(&self, bytes: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("hmac accepts keys of any length");
        mac.update(bytes);
        mac.finalize().into_bytes().to_vec()
    }
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Extracts the claims without checking the signature. For diagnostics
/// only; authorization decisions always go through `verify`.
pub fn decode_unverified(token: &str) -> Result<AuthTokenPayload, AuthError> {
    let (payload_b64, _) = token.split_once('.').ok_or(AuthError::Malformed)?;
    decode_payload(payload_b64)
}

fn decode_payload(payload_b64: &str) -> Result<AuthTokenPayload, AuthError> {
    let payload_json = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AuthError::Malformed)?;
    serde_json::from_slice(&payload_json).map_err(|_| AuthError::Malformed)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{decode_unverified, AuthError, AuthTokenPayload, TokenSigner};

    fn signer() -> TokenSigner {
        TokenSigner::new("test-secret", 12).expect("signer should build")
    }

    #[test]
    fn generated_token_verifies_and_carries_roles() {
        let signer = signer();
        let token = signer.generate(
            vec!["admin".to_owned(), "reporting".to_owned()],
            json!({"userId": 42}),
        );

        let payload = signer.verify(&token).expect("fresh token should verify");
        assert!(payload.has_role("admin"));
        assert!(payload.has_role("reporting"));
        assert!(!payload.has_role("billing"));
        assert_eq!(payload.data, json!({"userId": 42}));
    }

    #[test]
    fn expiry_defaults_to_twelve_hours() {
        let signer = signer();
        let token = signer.generate(vec![], serde_json::Value::Null);
        let payload = signer.verify(&token).expect("token should verify");

        let ttl = payload.expires_at - payload.issued_at;
        assert_eq!(ttl, 12 * 3600);
    }

    #[test]
    fn tampered_payload_fails_with_invalid_signature() {
        let signer = signer();
        let token = signer.generate(vec!["user".to_owned()], serde_json::Value::Null);

        let forged_payload = AuthTokenPayload {
            roles: vec!["admin".to_owned()],
            data: serde_json::Value::Null,
            issued_at: Utc::now().timestamp(),
            expires_at: Utc::now().timestamp() + 3600,
        };
        let forged = format!(
            "{}.{}",
            TokenSigner::new("test-secret", 12)
                .expect("signer should build")
                .sign(&forged_payload)
                .split_once('.')
                .expect("token has two parts")
                .0,
            token.split_once('.').expect("token has two parts").1
        );

        assert_eq!(signer.verify(&forged), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn wrong_secret_fails_with_invalid_signature() {
        let token = signer().generate(vec![], serde_json::Value::Null);
        let other = TokenSigner::new("other-secret", 12).expect("signer should build");
        assert_eq!(other.verify(&token), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn expired_token_is_distinct_from_invalid() {
        let signer = signer();
        let stale = AuthTokenPayload {
            roles: vec!["user".to_owned()],
            data: serde_json::Value::Null,
            issued_at: Utc::now().timestamp() - 7200,
            expires_at: Utc::now().timestamp() - 3600,
        };
        let token = signer.sign(&stale);

        assert_eq!(signer.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn garbage_tokens_are_malformed() {
        let signer = signer();
        assert_eq!(signer.verify("no-dot-here"), Err(AuthError::Malformed));
        assert_eq!(signer.verify(".."), Err(AuthError::Malformed));
        assert_eq!(signer.verify("!!!.???"), Err(AuthError::Malformed));
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert_eq!(
            TokenSigner::new("", 12).err(),
            Some(AuthError::EmptySecret)
        );
    }

    #[test]
    fn unverified_decode_reads_claims_without_a_secret() {
        let token = signer().generate(vec!["viewer".to_owned()], serde_json::Value::Null);
        let payload = decode_unverified(&token).expect("claims should decode");
        assert!(payload.has_role("viewer"));
    }
}
