use crate::config::ApiKeyConfig;
use base64::Engine;
use http::HeaderMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Result of a successful key verification. The authorized set is the only
/// source of routing authority — an upstream outside it is invisible to the
/// key.
#[derive(Debug, Clone)]
pub struct VerifiedKey {
    pub key_id: String,
    pub key_prefix: String,
    pub authorized_upstream_ids: Vec<String>,
}

/// All variants map to 401; the distinction is for logs only, never leaked
/// to the client beyond the generic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("missing credentials")]
    Missing,
    #[error("malformed credentials")]
    Malformed,
    #[error("unknown api key")]
    Unknown,
    #[error("api key expired")]
    Expired,
    #[error("api key inactive")]
    Inactive,
}

/// Pull the gateway key out of the inbound request. `Authorization: Bearer`
/// is canonical; `x-api-key` and `x-goog-api-key` are accepted so native
/// Anthropic / Gemini SDKs work unmodified.
pub fn extract_token(headers: &HeaderMap) -> Result<String, AuthFailure> {
    if let Some(auth) = headers.get(http::header::AUTHORIZATION) {
        let auth = auth.to_str().map_err(|_| AuthFailure::Malformed)?;
        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .ok_or(AuthFailure::Malformed)?
            .trim();
        if token.is_empty() {
            return Err(AuthFailure::Malformed);
        }
        return Ok(token.to_string());
    }

    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(v) = headers.get(name) {
            let token = v.to_str().map_err(|_| AuthFailure::Malformed)?.trim();
            if token.is_empty() {
                return Err(AuthFailure::Malformed);
            }
            return Ok(token.to_string());
        }
    }

    Err(AuthFailure::Missing)
}

/// sha256 hex of the full secret — the stored form of every key.
pub fn hash_secret(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(64);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Verify an inbound token against the key set.
///
/// The lookup is by hash; the stored hash is then re-compared in constant
/// time so a lookup-table implementation cannot short-circuit on prefix
/// bytes.
pub fn verify_token<F>(headers: &HeaderMap, lookup: F) -> Result<VerifiedKey, AuthFailure>
where
    F: Fn(&str) -> Option<Arc<ApiKeyConfig>>,
{
    let token = extract_token(headers)?;
    let hash = hash_secret(&token);

    let key = lookup(&hash).ok_or(AuthFailure::Unknown)?;

    let matches: bool = key.key_hash.as_bytes().ct_eq(hash.as_bytes()).into();
    if !matches {
        return Err(AuthFailure::Unknown);
    }
    if !key.is_active {
        return Err(AuthFailure::Inactive);
    }
    if let Some(expires_at) = key.expires_at {
        if time::OffsetDateTime::now_utc() >= expires_at {
            return Err(AuthFailure::Expired);
        }
    }

    Ok(VerifiedKey {
        key_id: key.id.clone(),
        key_prefix: key.key_prefix.clone(),
        authorized_upstream_ids: key.upstream_ids.clone(),
    })
}

/// Decrypts stored upstream credentials. Encryption-at-rest is owned by the
/// admin plane; this is the consuming side of that contract. Ciphertexts
/// carry an `enc:` prefix (base64 payload); anything else is taken as
/// plaintext, which keeps local control files ergonomic.
pub struct CredentialVault;

impl CredentialVault {
    pub fn decrypt(ciphertext: &str) -> Result<String, crate::error::GatewayError> {
        match ciphertext.strip_prefix("enc:") {
            Some(encoded) => {
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| {
                        crate::error::GatewayError::Internal(format!(
                            "credential decode failed: {e}"
                        ))
                    })?;
                String::from_utf8(raw).map_err(|_| {
                    crate::error::GatewayError::Internal(
                        "credential is not valid utf-8".to_string(),
                    )
                })
            }
            None => Ok(ciphertext.to_string()),
        }
    }
}
