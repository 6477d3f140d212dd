//! Unverified JWT claim decoding.
//!
//! Signature checks belong to the service; clients only read `exp`/`iat`
//! to schedule refreshes, and treat undecodable tokens as corrupted.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

impl JwtClaims {
    pub fn expires_unix_ms(&self) -> Option<u64> {
        self.exp.map(|exp| exp.saturating_mul(1_000))
    }

    /// Token lifetime as issued by the server (`exp - iat`), independent of
    /// the local clock.
    pub fn issued_lifetime_ms(&self) -> Option<u64> {
        match (self.iat, self.exp) {
            (Some(iat), Some(exp)) if exp > iat => Some((exp - iat).saturating_mul(1_000)),
            _ => None,
        }
    }
}

pub fn decode_jwt_claims(token: &str) -> Result<JwtClaims, ProtocolError> {
    let mut segments = token.trim().split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(ProtocolError::MalformedToken(
            "token must contain three dot-separated segments".to_string(),
        ));
    };
    let raw = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|error| ProtocolError::MalformedToken(format!("payload is not base64url: {error}")))?;
    let claims = serde_json::from_slice::<JwtClaims>(&raw)
        .map_err(|error| ProtocolError::MalformedToken(format!("payload is not JSON: {error}")))?;
    if claims.exp.is_none() {
        return Err(ProtocolError::MalformedToken(
            "token has no exp claim".to_string(),
        ));
    }
    Ok(claims)
}

/// Builds an unsigned token carrying `claims`, for local fixtures and the
/// identity-service simulator.
pub fn encode_unsigned_jwt(claims: &JwtClaims) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"at+jwt"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap_or_default());
    format!("{header}.{payload}.unsigned")
}
