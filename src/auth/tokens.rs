//! Access and refresh token types

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de;
use serde::Deserialize;
use std::fmt;

use crate::error::TokenError;

/// Accept a JSON string or number (user ids are numeric on some backends).
pub(crate) fn string_or_number<'de, D: de::Deserializer<'de>>(
    d: D,
) -> std::result::Result<String, D::Error> {
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = String;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("string or number")
        }
        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<String, E> {
            Ok(v.to_string())
        }
        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<String, E> {
            Ok(v.to_string())
        }
        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<String, E> {
            Ok(v.to_string())
        }
    }
    d.deserialize_any(Visitor)
}

/// Decoded access-token claims.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Claims {
    #[serde(rename = "sub", deserialize_with = "string_or_number")]
    pub subject: String,
    /// Expiry, Unix seconds
    #[serde(rename = "exp")]
    pub expires_at: i64,
    /// Issue time, Unix seconds
    #[serde(rename = "iat", default)]
    pub issued_at: Option<i64>,
}

/// Short-lived bearer credential. Immutable; replaced wholesale on refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    raw: String,
    claims: Claims,
}

impl AccessToken {
    /// Decode the claims of a JWT-shaped bearer string. The signature is not
    /// verified; that is the server's job.
    pub fn parse(raw: impl Into<String>) -> Result<Self, TokenError> {
        let raw = raw.into();
        let mut parts = raw.split('.');
        let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => return Err(TokenError::Malformed("expected three segments".into())),
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| TokenError::Malformed(format!("payload is not base64url: {}", e)))?;
        let claims: Claims = serde_json::from_slice(&bytes)
            .map_err(|e| TokenError::Malformed(format!("invalid claims: {}", e)))?;

        Ok(Self { raw, claims })
    }

    /// The bearer string as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn subject(&self) -> &str {
        &self.claims.subject
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.claims.expires_at, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.claims
            .issued_at
            .and_then(|iat| DateTime::from_timestamp(iat, 0))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("subject", &self.claims.subject)
            .field("expires_at", &self.claims.expires_at)
            .finish_non_exhaustive()
    }
}

/// Long-lived credential, used only to obtain a new access token.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshToken(String);

impl RefreshToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RefreshToken(<redacted>)")
    }
}

/// Raw token pair returned by the refresh endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenPair(<redacted>)")
    }
}
