//! Error types shared across the session coordinator

use thiserror::Error;

use crate::api::client::ApiResponse;

/// Outcome of a failed token refresh.
///
/// One refresh outcome is fanned out to every caller that joined it, so the
/// type is `Clone` and carries only owned strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// Refresh attempted with no refresh token present; the session was already anonymous.
    #[error("no refresh token available")]
    NoRefreshToken,

    /// The refresh endpoint could not be reached (or answered with a server-side failure).
    #[error("refresh endpoint unreachable: {0}")]
    Network(String),

    #[error("refresh token rejected: {0}")]
    InvalidRefreshToken(String),

    #[error("refresh token expired: {0}")]
    ExpiredRefreshToken(String),

    /// The endpoint answered successfully but the body was unusable.
    #[error("malformed refresh response: {0}")]
    Protocol(String),

    /// The session was reset while this refresh was in flight.
    #[error("session was reset while the refresh was in flight")]
    SessionReset,
}

impl RefreshError {
    /// Whether the proactive scheduler may try again with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Protocol(_))
    }

    /// Whether this failure definitively ends the session.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            Self::InvalidRefreshToken(_) | Self::ExpiredRefreshToken(_)
        )
    }
}

/// Problems applying an authentication result to the token store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("malformed access token: {0}")]
    Malformed(String),

    #[error("auth result carried an access token without a refresh token")]
    MissingRefreshToken,

    #[error("authentication rejected: {0}")]
    Rejected(String),
}

/// Transport-level failure of an outgoing business call.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("invalid request URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("{method} {url} failed: {message}")]
    Request {
        method: String,
        url: String,
        message: String,
    },
}

/// Failure of a call routed through the request gate.
#[derive(Debug, Error)]
pub enum GateError {
    /// The call was unauthorized. Carries the original response, even when a
    /// refresh was attempted and failed.
    #[error("401 Unauthorized for {path}")]
    Unauthorized { path: String, response: ApiResponse },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure of the email/password login call.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("unreadable login response (HTTP {status}): {message}")]
    Decode { status: u16, message: String },
}
