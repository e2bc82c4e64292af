//! Session Keeper - session token lifecycle coordinator
//!
//! Holds the current access/refresh token pair, renews it before expiry, and
//! guarantees that concurrent callers discovering an expired token trigger
//! exactly one refresh between them.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;

#[cfg(test)]
mod test_support;

pub use api::{ApiRequest, ApiResponse, RequestGate};
pub use auth::{AuthSession, SessionParts, SessionState};
pub use config::Config;
pub use error::{GateError, LoginError, RefreshError, TokenError, TransportError};
