//! Refresh token exchange
//!
//! `POST /auth/refresh` with `{refreshToken, deviceId}` yields a new token
//! pair. Failures are classified here so the coordinator above never sees
//! HTTP status codes.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use super::tokens::{RefreshToken, TokenPair};
use crate::error::RefreshError;

pub const REFRESH_PATH: &str = "/auth/refresh";

/// Exchanges a refresh token for a new token pair.
#[async_trait]
pub trait RefreshClient: Send + Sync {
    async fn exchange(
        &self,
        refresh_token: &RefreshToken,
        device_id: &str,
    ) -> Result<TokenPair, RefreshError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
    device_id: &'a str,
}

/// Body of the refresh endpoint, success or failure.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    /// Absent on some deployments; a complete pair then counts as success.
    #[serde(default)]
    success: Option<bool>,
    #[serde(default, alias = "token")]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default, alias = "message")]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
}

/// reqwest-backed [`RefreshClient`].
pub struct HttpRefreshClient {
    http: reqwest::Client,
    url: Url,
}

impl HttpRefreshClient {
    pub fn new(http: reqwest::Client, api_base_url: &str) -> Result<Self, RefreshError> {
        let url = join_path(api_base_url, REFRESH_PATH)
            .map_err(|e| RefreshError::Protocol(format!("invalid API base URL: {}", e)))?;
        Ok(Self { http, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl RefreshClient for HttpRefreshClient {
    async fn exchange(
        &self,
        refresh_token: &RefreshToken,
        device_id: &str,
    ) -> Result<TokenPair, RefreshError> {
        tracing::debug!("Exchanging refresh token at {}", self.url);

        let resp = self
            .http
            .post(self.url.clone())
            .json(&RefreshRequest {
                refresh_token: refresh_token.expose(),
                device_id,
            })
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        classify(status, &body)
    }
}

/// Map an HTTP status and body to a token pair or a classified failure.
pub(crate) fn classify(status: StatusCode, body: &str) -> Result<TokenPair, RefreshError> {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(RefreshError::Network(format!(
            "HTTP {}: {}",
            status.as_u16(),
            truncate(body)
        )));
    }

    let parsed: Option<RefreshResponse> = serde_json::from_str(body).ok();

    if status.is_success() {
        let resp = parsed.ok_or_else(|| {
            RefreshError::Protocol(format!("unparseable body: {}", truncate(body)))
        })?;
        return match (resp.success, resp.access_token, resp.refresh_token) {
            (Some(false), _, _) => Err(rejection(resp.error_code, resp.error)),
            (_, Some(access_token), Some(refresh_token)) => Ok(TokenPair {
                access_token,
                refresh_token,
            }),
            (None, _, _) if resp.error_code.is_some() => {
                Err(rejection(resp.error_code, resp.error))
            }
            _ => Err(RefreshError::Protocol(
                "success response without a token pair".into(),
            )),
        };
    }

    match parsed {
        Some(resp) => Err(rejection(resp.error_code, resp.error)),
        None if status.is_client_error() => Err(RefreshError::InvalidRefreshToken(format!(
            "HTTP {}",
            status.as_u16()
        ))),
        None => Err(RefreshError::Protocol(format!(
            "unexpected HTTP {}",
            status.as_u16()
        ))),
    }
}

/// Every explicit rejection ends the session; `TOKEN_EXPIRED` is told apart.
fn rejection(code: Option<String>, message: Option<String>) -> RefreshError {
    let detail = match (&code, message) {
        (Some(code), Some(msg)) => format!("{}: {}", code, msg),
        (Some(code), None) => code.clone(),
        (None, Some(msg)) => msg,
        (None, None) => "refresh rejected".to_string(),
    };
    match code.as_deref() {
        Some("TOKEN_EXPIRED") => RefreshError::ExpiredRefreshToken(detail),
        _ => RefreshError::InvalidRefreshToken(detail),
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Append `path` to the base URL's path (unlike `Url::join`, keeps `/api`).
pub(crate) fn join_path(base: &str, path: &str) -> Result<Url, url::ParseError> {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    Url::parse(&format!("{}/{}", base, path))
}
