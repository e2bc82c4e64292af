//! Request gate: token attachment and reactive refresh
//!
//! Every business call goes through [`RequestGate::execute`]. Auth-flow
//! endpoints pass straight through. Everything else gets the current access
//! token attached; an unauthorized answer triggers one shared refresh and
//! exactly one retry.

use std::sync::Arc;

use super::client::{ApiRequest, ApiResponse, Transport};
use crate::auth::single_flight::SingleFlightRefresher;
use crate::auth::store::{SessionState, TokenStore};
use crate::auth::tokens::AccessToken;
use crate::config::GateConfig;
use crate::error::GateError;

pub struct RequestGate {
    transport: Arc<dyn Transport>,
    store: Arc<TokenStore>,
    refresher: Arc<SingleFlightRefresher>,
    excluded_paths: Vec<String>,
}

impl RequestGate {
    pub fn new(
        transport: Arc<dyn Transport>,
        refresher: Arc<SingleFlightRefresher>,
        config: &GateConfig,
    ) -> Self {
        Self {
            transport,
            store: Arc::clone(refresher.store()),
            refresher,
            excluded_paths: config.excluded_paths.clone(),
        }
    }

    /// Whether `path` belongs to the auth flow itself.
    pub fn is_excluded(&self, path: &str) -> bool {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let path = path.trim_end_matches('/');
        self.excluded_paths
            .iter()
            .any(|excluded| path.ends_with(excluded.trim_end_matches('/')))
    }

    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, GateError> {
        if self.is_excluded(&request.path) {
            tracing::debug!("{} is an auth endpoint, sending without token", request.path);
            let response = self.transport.send(&request).await?;
            return self.check(&request, response);
        }

        let sent = self.current_token().await;
        let response = self.transport.send(&attach(&request, sent.as_ref())).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        let fresh = match self.store.access_token() {
            // Someone else already refreshed while this call was out.
            Some(current) if sent.as_ref().is_some_and(|s| s != &current) => {
                tracing::debug!("{} unauthorized with a superseded token", request.path);
                current
            }
            _ => {
                tracing::debug!("{} unauthorized, refreshing", request.path);
                match self.refresher.refresh().await {
                    Ok(token) => token,
                    Err(e) => {
                        tracing::info!("Refresh after 401 on {} failed: {}", request.path, e);
                        return Err(unauthorized(&request, response));
                    }
                }
            }
        };

        // Exactly one retry; a second 401 is final.
        let retried = self.transport.send(&request.with_bearer(fresh.as_str())).await?;
        self.check(&request, retried)
    }

    /// The access token to attach, waiting out an in-flight refresh first.
    async fn current_token(&self) -> Option<AccessToken> {
        if self.store.state() == SessionState::Refreshing {
            if let Some(pending) = self.refresher.in_flight() {
                tracing::debug!("Waiting for in-flight refresh before sending");
                let _ = pending.await;
            }
        }
        self.store.access_token()
    }

    fn check(&self, request: &ApiRequest, response: ApiResponse) -> Result<ApiResponse, GateError> {
        if response.is_unauthorized() {
            Err(unauthorized(request, response))
        } else {
            Ok(response)
        }
    }
}

fn attach(request: &ApiRequest, token: Option<&AccessToken>) -> ApiRequest {
    match token {
        Some(token) => request.with_bearer(token.as_str()),
        None => request.clone(),
    }
}

fn unauthorized(request: &ApiRequest, response: ApiResponse) -> GateError {
    GateError::Unauthorized {
        path: request.path.clone(),
        response,
    }
}
