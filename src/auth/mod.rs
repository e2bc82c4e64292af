//! Session token lifecycle
//!
//! One [`AuthSession`] per user session owns the token store, the
//! single-flight refresher, the proactive scheduler and the request gate.
//! There is no global state; everything is reached through the session.

pub mod refresh_client;
pub mod scheduler;
pub mod single_flight;
pub mod store;
pub mod tokens;

pub use refresh_client::{HttpRefreshClient, RefreshClient};
pub use scheduler::{RefreshScheduler, ScheduledRefresh};
pub use single_flight::{RefreshOutcome, SingleFlightRefresher};
pub use store::{
    AuthResult, Session, SessionObserver, SessionState, SessionView, TokenStore, User,
};
pub use tokens::{AccessToken, RefreshToken, TokenPair};

use anyhow::Context;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::api::client::{ApiRequest, ApiResponse, HttpTransport, Transport};
use crate::api::gate::RequestGate;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, FileStorage, KeyValueStore};
use crate::error::{GateError, LoginError, TokenError};

pub const LOGIN_PATH: &str = "/auth/login";

/// External collaborators a session is built from.
pub struct SessionParts {
    pub storage: Arc<dyn KeyValueStore>,
    pub refresh_client: Arc<dyn RefreshClient>,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
}

pub struct AuthSession {
    store: Arc<TokenStore>,
    refresher: Arc<SingleFlightRefresher>,
    scheduler: Arc<RefreshScheduler>,
    gate: RequestGate,
    follow: JoinHandle<()>,
}

impl AuthSession {
    /// Wire a session. Must be called within a tokio runtime; the scheduler
    /// starts following the store immediately (a restored session is armed).
    pub fn new(parts: SessionParts, config: &Config) -> Self {
        let store = Arc::new(TokenStore::open(parts.storage));
        let refresher = SingleFlightRefresher::new(Arc::clone(&store), parts.refresh_client);
        let scheduler = RefreshScheduler::new(
            Arc::clone(&refresher),
            parts.clock,
            config.scheduler.clone(),
        );
        let follow = scheduler.follow(store.subscribe());
        let gate = RequestGate::new(parts.transport, Arc::clone(&refresher), &config.gate);

        Self {
            store,
            refresher,
            scheduler,
            gate,
            follow,
        }
    }

    /// Session backed by the session file and the real backend.
    pub fn connect(config: &Config) -> anyhow::Result<Self> {
        let storage = FileStorage::open(config.storage_path()?)?;
        let http = reqwest::Client::new();
        let refresh_client = HttpRefreshClient::new(http.clone(), &config.api_base_url)
            .context("Failed to build refresh client")?;
        let transport = HttpTransport::new(http, config.api_base_url.clone());

        Ok(Self::new(
            SessionParts {
                storage: Arc::new(storage),
                refresh_client: Arc::new(refresh_client),
                transport: Arc::new(transport),
                clock: Arc::new(SystemClock),
            },
            config,
        ))
    }

    /// Route a business call through the request gate.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, GateError> {
        self.gate.execute(request).await
    }

    /// Log in with email and password and apply the result.
    pub async fn login(&self, email: &str, password: &str) -> Result<SessionState, LoginError> {
        let request = ApiRequest::post(
            LOGIN_PATH,
            json!({
                "email": email,
                "password": password,
                "deviceId": self.store.device_id(),
            }),
        );

        let response = match self.gate.execute(request).await {
            Ok(response) => response,
            Err(GateError::Unauthorized { response, .. }) => response,
            Err(e) => return Err(e.into()),
        };

        let result: AuthResult = response.json().map_err(|e| LoginError::Decode {
            status: response.status.as_u16(),
            message: e.to_string(),
        })?;
        if !result.success {
            return Err(TokenError::Rejected(
                result.error.unwrap_or_else(|| "login rejected".to_string()),
            )
            .into());
        }

        Ok(self.store.apply_auth_result(&result)?)
    }

    /// Refresh now, joining any refresh already in flight.
    pub async fn refresh(&self) -> RefreshOutcome {
        self.refresher.refresh().await
    }

    /// End the session: clear the store and cancel the timer right away.
    pub fn reset_all(&self) {
        self.store.reset_all();
        self.scheduler.cancel();
    }

    pub fn observe(&self) -> SessionObserver {
        self.store.observe()
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn refresher(&self) -> &Arc<SingleFlightRefresher> {
        &self.refresher
    }

    pub fn scheduler(&self) -> &Arc<RefreshScheduler> {
        &self.scheduler
    }

    pub fn gate(&self) -> &RequestGate {
        &self.gate
    }
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        self.follow.abort();
        self.scheduler.cancel();
    }
}
