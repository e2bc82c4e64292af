//! Fakes shared by unit tests

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::StatusCode;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::client::{ApiRequest, ApiResponse, Transport};
use crate::auth::refresh_client::RefreshClient;
use crate::auth::tokens::{RefreshToken, TokenPair};
use crate::error::{RefreshError, TransportError};

/// Build an unsigned JWT-shaped token with the given claims.
pub fn mint_token(sub: &str, iat: i64, exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = serde_json::json!({ "sub": sub, "iat": iat, "exp": exp });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, payload)
}

/// A token expiring `ttl_secs` from the real current time.
pub fn future_token(sub: &str, ttl_secs: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    mint_token(sub, now, now + ttl_secs)
}

enum Script {
    /// Pop scripted results in order; the last one repeats.
    Queue(Mutex<VecDeque<Result<TokenPair, RefreshError>>>),
    /// Mint a new pair on every call, expiring `ttl_secs` after `base`.
    Mint { sub: String, base: i64, ttl_secs: i64 },
}

/// Scripted [`RefreshClient`] that counts and records its calls.
pub struct ScriptedRefreshClient {
    script: Script,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<Vec<(String, String)>>,
}

impl ScriptedRefreshClient {
    pub fn new(results: Vec<Result<TokenPair, RefreshError>>) -> Arc<Self> {
        Arc::new(Self::with_script(Script::Queue(Mutex::new(results.into()))))
    }

    /// Succeeds every time with pair `n` = (`access` issued at n, `rt-n`).
    pub fn succeeding(sub: &str) -> Arc<Self> {
        Self::minting(sub, chrono::Utc::now().timestamp(), 900)
    }

    pub fn minting(sub: &str, base: i64, ttl_secs: i64) -> Arc<Self> {
        Arc::new(Self::with_script(Script::Mint {
            sub: sub.to_string(),
            base,
            ttl_secs,
        }))
    }

    pub fn failing(error: RefreshError) -> Arc<Self> {
        Self::new(vec![Err(error)])
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        let mut this = Arc::try_unwrap(self).unwrap_or_else(|_| panic!("client already shared"));
        this.delay = delay;
        Arc::new(this)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most exchanges ever running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<(String, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl RefreshClient for ScriptedRefreshClient {
    async fn exchange(
        &self,
        refresh_token: &RefreshToken,
        device_id: &str,
    ) -> Result<TokenPair, RefreshError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((refresh_token.expose().to_string(), device_id.to_string()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = match &self.script {
            Script::Queue(queue) => {
                let mut queue = queue.lock().unwrap();
                if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue.front().cloned().unwrap()
                }
            }
            Script::Mint {
                sub,
                base,
                ttl_secs,
            } => {
                let iat = base + n as i64;
                Ok(TokenPair {
                    access_token: mint_token(sub, iat, base + ttl_secs + n as i64),
                    refresh_token: format!("rt-{}", n),
                })
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Fake backend: answers 200 when the bearer is in the accepted set, 401 otherwise.
pub struct FakeBackend {
    accepted: Mutex<HashSet<String>>,
    delay: Duration,
    requests: Mutex<Vec<ApiRequest>>,
    fail_transport: bool,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            accepted: Mutex::new(HashSet::new()),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            fail_transport: false,
        })
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            accepted: Mutex::new(HashSet::new()),
            delay,
            requests: Mutex::new(Vec::new()),
            fail_transport: false,
        })
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            accepted: Mutex::new(HashSet::new()),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            fail_transport: true,
        })
    }

    pub fn accept(&self, token: &str) {
        self.accepted.lock().unwrap().insert(token.to_string());
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn bearers(&self) -> Vec<Option<String>> {
        self.requests()
            .iter()
            .map(|r| r.bearer().map(String::from))
            .collect()
    }
}

#[async_trait]
impl Transport for FakeBackend {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail_transport {
            return Err(TransportError::Request {
                method: request.method.to_string(),
                url: request.path.clone(),
                message: "connection refused".into(),
            });
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let authorized = request
            .bearer()
            .map(|token| self.accepted.lock().unwrap().contains(token))
            .unwrap_or(false);
        let status = if authorized || request.path.starts_with("/public") {
            StatusCode::OK
        } else {
            StatusCode::UNAUTHORIZED
        };
        Ok(ApiResponse::new(status, format!("{{\"path\":\"{}\"}}", request.path)))
    }
}
