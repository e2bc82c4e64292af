//! Single-flight token refresh
//!
//! Collapses any number of concurrent refresh requests into one call to the
//! [`RefreshClient`] and fans the outcome out to every caller that joined.
//!
//! The exchange runs on its own task so that callers giving up (dropping
//! their future) never cancels a request already on the wire. Waiters hold a
//! [`Shared`] handle that settles on whichever comes first: the task's
//! outcome, or the session moving to a new epoch (`reset_all`).
//!
//! Settlement happens under the slot lock: the slot is cleared and the
//! outcome sent in one critical section, so a later `refresh()` either joins
//! the settled outcome or starts a fresh attempt, never neither.
//!
//! An attempt superseded by a new epoch is never joined, but its exchange
//! may still be on the wire. The next attempt waits for it to land before
//! calling the endpoint, so at most one exchange is ever in flight.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

use super::refresh_client::RefreshClient;
use super::store::{RefreshCredentials, TokenStore};
use super::tokens::{AccessToken, TokenPair};
use crate::error::RefreshError;

pub type RefreshOutcome = Result<AccessToken, RefreshError>;

/// Handle on an in-flight refresh; cloneable, every clone sees the same outcome.
pub type PendingRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Resolves once an attempt's exchange has returned and been settled.
type Landed = Shared<BoxFuture<'static, ()>>;

struct InFlight {
    attempt: u64,
    epoch: u64,
    outcome: PendingRefresh,
    landed: Landed,
}

pub struct SingleFlightRefresher {
    store: Arc<TokenStore>,
    client: Arc<dyn RefreshClient>,
    slot: Mutex<Option<InFlight>>,
    attempts: AtomicU64,
    exchanges: AtomicUsize,
}

impl SingleFlightRefresher {
    pub fn new(store: Arc<TokenStore>, client: Arc<dyn RefreshClient>) -> Arc<Self> {
        Arc::new(Self {
            store,
            client,
            slot: Mutex::new(None),
            attempts: AtomicU64::new(0),
            exchanges: AtomicUsize::new(0),
        })
    }

    /// Obtain a fresh access token, joining the in-flight refresh if there is one.
    ///
    /// Never fails synchronously; every outcome arrives through the shared
    /// future. Must be called within a tokio runtime.
    pub async fn refresh(self: &Arc<Self>) -> RefreshOutcome {
        match self.join_or_start() {
            Ok(pending) => pending.await,
            Err(e) => Err(e),
        }
    }

    /// The refresh currently in flight for the live session, if any.
    pub fn in_flight(&self) -> Option<PendingRefresh> {
        let epoch = self.store.epoch();
        self.lock()
            .as_ref()
            .filter(|current| current.epoch == epoch)
            .map(|current| current.outcome.clone())
    }

    /// Number of refresh attempts started so far.
    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    fn join_or_start(self: &Arc<Self>) -> Result<PendingRefresh, RefreshError> {
        let mut slot = self.lock();

        let epoch = self.store.epoch();
        let previous = match slot.as_ref() {
            Some(current) if current.epoch == epoch => {
                tracing::debug!(attempt = current.attempt, "Joining in-flight refresh");
                return Ok(current.outcome.clone());
            }
            // From an older epoch; its result will be discarded.
            Some(current) => {
                tracing::debug!(
                    attempt = current.attempt,
                    "Superseding refresh from a replaced session"
                );
                Some(current.landed.clone())
            }
            None => None,
        };

        let Some(credentials) = self.store.refresh_credentials() else {
            tracing::debug!("Refresh requested without a refresh token");
            return Err(RefreshError::NoRefreshToken);
        };

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        let reset = self.store.reset_signal(credentials.epoch);
        let outcome = async move {
            tokio::select! {
                biased;
                settled = rx => settled.unwrap_or_else(|_| {
                    Err(RefreshError::Network("refresh attempt abandoned".into()))
                }),
                _ = reset => Err(RefreshError::SessionReset),
            }
        }
        .boxed()
        .shared();
        let (landed_tx, landed_rx) = oneshot::channel::<()>();
        let landed = landed_rx.map(|_| ()).boxed().shared();

        *slot = Some(InFlight {
            attempt,
            epoch: credentials.epoch,
            outcome: outcome.clone(),
            landed,
        });
        self.store.begin_refresh(credentials.epoch);
        self.exchanges.fetch_add(1, Ordering::SeqCst);

        tracing::info!(attempt, "Starting token refresh");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(attempt, credentials, previous, tx).await;
            drop(landed_tx);
        });

        Ok(outcome)
    }

    async fn run(
        self: Arc<Self>,
        attempt: u64,
        credentials: RefreshCredentials,
        previous: Option<Landed>,
        tx: oneshot::Sender<RefreshOutcome>,
    ) {
        if let Some(previous) = previous {
            tracing::debug!(attempt, "Waiting for superseded exchange to land");
            previous.await;
        }

        let result = if self.store.epoch() == credentials.epoch {
            self.client
                .exchange(&credentials.refresh_token, &credentials.device_id)
                .await
        } else {
            Err(RefreshError::SessionReset)
        };

        let mut slot = self.lock();
        let (outcome, publish_reset) = self.settle(credentials.epoch, result);

        if slot.as_ref().is_some_and(|current| current.attempt == attempt) {
            *slot = None;
        }
        // Receivers may be gone (everyone gave up, or the session was reset).
        let _ = tx.send(outcome);
        drop(slot);

        // Published only after the outcome is sent, so joined waiters observe
        // the refresh error rather than a generic reset.
        if publish_reset {
            self.store.publish();
        }
    }

    /// Write the exchange result into the store. Returns the outcome for
    /// waiters and whether a session reset still needs publishing.
    fn settle(
        &self,
        epoch: u64,
        result: Result<TokenPair, RefreshError>,
    ) -> (RefreshOutcome, bool) {
        match result {
            Ok(pair) => {
                let outcome = self.store.apply_refreshed(epoch, pair);
                if let Ok(token) = &outcome {
                    tracing::info!(expires_at = %token.expires_at(), "Token refresh succeeded");
                }
                (outcome, false)
            }
            Err(RefreshError::SessionReset) => {
                tracing::debug!("Refresh superseded before its exchange started");
                (Err(RefreshError::SessionReset), false)
            }
            Err(e) if e.ends_session() => {
                tracing::warn!("Token refresh rejected, ending session: {}", e);
                let cleared = self.store.clear_unpublished(epoch);
                (Err(e), cleared)
            }
            Err(e) => {
                tracing::warn!("Token refresh failed: {}", e);
                self.store.end_refresh(epoch);
                (Err(e), false)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}
