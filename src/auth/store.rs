//! Session token store
//!
//! Sole owner of the [`Session`]. Reads are synchronous snapshots; every
//! mutation is written through to persistent storage and published on a
//! `watch` channel that the refresh scheduler and session observers follow.
//!
//! Each `reset_all` starts a new session *epoch*, and so does replacing the
//! pair while a refresh is in flight. Work started against an older epoch
//! (an in-flight refresh) must not write its result back.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};

use super::tokens::{string_or_number, AccessToken, RefreshToken, TokenPair};
use crate::config::KeyValueStore;
use crate::error::{RefreshError, TokenError};

const KEY_ACCESS_TOKEN: &str = "accessToken";
const KEY_REFRESH_TOKEN: &str = "refreshToken";
const KEY_USER: &str = "user";
const KEY_DEVICE_ID: &str = "deviceId";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated,
    TwoFaPending,
    /// Authenticated with a refresh in flight. Not user-visible.
    Refreshing,
}

impl SessionState {
    /// Whether the state carries a token pair.
    pub fn has_tokens(self) -> bool {
        matches!(self, Self::Authenticated | Self::Refreshing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Result of an authentication call, as returned by the backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    pub success: bool,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default, alias = "accessToken")]
    pub token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "requiresTwoFA", alias = "requires2FA")]
    pub two_fa_pending: bool,
    #[serde(default, alias = "message")]
    pub error: Option<String>,
}

impl AuthResult {
    pub fn tokens(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            success: true,
            token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    pub fn two_fa_pending() -> Self {
        Self {
            success: true,
            two_fa_pending: true,
            ..Default::default()
        }
    }
}

/// The session aggregate. Only [`TokenStore`] holds it mutably.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub state: SessionState,
    pub access_token: Option<AccessToken>,
    pub refresh_token: Option<RefreshToken>,
    pub user: Option<User>,
    pub device_id: String,
}

impl Session {
    fn anonymous(device_id: String) -> Self {
        Self {
            state: SessionState::Anonymous,
            access_token: None,
            refresh_token: None,
            user: None,
            device_id,
        }
    }

    fn is_cleared(&self) -> bool {
        self.state == SessionState::Anonymous
            && self.access_token.is_none()
            && self.refresh_token.is_none()
            && self.user.is_none()
    }
}

/// What gets published on every change. Carries no refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub epoch: u64,
    pub state: SessionState,
    pub access_token: Option<AccessToken>,
    pub user: Option<User>,
}

/// Read model for UI/consumer code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub is_authenticated: bool,
    pub user: Option<User>,
    pub requires_two_fa: bool,
}

impl From<&SessionSnapshot> for SessionView {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            is_authenticated: snapshot.state.has_tokens(),
            user: snapshot.user.clone(),
            requires_two_fa: snapshot.state == SessionState::TwoFaPending,
        }
    }
}

/// Subscription to session changes.
#[derive(Debug, Clone)]
pub struct SessionObserver {
    rx: watch::Receiver<SessionSnapshot>,
}

impl SessionObserver {
    pub fn current(&self) -> SessionView {
        SessionView::from(&*self.rx.borrow())
    }

    /// Wait for the next change. `None` once the store is gone.
    pub async fn changed(&mut self) -> Option<SessionView> {
        self.rx.changed().await.ok()?;
        Some(SessionView::from(&*self.rx.borrow_and_update()))
    }

    /// The current view followed by every change, with consecutive duplicates
    /// (e.g. `Authenticated` -> `Refreshing`) collapsed.
    pub fn into_stream(self) -> impl Stream<Item = SessionView> + Send + 'static {
        let mut last: Option<SessionView> = None;
        WatchStream::new(self.rx)
            .map(|snapshot| SessionView::from(&snapshot))
            .filter(move |view| {
                if last.as_ref() == Some(view) {
                    return false;
                }
                last = Some(view.clone());
                true
            })
    }
}

/// Credentials handed to a refresh attempt.
#[derive(Debug, Clone)]
pub(crate) struct RefreshCredentials {
    pub refresh_token: RefreshToken,
    pub device_id: String,
    pub epoch: u64,
}

struct Inner {
    session: Session,
    epoch: u64,
}

pub struct TokenStore {
    inner: RwLock<Inner>,
    storage: Arc<dyn KeyValueStore>,
    changes: watch::Sender<SessionSnapshot>,
}

impl TokenStore {
    /// Restore the session from `storage`. Storage is read only here.
    pub fn open(storage: Arc<dyn KeyValueStore>) -> Self {
        let device_id = match storage.get(KEY_DEVICE_ID) {
            Some(id) if !id.is_empty() => id,
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                if let Err(e) = storage.set(KEY_DEVICE_ID, &id) {
                    tracing::warn!("Failed to persist device id: {:#}", e);
                }
                id
            }
        };

        let session = restore(storage.as_ref(), device_id);
        tracing::debug!(state = ?session.state, "Session restored");

        let inner = Inner { session, epoch: 0 };
        let (changes, _) = watch::channel(snapshot_of(&inner));
        Self {
            inner: RwLock::new(inner),
            storage,
            changes,
        }
    }

    /// Apply the result of a login, 2FA or refresh call.
    pub fn apply_auth_result(&self, result: &AuthResult) -> Result<SessionState, TokenError> {
        let mut inner = self.write();
        let was_refreshing = inner.session.state == SessionState::Refreshing;
        let state = self.apply_locked(&mut inner, result)?;
        if was_refreshing && state != SessionState::Refreshing {
            // The refresh in flight belongs to the replaced pair.
            inner.epoch += 1;
            tracing::debug!(epoch = inner.epoch, "In-flight refresh superseded");
        }
        self.publish_locked(&inner);
        Ok(state)
    }

    /// Clear everything and return to `Anonymous`. Starts a new epoch, which
    /// rejects any waiters on an in-flight refresh. Safe from any state.
    pub fn reset_all(&self) {
        let mut inner = self.write();
        if self.clear_locked(&mut inner) {
            self.publish_locked(&inner);
        }
    }

    pub fn access_token(&self) -> Option<AccessToken> {
        self.read().session.access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<RefreshToken> {
        self.read().session.refresh_token.clone()
    }

    pub fn current_user(&self) -> Option<User> {
        self.read().session.user.clone()
    }

    pub fn state(&self) -> SessionState {
        self.read().session.state
    }

    pub fn device_id(&self) -> String {
        self.read().session.device_id.clone()
    }

    pub fn session(&self) -> Session {
        self.read().session.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        snapshot_of(&self.read())
    }

    pub fn epoch(&self) -> u64 {
        self.read().epoch
    }

    /// Raw change notifications.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.changes.subscribe()
    }

    pub fn observe(&self) -> SessionObserver {
        SessionObserver {
            rx: self.changes.subscribe(),
        }
    }

    /// Resolves once the session has moved past `epoch` (or the store is gone).
    pub(crate) fn reset_signal(
        &self,
        epoch: u64,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.changes.subscribe();
        async move {
            loop {
                let current = rx.borrow_and_update().epoch;
                if current != epoch {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    pub(crate) fn refresh_credentials(&self) -> Option<RefreshCredentials> {
        let inner = self.read();
        let refresh_token = inner.session.refresh_token.clone()?;
        Some(RefreshCredentials {
            refresh_token,
            device_id: inner.session.device_id.clone(),
            epoch: inner.epoch,
        })
    }

    /// Mark a refresh as started for `epoch`.
    pub(crate) fn begin_refresh(&self, epoch: u64) {
        let mut inner = self.write();
        if inner.epoch == epoch && inner.session.state == SessionState::Authenticated {
            inner.session.state = SessionState::Refreshing;
            self.publish_locked(&inner);
        }
    }

    /// Settle a refresh started for `epoch` that failed without ending the session.
    pub(crate) fn end_refresh(&self, epoch: u64) {
        let mut inner = self.write();
        if inner.epoch == epoch && inner.session.state == SessionState::Refreshing {
            inner.session.state = SessionState::Authenticated;
            self.publish_locked(&inner);
        }
    }

    /// Write a refreshed pair, unless the session moved on since `epoch`.
    pub(crate) fn apply_refreshed(
        &self,
        epoch: u64,
        pair: TokenPair,
    ) -> Result<AccessToken, RefreshError> {
        let mut inner = self.write();
        if inner.epoch != epoch || !inner.session.state.has_tokens() {
            tracing::info!("Discarding refresh result from a reset session");
            return Err(RefreshError::SessionReset);
        }

        let result = AuthResult::tokens(pair.access_token, pair.refresh_token);
        if let Err(e) = self.apply_locked(&mut inner, &result) {
            if inner.session.state == SessionState::Refreshing {
                inner.session.state = SessionState::Authenticated;
                self.publish_locked(&inner);
            }
            return Err(RefreshError::Protocol(e.to_string()));
        }
        self.publish_locked(&inner);

        inner
            .session
            .access_token
            .clone()
            .ok_or_else(|| RefreshError::Protocol("no access token after apply".into()))
    }

    /// Clear the session if it is still at `epoch`, WITHOUT publishing.
    /// Returns whether anything was cleared; the caller must `publish()` after.
    pub(crate) fn clear_unpublished(&self, epoch: u64) -> bool {
        let mut inner = self.write();
        inner.epoch == epoch && self.clear_locked(&mut inner)
    }

    pub(crate) fn publish(&self) {
        let inner = self.read();
        self.publish_locked(&inner);
    }

    fn apply_locked(
        &self,
        inner: &mut Inner,
        result: &AuthResult,
    ) -> Result<SessionState, TokenError> {
        if !result.success {
            return Err(TokenError::Rejected(
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| "unsuccessful auth result".to_string()),
            ));
        }

        let session = &mut inner.session;

        if result.two_fa_pending {
            session.state = SessionState::TwoFaPending;
            session.access_token = None;
            session.refresh_token = None;
            if result.user.is_some() {
                session.user = result.user.clone();
            }
            self.persist_tokens(None, None);
            self.persist_user(session.user.as_ref());
            tracing::info!("Second factor required");
            return Ok(session.state);
        }

        let Some(raw) = result.token.as_deref() else {
            // Nothing token-bearing to apply (e.g. registration without auto-login).
            return Ok(session.state);
        };

        let access = AccessToken::parse(raw)?;
        let refresh = result
            .refresh_token
            .as_deref()
            .map(RefreshToken::new)
            .ok_or(TokenError::MissingRefreshToken)?;

        let was = session.state;
        session.state = SessionState::Authenticated;
        session.access_token = Some(access);
        session.refresh_token = Some(refresh);
        if result.user.is_some() {
            session.user = result.user.clone();
        }

        self.persist_tokens(session.access_token.as_ref(), session.refresh_token.as_ref());
        self.persist_user(session.user.as_ref());

        if was != SessionState::Authenticated && was != SessionState::Refreshing {
            tracing::info!(from = ?was, "Session authenticated");
        }
        Ok(session.state)
    }

    fn clear_locked(&self, inner: &mut Inner) -> bool {
        if inner.session.is_cleared() {
            return false;
        }

        let device_id = std::mem::take(&mut inner.session.device_id);
        inner.session = Session::anonymous(device_id);
        inner.epoch += 1;

        self.persist_tokens(None, None);
        self.persist_user(None);
        tracing::info!(epoch = inner.epoch, "Session reset");
        true
    }

    fn persist_tokens(&self, access: Option<&AccessToken>, refresh: Option<&RefreshToken>) {
        // The pair is written as one batch so storage never holds a mixed pair.
        let outcome = match (access, refresh) {
            (Some(a), Some(r)) => self.storage.set_many(&[
                (KEY_ACCESS_TOKEN, a.as_str()),
                (KEY_REFRESH_TOKEN, r.expose()),
            ]),
            _ => self
                .storage
                .remove_many(&[KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN]),
        };
        if let Err(e) = outcome {
            tracing::warn!("Failed to persist tokens: {:#}", e);
        }
    }

    fn persist_user(&self, user: Option<&User>) {
        let outcome = match user {
            Some(user) => serde_json::to_string(user)
                .map_err(anyhow::Error::from)
                .and_then(|json| self.storage.set(KEY_USER, &json)),
            None => self.storage.remove(KEY_USER),
        };
        if let Err(e) = outcome {
            tracing::warn!("Failed to persist user: {:#}", e);
        }
    }

    fn publish_locked(&self, inner: &Inner) {
        self.changes.send_replace(snapshot_of(inner));
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn snapshot_of(inner: &Inner) -> SessionSnapshot {
    SessionSnapshot {
        epoch: inner.epoch,
        state: inner.session.state,
        access_token: inner.session.access_token.clone(),
        user: inner.session.user.clone(),
    }
}

/// Rebuild the session from storage. A half-present or undecodable pair is
/// discarded so the store never starts mixed.
fn restore(storage: &dyn KeyValueStore, device_id: String) -> Session {
    let mut session = Session::anonymous(device_id);

    let access = storage.get(KEY_ACCESS_TOKEN);
    let refresh = storage.get(KEY_REFRESH_TOKEN);
    match (access, refresh) {
        (Some(access), Some(refresh)) => match AccessToken::parse(access) {
            Ok(access) => {
                session.state = SessionState::Authenticated;
                session.access_token = Some(access);
                session.refresh_token = Some(RefreshToken::new(refresh));
                session.user = storage
                    .get(KEY_USER)
                    .and_then(|json| serde_json::from_str(&json).ok());
            }
            Err(e) => {
                tracing::warn!("Discarding stored session: {}", e);
                discard(storage);
            }
        },
        (None, None) => {}
        _ => {
            tracing::warn!("Discarding stored session with a half-present token pair");
            discard(storage);
        }
    }

    session
}

fn discard(storage: &dyn KeyValueStore) {
    if let Err(e) = storage.remove_many(&[KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN, KEY_USER]) {
        tracing::warn!("Failed to discard stored session: {:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStorage;
    use crate::test_support::{future_token, mint_token};

    fn user() -> User {
        User {
            id: "7".into(),
            email: Some("dr.who@example.org".into()),
            first_name: Some("Ada".into()),
            last_name: None,
            role: Some("doctor".into()),
        }
    }

    fn store_with(storage: Arc<MemoryStorage>) -> TokenStore {
        TokenStore::open(storage)
    }

    #[test]
    fn test_fresh_store_is_anonymous() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        assert_eq!(store.state(), SessionState::Anonymous);
        assert!(store.access_token().is_none());
        assert!(store.refresh_token().is_none());
        assert!(store.current_user().is_none());
        assert!(!store.device_id().is_empty());
    }

    #[test]
    fn test_two_fa_pending_stores_no_tokens() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let state = store
            .apply_auth_result(&AuthResult::two_fa_pending())
            .unwrap();

        assert_eq!(state, SessionState::TwoFaPending);
        assert_eq!(store.state(), SessionState::TwoFaPending);
        assert!(store.access_token().is_none());
        assert!(store.refresh_token().is_none());
        assert!(store.observe().current().requires_two_fa);
    }

    #[test]
    fn test_token_result_authenticates_and_persists() {
        let storage = Arc::new(MemoryStorage::new());
        let store = store_with(storage.clone());
        let access = future_token("7", 900);

        let result = AuthResult::tokens(access.clone(), "rt-1").with_user(user());
        assert_eq!(
            store.apply_auth_result(&result).unwrap(),
            SessionState::Authenticated
        );

        assert_eq!(store.access_token().unwrap().as_str(), access);
        assert_eq!(store.refresh_token().unwrap().expose(), "rt-1");
        assert_eq!(store.current_user(), Some(user()));
        assert_eq!(storage.get(KEY_ACCESS_TOKEN), Some(access));
        assert_eq!(storage.get(KEY_REFRESH_TOKEN).as_deref(), Some("rt-1"));
        assert!(storage.get(KEY_USER).is_some());

        let view = store.observe().current();
        assert!(view.is_authenticated);
        assert_eq!(view.user, Some(user()));
    }

    #[test]
    fn test_apply_same_result_twice_is_idempotent() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let result = AuthResult::tokens(future_token("7", 900), "rt-1").with_user(user());

        store.apply_auth_result(&result).unwrap();
        let first = store.session();
        store.apply_auth_result(&result).unwrap();

        assert_eq!(store.session(), first);
        assert_eq!(store.epoch(), 0);
    }

    #[test]
    fn test_access_without_refresh_is_rejected() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let result = AuthResult {
            success: true,
            token: Some(future_token("7", 900)),
            ..Default::default()
        };

        assert_eq!(
            store.apply_auth_result(&result),
            Err(TokenError::MissingRefreshToken)
        );
        assert_eq!(store.state(), SessionState::Anonymous);
        assert!(store.access_token().is_none());
    }

    #[test]
    fn test_unsuccessful_result_changes_nothing() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let result = AuthResult {
            success: false,
            error: Some("Invalid credentials".into()),
            ..Default::default()
        };

        assert_eq!(
            store.apply_auth_result(&result),
            Err(TokenError::Rejected("Invalid credentials".into()))
        );
        assert_eq!(store.state(), SessionState::Anonymous);
    }

    #[test]
    fn test_reset_clears_everything_and_is_idempotent() {
        let storage = Arc::new(MemoryStorage::new());
        let store = store_with(storage.clone());
        let device_id = store.device_id();
        store
            .apply_auth_result(&AuthResult::tokens(future_token("7", 900), "rt").with_user(user()))
            .unwrap();

        store.reset_all();
        let after_first = (store.session(), store.epoch());
        store.reset_all();

        assert_eq!((store.session(), store.epoch()), after_first);
        assert_eq!(store.state(), SessionState::Anonymous);
        assert!(store.access_token().is_none());
        assert!(store.current_user().is_none());
        assert_eq!(store.device_id(), device_id);
        assert_eq!(storage.get(KEY_ACCESS_TOKEN), None);
        assert_eq!(storage.get(KEY_REFRESH_TOKEN), None);
        assert_eq!(storage.get(KEY_DEVICE_ID), Some(device_id));
    }

    #[test]
    fn test_restore_from_storage() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let store = store_with(storage.clone());
            store
                .apply_auth_result(
                    &AuthResult::tokens(future_token("7", 900), "rt-1").with_user(user()),
                )
                .unwrap();
        }

        let restored = store_with(storage);
        assert_eq!(restored.state(), SessionState::Authenticated);
        assert_eq!(restored.refresh_token().unwrap().expose(), "rt-1");
        assert_eq!(restored.current_user(), Some(user()));
    }

    #[test]
    fn test_restore_discards_half_pair() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(KEY_REFRESH_TOKEN, "orphan").unwrap();

        let store = store_with(storage.clone());
        assert_eq!(store.state(), SessionState::Anonymous);
        assert!(store.refresh_token().is_none());
        assert_eq!(storage.get(KEY_REFRESH_TOKEN), None);
    }

    #[test]
    fn test_restore_discards_undecodable_access_token() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(KEY_ACCESS_TOKEN, "opaque").unwrap();
        storage.set(KEY_REFRESH_TOKEN, "rt").unwrap();

        let store = store_with(storage);
        assert_eq!(store.state(), SessionState::Anonymous);
    }

    /// Accepts single writes but refuses every batch.
    struct BatchFailsStorage(MemoryStorage);

    impl KeyValueStore for BatchFailsStorage {
        fn get(&self, key: &str) -> Option<String> {
            self.0.get(key)
        }

        fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.0.set(key, value)
        }

        fn remove(&self, key: &str) -> anyhow::Result<()> {
            self.0.remove(key)
        }

        fn set_many(&self, _entries: &[(&str, &str)]) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    #[test]
    fn test_failed_pair_write_keeps_stored_pair_consistent() {
        let storage = Arc::new(BatchFailsStorage(MemoryStorage::new()));
        storage.set(KEY_ACCESS_TOKEN, &future_token("7", 900)).unwrap();
        storage.set(KEY_REFRESH_TOKEN, "rt-old").unwrap();

        let store = TokenStore::open(storage.clone());
        store
            .apply_auth_result(&AuthResult::tokens(future_token("8", 900), "rt-new"))
            .unwrap();
        assert_eq!(store.access_token().unwrap().subject(), "8");

        let restored = TokenStore::open(storage);
        assert_eq!(restored.state(), SessionState::Authenticated);
        assert_eq!(restored.access_token().unwrap().subject(), "7");
        assert_eq!(restored.refresh_token().unwrap().expose(), "rt-old");
    }

    #[test]
    fn test_new_pair_during_refresh_supersedes_it() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        store
            .apply_auth_result(&AuthResult::tokens(future_token("7", 900), "rt-0"))
            .unwrap();
        let started = store.refresh_credentials().unwrap();
        store.begin_refresh(started.epoch);

        store
            .apply_auth_result(&AuthResult::tokens(future_token("99", 900), "rt-login"))
            .unwrap();
        assert_ne!(store.epoch(), started.epoch);
        assert_eq!(store.state(), SessionState::Authenticated);

        let late = TokenPair {
            access_token: future_token("7", 900),
            refresh_token: "rt-1".into(),
        };
        assert_eq!(
            store.apply_refreshed(started.epoch, late),
            Err(RefreshError::SessionReset)
        );
        store.end_refresh(started.epoch);
        assert_eq!(store.refresh_token().unwrap().expose(), "rt-login");
        assert_eq!(store.access_token().unwrap().subject(), "99");
    }

    #[test]
    fn test_device_id_is_stable() {
        let storage = Arc::new(MemoryStorage::new());
        let first = store_with(storage.clone()).device_id();
        let second = store_with(storage).device_id();
        assert_eq!(first, second);
    }

    #[test]
    fn test_refreshed_pair_ignored_after_reset() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        store
            .apply_auth_result(&AuthResult::tokens(future_token("7", 900), "rt"))
            .unwrap();
        let epoch = store.epoch();
        store.reset_all();

        let pair = TokenPair {
            access_token: mint_token("7", 0, i64::from(u32::MAX)),
            refresh_token: "rt-2".into(),
        };
        assert_eq!(
            store.apply_refreshed(epoch, pair),
            Err(RefreshError::SessionReset)
        );
        assert_eq!(store.state(), SessionState::Anonymous);
    }

    #[test]
    fn test_auth_result_wire_aliases() {
        let result: AuthResult = serde_json::from_str(
            r#"{"success":true,"requiresTwoFA":true,"user":{"id":12,"email":"a@b.c"}}"#,
        )
        .unwrap();
        assert!(result.two_fa_pending);
        assert_eq!(result.user.unwrap().id, "12");

        let result: AuthResult = serde_json::from_str(
            r#"{"success":true,"accessToken":"a.b.c","refreshToken":"r"}"#,
        )
        .unwrap();
        assert_eq!(result.token.as_deref(), Some("a.b.c"));
        assert_eq!(result.refresh_token.as_deref(), Some("r"));
    }

    #[tokio::test]
    async fn test_observer_follows_changes() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let mut observer = store.observe();
        assert!(!observer.current().is_authenticated);

        store
            .apply_auth_result(&AuthResult::tokens(future_token("7", 900), "rt").with_user(user()))
            .unwrap();
        let view = observer.changed().await.unwrap();
        assert!(view.is_authenticated);

        store.reset_all();
        let view = observer.changed().await.unwrap();
        assert!(!view.is_authenticated);
        assert!(view.user.is_none());
    }

    #[tokio::test]
    async fn test_reset_signal_fires_on_new_epoch() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        store
            .apply_auth_result(&AuthResult::tokens(future_token("7", 900), "rt"))
            .unwrap();

        let signal = store.reset_signal(store.epoch());
        store.reset_all();
        tokio::time::timeout(std::time::Duration::from_secs(1), signal)
            .await
            .unwrap();
    }
}
