//! Proactive refresh scheduling
//!
//! Keeps exactly one one-shot timer armed to refresh the access token shortly
//! before it expires. Re-arming always cancels the previous timer first, and
//! every armed timer carries a generation number so that a timer superseded
//! mid-flight never acts.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::single_flight::SingleFlightRefresher;
use super::store::{SessionSnapshot, SessionState};
use super::tokens::AccessToken;
use crate::clock::Clock;
use crate::config::SchedulerConfig;

/// The live timer, as visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRefresh {
    pub fire_at: DateTime<Utc>,
    /// Number of failed proactive attempts preceding this one.
    pub attempt: u32,
}

/// When to fire for a token, and whether the ideal time had to be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirePlan {
    pub fire_at: DateTime<Utc>,
    pub delay: Duration,
    pub skipped: bool,
}

/// `fire_at = expires_at - lead - jitter`, never sooner than `min_delay` from now.
pub fn plan_fire(
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    lead: Duration,
    jitter: Duration,
    min_delay: Duration,
) -> FirePlan {
    let min_delay = min_delay.max(Duration::from_millis(1));
    let ideal = expires_at
        .checked_sub_signed(to_chrono(lead.saturating_add(jitter)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    match (ideal - now).to_std() {
        Ok(delay) if delay >= min_delay => FirePlan {
            fire_at: ideal,
            delay,
            skipped: false,
        },
        _ => FirePlan {
            fire_at: now
                .checked_add_signed(to_chrono(min_delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            delay: min_delay,
            skipped: true,
        },
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Uniform random jitter in `[0, max_ms]`.
fn sample_jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut buf = [0u8; 8];
    if let Err(e) = getrandom::getrandom(&mut buf) {
        tracing::warn!("No randomness for refresh jitter: {}", e);
        return Duration::ZERO;
    }
    Duration::from_millis(u64::from_le_bytes(buf) % (max_ms + 1))
}

struct Armed {
    schedule: ScheduledRefresh,
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct RefreshScheduler {
    refresher: Arc<SingleFlightRefresher>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    slot: Mutex<Option<Armed>>,
    generation: AtomicU64,
}

impl RefreshScheduler {
    pub fn new(
        refresher: Arc<SingleFlightRefresher>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            refresher,
            clock,
            config,
            slot: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    /// Re-arm on every token change, cancel when the session loses its tokens.
    /// The task ends when the store goes away or the scheduler is dropped.
    pub fn follow(
        self: &Arc<Self>,
        mut changes: watch::Receiver<SessionSnapshot>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut armed_for: Option<AccessToken> = None;
            loop {
                let snapshot = changes.borrow_and_update().clone();
                let Some(this) = weak.upgrade() else { break };
                this.on_session_change(&snapshot, &mut armed_for);
                drop(this);

                if changes.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    fn on_session_change(
        self: &Arc<Self>,
        snapshot: &SessionSnapshot,
        armed_for: &mut Option<AccessToken>,
    ) {
        match (&snapshot.state, &snapshot.access_token) {
            (SessionState::Authenticated | SessionState::Refreshing, Some(token)) => {
                if armed_for.as_ref() != Some(token) {
                    self.arm_for(token);
                    *armed_for = Some(token.clone());
                }
            }
            _ => {
                if armed_for.take().is_some() {
                    self.cancel();
                }
            }
        }
    }

    /// Arm the timer for `token`'s expiry, replacing any armed timer.
    pub fn arm_for(self: &Arc<Self>, token: &AccessToken) -> ScheduledRefresh {
        let plan = plan_fire(
            self.clock.now(),
            token.expires_at(),
            self.config.lead_time(),
            sample_jitter(self.config.jitter_ms),
            self.config.min_delay(),
        );
        if plan.skipped {
            tracing::warn!(
                expires_at = %token.expires_at(),
                "Refresh time already passed, scheduling minimal delay instead"
            );
        }

        let mut slot = self.lock();
        self.arm_locked(&mut slot, plan.fire_at, plan.delay, 0)
    }

    /// Cancel the armed timer, if any. Idempotent.
    pub fn cancel(&self) {
        let mut slot = self.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(armed) = slot.take() {
            armed.handle.abort();
            tracing::debug!("Proactive refresh cancelled");
        }
    }

    /// The currently armed timer.
    pub fn scheduled(&self) -> Option<ScheduledRefresh> {
        self.lock().as_ref().map(|armed| armed.schedule)
    }

    fn arm_locked(
        self: &Arc<Self>,
        slot: &mut Option<Armed>,
        fire_at: DateTime<Utc>,
        delay: Duration,
        attempt: u32,
    ) -> ScheduledRefresh {
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let schedule = ScheduledRefresh { fire_at, attempt };
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.fire(generation, attempt, delay).await });

        *slot = Some(Armed {
            schedule,
            generation,
            handle,
        });
        tracing::debug!(%fire_at, attempt, "Proactive refresh armed");
        schedule
    }

    async fn fire(self: Arc<Self>, generation: u64, attempt: u32, delay: Duration) {
        tokio::time::sleep(delay).await;

        {
            let mut slot = self.lock();
            let current = slot
                .as_ref()
                .is_some_and(|armed| armed.generation == generation);
            if !current {
                return;
            }
            *slot = None;
        }

        tracing::debug!(attempt, "Proactive refresh firing");
        match self.refresher.refresh().await {
            Ok(_) => {}
            Err(e) if e.is_retriable() => self.retry_after(generation, attempt),
            Err(e) => tracing::debug!("Proactive refresh ended: {}", e),
        }
    }

    fn retry_after(self: &Arc<Self>, generation: u64, attempt: u32) {
        if attempt >= self.config.max_proactive_retries {
            tracing::warn!(
                attempts = attempt + 1,
                "Proactive refresh retries exhausted, deferring to request-time refresh"
            );
            return;
        }

        let mut slot = self.lock();
        // Something re-armed or cancelled in the meantime.
        if slot.is_some() || self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        let delay = self.config.retry_delay(attempt);
        let fire_at = self
            .clock
            .now()
            .checked_add_signed(to_chrono(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.arm_locked(&mut slot, fire_at, delay, attempt + 1);
    }

    fn lock(&self) -> MutexGuard<'_, Option<Armed>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}
