//! Key pool state and round-robin rotation
//!
//! The pool owns the ordered key list (fixed after construction), the active
//! index, the exhausted set and the reset deadline. The last three live in one
//! `PoolState` behind a single mutex; every operation is a short state
//! transition with no I/O, so the lock is never held across a backend call.
//!
//! Rotation always scans forward from the key after the active one, wrapping
//! around, so keys are exhausted in pool order and each gets a turn before any
//! repeats. The exhausted set is cleared lazily: the executor calls
//! `maybe_reset_exhausted` before each request, and once the cooldown window
//! has elapsed since the last reset, every key is eligible again.

use std::collections::BTreeSet;
use std::time::Duration;

use generation::Credential;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Cooldown before exhausted keys are retried.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3600);

/// The key a request should use, with its 0-based pool index.
#[derive(Debug, Clone)]
pub struct ActiveKey {
    pub index: usize,
    pub credential: Credential,
}

/// Result of marking a key exhausted.
#[derive(Debug, Clone)]
pub enum Rotation {
    /// The next non-exhausted key, now active.
    Advanced(ActiveKey),
    /// Every key is exhausted. The active index is left unchanged.
    AllExhausted,
}

#[derive(Debug)]
struct PoolState {
    active: usize,
    exhausted: BTreeSet<usize>,
    reset_at: Instant,
}

/// Ordered pool of backend API keys with rotation on exhaustion.
pub struct KeyPool {
    keys: Vec<Credential>,
    cooldown: Duration,
    state: Mutex<PoolState>,
}

impl KeyPool {
    /// Create a pool over `keys` in the given order. Key #1 starts active and
    /// the reset deadline starts now.
    pub fn new(keys: Vec<Credential>, cooldown: Duration) -> Self {
        info!(
            keys = keys.len(),
            cooldown_secs = cooldown.as_secs(),
            "key pool initialized"
        );
        metrics::gauge!("relay_keys_exhausted").set(0.0);
        Self {
            keys,
            cooldown,
            state: Mutex::new(PoolState {
                active: 0,
                exhausted: BTreeSet::new(),
                reset_at: Instant::now(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// The key at the active index.
    pub async fn current(&self) -> Result<ActiveKey> {
        if self.keys.is_empty() {
            return Err(Error::PoolEmpty);
        }
        let state = self.state.lock().await;
        Ok(self.active_key(state.active))
    }

    /// Mark the active key exhausted and advance to the next non-exhausted key
    /// in pool order.
    pub async fn mark_exhausted_and_advance(&self) -> Result<Rotation> {
        if self.keys.is_empty() {
            return Err(Error::PoolEmpty);
        }
        let mut state = self.state.lock().await;
        Ok(self.advance(&mut state))
    }

    /// Report that the key at `failed` ran out of quota.
    ///
    /// When `failed` is still the active key this is
    /// `mark_exhausted_and_advance`. When a concurrent request has already
    /// rotated past it, `failed` is only recorded as exhausted and the current
    /// active key is returned, so one quota event never advances twice.
    pub async fn rotate_from(&self, failed: usize) -> Result<Rotation> {
        if self.keys.is_empty() {
            return Err(Error::PoolEmpty);
        }
        let mut state = self.state.lock().await;
        if state.active != failed {
            if failed < self.keys.len() {
                state.exhausted.insert(failed);
                self.publish_exhausted(&state);
            }
            if !state.exhausted.contains(&state.active) {
                debug!(
                    failed_key = failed + 1,
                    active_key = state.active + 1,
                    "key already rotated by a concurrent request"
                );
                return Ok(Rotation::Advanced(self.active_key(state.active)));
            }
        }
        Ok(self.advance(&mut state))
    }

    /// Clear the exhausted set if more than the cooldown has passed since the
    /// last reset. Returns whether a reset happened.
    pub async fn maybe_reset_exhausted(&self, now: Instant) -> bool {
        let mut state = self.state.lock().await;
        if now.saturating_duration_since(state.reset_at) <= self.cooldown {
            return false;
        }
        let cleared = state.exhausted.len();
        state.exhausted.clear();
        state.reset_at = now;
        self.publish_exhausted(&state);
        if cleared > 0 {
            info!(cleared, "cooldown elapsed, retrying exhausted API keys");
        }
        true
    }

    /// Clear the exhausted set now regardless of the cooldown. Returns how
    /// many keys were cleared.
    pub async fn reset_exhausted(&self, now: Instant) -> usize {
        let mut state = self.state.lock().await;
        let cleared = state.exhausted.len();
        state.exhausted.clear();
        state.reset_at = now;
        self.publish_exhausted(&state);
        info!(cleared, "exhausted API keys reset manually");
        cleared
    }

    /// Whether every key is currently exhausted. False for an empty pool.
    pub async fn all_exhausted(&self) -> bool {
        let state = self.state.lock().await;
        !self.keys.is_empty() && state.exhausted.len() == self.keys.len()
    }

    pub async fn active_index(&self) -> usize {
        self.state.lock().await.active
    }

    /// Exhausted indices in ascending order.
    pub async fn exhausted_indices(&self) -> Vec<usize> {
        self.state.lock().await.exhausted.iter().copied().collect()
    }

    /// Time until the cooldown window elapses and exhausted keys are retried.
    pub async fn retry_after(&self, now: Instant) -> Duration {
        let state = self.state.lock().await;
        self.cooldown
            .saturating_sub(now.saturating_duration_since(state.reset_at))
    }

    /// Pool summary for the health endpoint and admin API. Never exposes keys.
    ///
    /// Status: no key exhausted → healthy, some → degraded, all or empty pool
    /// → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let total = self.keys.len();
        let exhausted = state.exhausted.len();
        let available = total - exhausted;

        let keys: Vec<serde_json::Value> = (0..total)
            .map(|index| {
                let status = if state.exhausted.contains(&index) {
                    "exhausted"
                } else {
                    "available"
                };
                serde_json::json!({
                    "key": index + 1,
                    "status": status,
                    "active": index == state.active,
                })
            })
            .collect();

        let status = if total == 0 || available == 0 {
            "unhealthy"
        } else if exhausted == 0 {
            "healthy"
        } else {
            "degraded"
        };

        let active_key = if total == 0 {
            serde_json::Value::Null
        } else {
            serde_json::Value::from(state.active + 1)
        };
        let reset_in = self
            .cooldown
            .saturating_sub(Instant::now().saturating_duration_since(state.reset_at));

        serde_json::json!({
            "status": status,
            "keys_total": total,
            "keys_available": available,
            "keys_exhausted": exhausted,
            "active_key": active_key,
            "reset_in_secs": reset_in.as_secs(),
            "keys": keys,
        })
    }

    /// Mark the active key exhausted and scan forward for the next usable key.
    /// Caller holds the state lock.
    fn advance(&self, state: &mut PoolState) -> Rotation {
        let n = self.keys.len();
        state.exhausted.insert(state.active);
        self.publish_exhausted(state);

        for offset in 1..=n {
            let index = (state.active + offset) % n;
            if !state.exhausted.contains(&index) {
                state.active = index;
                info!(key = index + 1, "switched to API key");
                metrics::counter!("relay_key_rotations_total", "outcome" => "advanced")
                    .increment(1);
                return Rotation::Advanced(self.active_key(index));
            }
        }

        warn!(keys = n, "all API keys have been exhausted");
        metrics::counter!("relay_key_rotations_total", "outcome" => "all_exhausted").increment(1);
        Rotation::AllExhausted
    }

    fn active_key(&self, index: usize) -> ActiveKey {
        ActiveKey {
            index,
            credential: self.keys[index].clone(),
        }
    }

    fn publish_exhausted(&self, state: &PoolState) {
        metrics::gauge!("relay_keys_exhausted").set(state.exhausted.len() as f64);
    }
}
