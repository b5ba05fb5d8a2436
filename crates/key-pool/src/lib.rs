//! API-key pool with rotation and failover
//!
//! Holds the ordered list of backend API keys, tracks which one is active and
//! which are temporarily exhausted, and drives each question through the
//! generation backend, rotating keys when one runs out of quota.
//!
//! Key lifecycle:
//! 1. Keys load from configuration at startup; key #1 is active
//! 2. A request fails with a quota signal → key marked exhausted, the next
//!    non-exhausted key in pool order becomes active
//! 3. Every key exhausted → requests get `AllKeysExhausted` immediately
//! 4. Cooldown window elapses → the next request clears the exhausted set and
//!    all keys are tried again

pub mod error;
pub mod executor;
pub mod pool;

pub use error::{Error, ExecuteError, Result};
pub use executor::{Answer, FALLBACK_ANSWER, FailoverExecutor};
pub use pool::{ActiveKey, DEFAULT_COOLDOWN, KeyPool, Rotation};
