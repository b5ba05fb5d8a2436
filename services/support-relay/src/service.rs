//! Service state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! Caller (main.rs) executes the I/O implied by each action.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Exit code for a configuration error (sysexits EX_CONFIG)
pub const EXIT_CONFIG: i32 = 78;

/// Time allowed for in-flight requests to finish after a shutdown signal
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime counters shared by the handlers and the health endpoint
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently being processed, reported when the drain deadline
    /// expires
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Marks one request in flight for as long as it lives.
pub struct InFlight(Arc<AtomicU64>);

impl InFlight {
    pub fn enter(metrics: &ServiceMetrics) -> Self {
        metrics.in_flight.fetch_add(1, Ordering::Relaxed);
        Self(metrics.in_flight.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Service states.
///
/// Fields are carried for logging and transitions and are not all read.
#[derive(Debug)]
#[allow(dead_code)]
pub enum ServiceState {
    /// Loading config, building the key pool
    Initializing,
    /// Binding the HTTP listener
    Starting { listen_addr: SocketAddr, keys: usize },
    /// Accepting and answering requests
    Running { listen_addr: SocketAddr, keys: usize },
    /// Graceful shutdown, finishing in-flight requests
    Draining { deadline: Instant },
    /// Terminal state
    Stopped { exit_code: i32 },
}

/// Events that drive state transitions
#[derive(Debug)]
pub enum ServiceEvent {
    /// Configuration parsed and API keys resolved
    ConfigLoaded { listen_addr: SocketAddr, keys: usize },
    /// HTTP listener bound and ready
    ListenerReady,
    /// HTTP listener failed to bind
    ListenerFailed(String),
    /// SIGTERM/SIGINT received
    ShutdownSignal,
    /// Every in-flight request finished before the deadline
    DrainComplete,
    /// Drain deadline exceeded
    DrainTimeout,
}

/// Actions the caller should execute after a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum ServiceAction {
    /// Bind HTTP listener on the given address
    StartListener { addr: SocketAddr },
    /// Stop accepting connections and wait up to `DRAIN_TIMEOUT`
    BeginDrain,
    /// Cancel generations still in flight, then exit
    AbortInFlight,
    /// Exit the process
    Shutdown { exit_code: i32 },
    /// No-op
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: ServiceState, event: ServiceEvent) -> (ServiceState, ServiceAction) {
    match (state, event) {
        // --- Initializing ---
        (ServiceState::Initializing, ServiceEvent::ConfigLoaded { keys: 0, .. }) => (
            ServiceState::Stopped {
                exit_code: EXIT_CONFIG,
            },
            ServiceAction::Shutdown {
                exit_code: EXIT_CONFIG,
            },
        ),

        (ServiceState::Initializing, ServiceEvent::ConfigLoaded { listen_addr, keys }) => (
            ServiceState::Starting { listen_addr, keys },
            ServiceAction::StartListener { addr: listen_addr },
        ),

        // --- Starting ---
        (ServiceState::Starting { listen_addr, keys }, ServiceEvent::ListenerReady) => (
            ServiceState::Running { listen_addr, keys },
            ServiceAction::None,
        ),

        (ServiceState::Starting { .. }, ServiceEvent::ListenerFailed(_)) => (
            ServiceState::Stopped { exit_code: 1 },
            ServiceAction::Shutdown { exit_code: 1 },
        ),

        // --- Running ---
        (ServiceState::Running { .. }, ServiceEvent::ShutdownSignal) => (
            ServiceState::Draining {
                deadline: Instant::now() + DRAIN_TIMEOUT,
            },
            ServiceAction::BeginDrain,
        ),

        // --- Draining ---
        (ServiceState::Draining { .. }, ServiceEvent::DrainComplete) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        (ServiceState::Draining { .. }, ServiceEvent::DrainTimeout) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::AbortInFlight,
        ),

        // --- Any state + shutdown = stop ---
        (ServiceState::Stopped { exit_code }, ServiceEvent::ShutdownSignal) => (
            ServiceState::Stopped { exit_code },
            ServiceAction::None,
        ),

        (_, ServiceEvent::ShutdownSignal) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, ServiceAction::None),
    }
}
