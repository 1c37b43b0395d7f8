//! Circuit breakers - per-node failure gates
//!
//! A circuit breaker protects the pipeline (and the systems behind a node)
//! from hammering an operation that keeps failing. Each node gets its own
//! three-state machine, keyed by node id and owned by a bounded
//! [`CircuitBreakerManager`].
//!
//! # State Machine
//!
//! ```text
//!                failure threshold met
//!    ┌────────┐ ──────────────────────> ┌────────┐
//!    │ Closed │                         │  Open  │
//!    └────────┘ <──────────┐            └────────┘
//!        ^                 │                 │ open_duration elapsed
//!        │                 │                 ↓
//!        │   success_threshold        ┌──────────┐
//!        │   successes reached        │ HalfOpen │──┐
//!        └────────────────────────────└──────────┘  │ any failure
//!                                          ^        │
//!                                          └────────┘ (reopens)
//! ```
//!
//! - **Closed** passes all calls and counts failures.
//! - **Open** rejects immediately with
//!   [`PipelineError::CircuitBreakerOpen`] until `open_duration` elapses.
//! - **HalfOpen** admits up to `half_open_max_calls` concurrent probes;
//!   reaching `success_threshold` successes closes the breaker, any failure
//!   reopens it.
//!
//! # Threshold Kinds
//!
//! | Kind | Trips when |
//! |------|------------|
//! | [`TripThreshold::ConsecutiveFailures`] | `failure_threshold` contiguous failures |
//! | [`TripThreshold::FailureRatio`] | failure fraction over the last `window_size` calls reaches the ratio AND at least `minimum_throughput` calls were observed |
//!
//! # Manager
//!
//! The manager creates breakers lazily on first touch and keeps at most
//! `max_count` of them. At capacity it first drops idle breakers, then
//! LRU-evicts the least recently touched *inactive* breaker; if every
//! breaker is active the request is rejected with a diagnostic. Cleanup
//! passes are serialized — a cleanup requested while one runs is skipped.
//!
//! Transitions log at `warn!` (to Open) and `info!` (to HalfOpen, Closed),
//! matching how the execution layer logs recoveries.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The three breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass; failures are counted
    Closed,
    /// Calls are rejected until the open window elapses
    Open,
    /// A bounded number of probe calls is admitted
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// A `(from, to)` breaker state change, reported to observers
pub type BreakerTransition = (CircuitState, CircuitState);

/// When a closed breaker trips
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TripThreshold {
    /// Trip on `failure_threshold` contiguous failures
    ConsecutiveFailures {
        /// Contiguous failures required to trip
        failure_threshold: u32,
    },
    /// Trip when the failure fraction over a rolling window reaches
    /// `failure_ratio_threshold`, once `minimum_throughput` calls were seen
    FailureRatio {
        /// Rolling window length in calls
        window_size: usize,
        /// Failure fraction in `(0, 1]` that trips the breaker
        failure_ratio_threshold: f64,
        /// Calls that must be observed before the ratio is meaningful
        minimum_throughput: usize,
    },
}

/// Per-node breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerOptions {
    /// When a closed breaker trips
    pub threshold: TripThreshold,

    /// How long an open breaker rejects before probing
    pub open_duration: Duration,

    /// Concurrent probes admitted while half-open
    pub half_open_max_calls: u32,

    /// Probe successes required to close again
    pub success_threshold: u32,
}

impl CircuitBreakerOptions {
    /// Consecutive-failure breaker with the given threshold
    pub fn consecutive(failure_threshold: u32) -> Self {
        Self {
            threshold: TripThreshold::ConsecutiveFailures { failure_threshold },
            ..Self::default()
        }
    }

    /// Set the open window duration
    pub fn with_open_duration(mut self, open_duration: Duration) -> Self {
        self.open_duration = open_duration;
        self
    }

    /// Set the number of probes admitted while half-open
    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    /// Set the probe successes required to close
    pub fn with_success_threshold(mut self, successes: u32) -> Self {
        self.success_threshold = successes;
        self
    }
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            threshold: TripThreshold::ConsecutiveFailures {
                failure_threshold: 5,
            },
            open_duration: Duration::from_secs(30),
            half_open_max_calls: 1,
            success_threshold: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Rolling call outcomes, `true` = failure. Only maintained for
    /// ratio thresholds.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
    last_touched: Instant,
}

/// Three-state failure gate for a single node
pub struct CircuitBreaker {
    node_id: String,
    options: CircuitBreakerOptions,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker for a node
    pub fn new(node_id: impl Into<String>, options: CircuitBreakerOptions) -> Self {
        Self {
            node_id: node_id.into(),
            options,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                window: VecDeque::new(),
                opened_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
                last_touched: Instant::now(),
            }),
        }
    }

    /// Node this breaker guards
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Current state, without side effects
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Consult the breaker before an attempt
    ///
    /// Returns `Ok(Some(transition))` when the call itself moved the
    /// breaker from Open to HalfOpen (the first call after `open_duration`
    /// is admitted as a probe), `Ok(None)` when the call is admitted
    /// without a state change, and [`PipelineError::CircuitBreakerOpen`]
    /// when the call is rejected.
    pub fn try_acquire(&self) -> Result<Option<BreakerTransition>, PipelineError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.last_touched = Instant::now();

        match inner.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.options.open_duration {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    inner.half_open_successes = 0;
                    tracing::info!(
                        node = %self.node_id,
                        "circuit breaker half-open, admitting probe"
                    );
                    Ok(Some((CircuitState::Open, CircuitState::HalfOpen)))
                } else {
                    Err(PipelineError::CircuitBreakerOpen {
                        node: self.node_id.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.options.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    Ok(None)
                } else {
                    Err(PipelineError::CircuitBreakerOpen {
                        node: self.node_id.clone(),
                    })
                }
            }
        }
    }

    /// Record a successful attempt
    pub fn record_success(&self) -> Option<BreakerTransition> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.last_touched = Instant::now();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                self.push_window(&mut inner, false);
                None
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.options.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.window.clear();
                    inner.opened_at = None;
                    inner.half_open_in_flight = 0;
                    inner.half_open_successes = 0;
                    tracing::info!(node = %self.node_id, "circuit breaker closed");
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    /// Record a failed attempt
    pub fn record_failure(&self) -> Option<BreakerTransition> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.last_touched = Instant::now();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                self.push_window(&mut inner, true);
                if self.tripped(&inner) {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        node = %self.node_id,
                        failures = inner.consecutive_failures,
                        "circuit breaker tripped open"
                    );
                    Some((CircuitState::Closed, CircuitState::Open))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::warn!(node = %self.node_id, "circuit breaker reopened from half-open");
                Some((CircuitState::HalfOpen, CircuitState::Open))
            }
            CircuitState::Open => None,
        }
    }

    /// Whether the breaker is doing work a manager must not evict
    pub fn is_active(&self) -> bool {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        inner.state != CircuitState::Closed || inner.half_open_in_flight > 0
    }

    fn last_touched(&self) -> Instant {
        self.inner.lock().expect("breaker lock poisoned").last_touched
    }

    fn push_window(&self, inner: &mut BreakerInner, failed: bool) {
        if let TripThreshold::FailureRatio { window_size, .. } = self.options.threshold {
            inner.window.push_back(failed);
            while inner.window.len() > window_size {
                inner.window.pop_front();
            }
        }
    }

    fn tripped(&self, inner: &BreakerInner) -> bool {
        match self.options.threshold {
            TripThreshold::ConsecutiveFailures { failure_threshold } => {
                inner.consecutive_failures >= failure_threshold
            }
            TripThreshold::FailureRatio {
                failure_ratio_threshold,
                minimum_throughput,
                ..
            } => {
                let calls = inner.window.len();
                if calls < minimum_throughput {
                    return false;
                }
                let failures = inner.window.iter().filter(|failed| **failed).count();
                failures as f64 / calls as f64 >= failure_ratio_threshold
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("node_id", &self.node_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Capacity and cleanup configuration for the manager
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerManagerOptions {
    /// Maximum breakers kept alive at once
    pub max_count: usize,

    /// Breakers idle longer than this are removed by cleanup
    pub inactivity_timeout: Duration,
}

impl Default for CircuitBreakerManagerOptions {
    fn default() -> Self {
        Self {
            max_count: 1024,
            inactivity_timeout: Duration::from_secs(600),
        }
    }
}

/// Bounded registry of per-node breakers with LRU eviction
///
/// Shared across all nodes of a run (and optionally across runs). Breakers
/// are created lazily on first touch.
pub struct CircuitBreakerManager {
    options: CircuitBreakerManagerOptions,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    cleanup_running: AtomicBool,
}

impl CircuitBreakerManager {
    /// Create a manager with the given capacity options
    pub fn new(options: CircuitBreakerManagerOptions) -> Self {
        Self {
            options,
            breakers: Mutex::new(HashMap::new()),
            cleanup_running: AtomicBool::new(false),
        }
    }

    /// The breaker for a node, created lazily on first touch
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] when the manager is at capacity and
    /// every existing breaker is active (no eviction victim).
    pub fn breaker_for(
        &self,
        node_id: &str,
        options: &CircuitBreakerOptions,
    ) -> Result<Arc<CircuitBreaker>, PipelineError> {
        let mut breakers = self.breakers.lock().expect("manager lock poisoned");

        if let Some(breaker) = breakers.get(node_id) {
            return Ok(Arc::clone(breaker));
        }

        if breakers.len() >= self.options.max_count {
            Self::remove_idle(&mut breakers, self.options.inactivity_timeout);
        }
        if breakers.len() >= self.options.max_count {
            // LRU-evict the least recently touched inactive breaker.
            let victim = breakers
                .iter()
                .filter(|(_, b)| !b.is_active())
                .min_by_key(|(_, b)| b.last_touched())
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    tracing::debug!(node = %id, "evicting least recently used circuit breaker");
                    breakers.remove(&id);
                }
                None => {
                    return Err(PipelineError::configuration(format!(
                        "circuit breaker capacity of {} reached and every breaker is active; \
                         refusing to create a breaker for node '{}'",
                        self.options.max_count, node_id
                    )));
                }
            }
        }

        let breaker = Arc::new(CircuitBreaker::new(node_id, options.clone()));
        breakers.insert(node_id.to_string(), Arc::clone(&breaker));
        Ok(breaker)
    }

    /// Remove breakers idle longer than the inactivity timeout
    ///
    /// Cleanups are serialized: a cleanup requested while another runs is
    /// skipped and reports zero removals.
    pub fn cleanup(&self) -> usize {
        if self.cleanup_running.swap(true, Ordering::SeqCst) {
            tracing::debug!("circuit breaker cleanup already running, skipping");
            return 0;
        }

        let removed = {
            let mut breakers = self.breakers.lock().expect("manager lock poisoned");
            Self::remove_idle(&mut breakers, self.options.inactivity_timeout)
        };
        self.cleanup_running.store(false, Ordering::SeqCst);

        if removed > 0 {
            tracing::info!(removed, "circuit breaker cleanup removed idle breakers");
        }
        removed
    }

    fn remove_idle(
        breakers: &mut HashMap<String, Arc<CircuitBreaker>>,
        inactivity_timeout: Duration,
    ) -> usize {
        let before = breakers.len();
        breakers.retain(|_, b| b.is_active() || b.last_touched().elapsed() < inactivity_timeout);
        before - breakers.len()
    }

    /// Number of live breakers
    pub fn len(&self) -> usize {
        self.breakers.lock().expect("manager lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current state of a node's breaker, if one exists
    pub fn state_of(&self, node_id: &str) -> Option<CircuitState> {
        self.breakers
            .lock()
            .expect("manager lock poisoned")
            .get(node_id)
            .map(|b| b.state())
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerManagerOptions::default())
    }
}

impl std::fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("len", &self.len())
            .field("max_count", &self.options.max_count)
            .finish()
    }
}
