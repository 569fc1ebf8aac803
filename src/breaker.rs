//! # Circuit Breaker
//!
//! Detects sustained rate limiting from the remote API and exposes a
//! three-state health signal:
//!
//! - **Closed**: normal operation, new work may start.
//! - **Open**: the remote is throttling us; new work is skipped until a
//!   cool-down passes.
//! - **Half-open**: the cool-down passed; exactly one trial is admitted and
//!   the outcome recorded against its [`TrialTicket`] decides between
//!   `Closed` and `Open`. Other outcomes recorded meanwhile only feed the
//!   window.
//!
//! The breaker trips on whichever comes first: the rate-limited share of
//! the last `window` outcomes exceeding `rate_threshold`, or
//! `consecutive_threshold` rate-limited outcomes in a row. The rolling
//! average alone reacts too slowly to a sudden burst.
//!
//! Reads ([`CircuitBreaker::state`], [`CircuitBreaker::snapshot`]) never
//! mutate the breaker; only [`CircuitBreaker::admit`], the `record*`
//! methods and [`CircuitBreaker::release_trial`] do.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Outcome of one remote call, as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    RateLimited,
    /// Any non-rate-limit failure. Counts as "not rate limited".
    OtherError,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Number of most recent outcomes kept in the ring buffer.
    pub window: usize,
    /// Trip when rate-limited outcomes / window exceeds this fraction.
    pub rate_threshold: f64,
    /// Trip after this many rate-limited outcomes in a row.
    pub consecutive_threshold: u32,
    /// Time spent `Open` before a trial call is admitted.
    pub cooldown: Duration,
    /// Upper bound for the cool-down after repeated failed trials.
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 100,
            rate_threshold: 0.05,
            consecutive_threshold: 3,
            cooldown: Duration::from_secs(300),
            max_cooldown: Duration::from_secs(1200),
        }
    }
}

/// Identifies one half-open trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrialTicket(u64);

/// Answer to "may new work start now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Half-open trial. Only an outcome recorded with this ticket decides
    /// the state.
    Trial(TrialTicket),
    Rejected { retry_after: Duration },
}

/// Read-only view of the breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    /// Rate-limited share of the outcomes currently in the window.
    pub error_rate: f64,
    pub rate_limited_in_window: usize,
    pub window_len: usize,
    pub consecutive_rate_limited: u32,
    pub times_opened: u64,
    pub times_recovered: u64,
    /// Time until a trial would be admitted, when not `Closed`.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    window: VecDeque<bool>,
    rate_limited: usize,
    consecutive: u32,
    state: CircuitState,
    cooldown: Duration,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
    trial: Option<TrialTicket>,
    next_ticket: u64,
    times_opened: u64,
    times_recovered: u64,
}

/// Rolling-window circuit breaker. Owned and injected, never global.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            window = config.window,
            rate_threshold = config.rate_threshold,
            consecutive_threshold = config.consecutive_threshold,
            cooldown_ms = config.cooldown.as_millis() as u64,
            "circuit breaker initialized"
        );
        let inner = Inner {
            window: VecDeque::with_capacity(config.window),
            rate_limited: 0,
            consecutive: 0,
            state: CircuitState::Closed,
            cooldown: config.cooldown,
            opened_at: None,
            trial_started: None,
            trial: None,
            next_ticket: 0,
            times_opened: 0,
            times_recovered: 0,
        };
        Self {
            name,
            config,
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ─── Read path ────────────────────────────────────────────────────

    /// Current state. An `Open` breaker whose cool-down has passed reads
    /// as `HalfOpen` even before a trial has been admitted.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        effective_state(&inner, Instant::now())
    }

    pub fn error_rate(&self) -> f64 {
        let inner = self.lock();
        rate(&inner)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let now = Instant::now();
        let state = effective_state(&inner, now);
        BreakerSnapshot {
            state,
            error_rate: rate(&inner),
            rate_limited_in_window: inner.rate_limited,
            window_len: inner.window.len(),
            consecutive_rate_limited: inner.consecutive,
            times_opened: inner.times_opened,
            times_recovered: inner.times_recovered,
            retry_after: retry_after(&inner, now),
        }
    }

    // ─── Write path ───────────────────────────────────────────────────

    /// Ask whether a new unit of work may start.
    pub fn admit(&self) -> Admission {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let opened = inner.opened_at.unwrap_or(now);
                if now.duration_since(opened) >= inner.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    let ticket = issue_trial(&mut inner, now);
                    info!(component = %self.name, "circuit breaker half-open (trial admitted)");
                    Admission::Trial(ticket)
                } else {
                    Admission::Rejected {
                        retry_after: inner.cooldown - now.duration_since(opened),
                    }
                }
            }
            CircuitState::HalfOpen => {
                let cooldown = inner.cooldown;
                let started = inner.trial_started;
                match started {
                    // A trial that never produced an outcome does not block forever.
                    Some(started) if now.duration_since(started) < cooldown => {
                        Admission::Rejected {
                            retry_after: cooldown - now.duration_since(started),
                        }
                    }
                    _ => {
                        let ticket = issue_trial(&mut inner, now);
                        debug!(component = %self.name, "no trial outstanding; admitting another");
                        Admission::Trial(ticket)
                    }
                }
            }
        }
    }

    /// Record the outcome of one remote call that is not a trial.
    pub fn record(&self, outcome: CallOutcome) {
        self.apply(outcome, None);
    }

    /// Record the outcome of the call made under `ticket`. When the ticket
    /// is the outstanding trial, this outcome closes or reopens the
    /// breaker; a stale ticket counts like [`CircuitBreaker::record`].
    pub fn record_trial(&self, ticket: TrialTicket, outcome: CallOutcome) {
        self.apply(outcome, Some(ticket));
    }

    /// The trial holder finished without making a call. The next
    /// [`CircuitBreaker::admit`] issues a fresh trial right away.
    pub fn release_trial(&self, ticket: TrialTicket) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial == Some(ticket) {
            inner.trial = None;
            inner.trial_started = None;
            debug!(component = %self.name, "trial released without an outcome");
        }
    }

    fn apply(&self, outcome: CallOutcome, ticket: Option<TrialTicket>) {
        let mut inner = self.lock();
        let limited = outcome == CallOutcome::RateLimited;

        if inner.window.len() == self.config.window {
            if let Some(true) = inner.window.pop_front() {
                inner.rate_limited -= 1;
            }
        }
        inner.window.push_back(limited);
        if limited {
            inner.rate_limited += 1;
            inner.consecutive += 1;
        } else {
            inner.consecutive = 0;
        }

        let decides_trial = ticket.is_some() && ticket == inner.trial;
        match inner.state {
            CircuitState::Closed => {
                if limited && self.should_trip(&inner) {
                    self.open(&mut inner, false);
                }
            }
            CircuitState::HalfOpen if decides_trial => {
                if limited {
                    self.open(&mut inner, true);
                } else {
                    self.close(&mut inner);
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn should_trip(&self, inner: &Inner) -> bool {
        let burst = inner.consecutive >= self.config.consecutive_threshold;
        // Fixed denominator: a window that is still filling cannot trip on
        // the rate rule after one unlucky early call.
        let share = inner.rate_limited as f64 / self.config.window as f64;
        burst || share > self.config.rate_threshold
    }

    fn open(&self, inner: &mut Inner, failed_trial: bool) {
        if failed_trial {
            inner.cooldown = (inner.cooldown * 2).min(self.config.max_cooldown);
        }
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_started = None;
        inner.trial = None;
        inner.times_opened += 1;
        warn!(
            component = %self.name,
            rate_limited_in_window = inner.rate_limited,
            consecutive = inner.consecutive,
            cooldown_ms = inner.cooldown.as_millis() as u64,
            failed_trial,
            "circuit breaker opened"
        );
    }

    fn close(&self, inner: &mut Inner) {
        inner.state = CircuitState::Closed;
        inner.consecutive = 0;
        inner.opened_at = None;
        inner.trial_started = None;
        inner.trial = None;
        inner.cooldown = self.config.cooldown;
        inner.times_recovered += 1;
        info!(
            component = %self.name,
            rate_limited_in_window = inner.rate_limited,
            "circuit breaker closed (recovered)"
        );
    }
}

fn issue_trial(inner: &mut Inner, now: Instant) -> TrialTicket {
    inner.next_ticket += 1;
    let ticket = TrialTicket(inner.next_ticket);
    inner.trial = Some(ticket);
    inner.trial_started = Some(now);
    ticket
}

fn effective_state(inner: &Inner, now: Instant) -> CircuitState {
    match (inner.state, inner.opened_at) {
        (CircuitState::Open, Some(opened)) if now.duration_since(opened) >= inner.cooldown => {
            CircuitState::HalfOpen
        }
        (state, _) => state,
    }
}

fn rate(inner: &Inner) -> f64 {
    if inner.window.is_empty() {
        0.0
    } else {
        inner.rate_limited as f64 / inner.window.len() as f64
    }
}

fn retry_after(inner: &Inner, now: Instant) -> Option<Duration> {
    let since = match inner.state {
        CircuitState::Closed => return None,
        CircuitState::Open => inner.opened_at?,
        CircuitState::HalfOpen => match inner.trial_started {
            Some(started) => started,
            None => return Some(Duration::ZERO),
        },
    };
    Some(inner.cooldown.saturating_sub(now.duration_since(since)))
}
