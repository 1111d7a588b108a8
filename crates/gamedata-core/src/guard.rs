//! Access guard: a per-key retry/cooldown/blacklist circuit breaker around
//! lookups into loaded data.
//!
//! Each [`AccessKey`] moves through three states:
//!
//! - **Ok** -- lookups are allowed.
//! - **Cooldown** -- the key has used up its attempt budget since the last
//!   success. Lookups are denied until the cooldown interval has elapsed
//!   since the last attempt; the next attempt then starts a fresh burst.
//! - **Blacklisted** -- cumulative failures reached the blacklist threshold.
//!   Sticky: only [`AccessGuard::reset`] or [`AccessGuard::reset_all`] clear it.
//!
//! Until [`AccessGuard::mark_warm`] is called (after the first complete
//! pipeline run) the attempt budget is multiplied by a leniency factor,
//! since "not loaded yet" is expected while loading is in progress.
//!
//! All state lives behind a single mutex. The guard never returns errors;
//! it only suppresses lookups.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ===========================================================================
// Clock
// ===========================================================================

/// Source of the current time for cooldown bookkeeping.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// ===========================================================================
// Keys and configuration
// ===========================================================================

/// Kind of lookup being guarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessOp {
    /// Bulk access to a whole table.
    Table,
    /// Point lookup of one record by declared id.
    ById,
    /// String-table resolution.
    Strings,
}

/// Identity of a guarded lookup. Point lookups carry the id so one bad id
/// cannot poison the table's bulk path, and vice versa.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessKey {
    pub table: String,
    pub op: AccessOp,
    pub record_id: Option<i64>,
}

impl AccessKey {
    pub fn table(name: &str) -> Self {
        Self {
            table: name.to_ascii_lowercase(),
            op: AccessOp::Table,
            record_id: None,
        }
    }

    pub fn by_id(name: &str, id: i64) -> Self {
        Self {
            table: name.to_ascii_lowercase(),
            op: AccessOp::ById,
            record_id: Some(id),
        }
    }

    /// String resolution issued while populating `table`. `id` is `None`
    /// for a batch call.
    pub fn strings(table: &str, id: Option<u32>) -> Self {
        Self {
            table: table.to_ascii_lowercase(),
            op: AccessOp::Strings,
            record_id: id.map(i64::from),
        }
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            AccessOp::Table => "table",
            AccessOp::ById => "by_id",
            AccessOp::Strings => "strings",
        };
        match self.record_id {
            Some(id) => write!(f, "{}/{}#{}", self.table, op, id),
            None => write!(f, "{}/{}", self.table, op),
        }
    }
}

/// Thresholds for the access guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardConfig {
    /// Consecutive attempts allowed before entering cooldown.
    pub max_retries: u32,
    /// Time since the last attempt after which a key leaves cooldown.
    pub cooldown: Duration,
    /// Cumulative failures after which a key is blacklisted.
    pub blacklist_after: u32,
    /// Multiplier on `max_retries` until the first full load completes.
    pub warmup_leniency: u32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            cooldown: Duration::from_secs(2),
            blacklist_after: 15,
            warmup_leniency: 3,
        }
    }
}

// ===========================================================================
// State
// ===========================================================================

/// Retry bookkeeping for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub last_attempt: Option<Instant>,
    pub failures: u32,
    pub blacklisted: bool,
}

/// Observable state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Ok,
    Cooldown,
    Blacklisted,
}

/// Aggregate counts over all tracked keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardStats {
    pub tracked: usize,
    pub cooling: usize,
    pub blacklisted: usize,
}

#[derive(Debug, Default)]
struct GuardInner {
    states: HashMap<AccessKey, RetryState>,
    warm: bool,
}

// ===========================================================================
// Guard
// ===========================================================================

/// Per-key circuit breaker. Share it by `Arc`.
#[derive(Debug)]
pub struct AccessGuard {
    config: GuardConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<GuardInner>,
    quiet: AtomicBool,
}

impl Default for AccessGuard {
    fn default() -> Self {
        Self::new(GuardConfig::default())
    }
}

impl AccessGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: GuardConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(GuardInner::default()),
            quiet: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    fn effective_max(&self, warm: bool) -> u32 {
        if warm {
            self.config.max_retries
        } else {
            self.config
                .max_retries
                .saturating_mul(self.config.warmup_leniency.max(1))
        }
    }

    fn cooling_down(&self, state: &RetryState, now: Instant) -> bool {
        state
            .last_attempt
            .map(|last| now.saturating_duration_since(last) < self.config.cooldown)
            .unwrap_or(false)
    }

    fn classify(&self, state: &RetryState, warm: bool, now: Instant) -> GuardState {
        if state.blacklisted {
            GuardState::Blacklisted
        } else if state.attempts >= self.effective_max(warm) && self.cooling_down(state, now) {
            GuardState::Cooldown
        } else {
            GuardState::Ok
        }
    }

    /// Whether a lookup for `key` may proceed right now.
    pub fn should_allow(&self, key: &AccessKey) -> bool {
        let inner = self.inner.lock();
        let Some(state) = inner.states.get(key) else {
            return true;
        };
        let allowed = self.classify(state, inner.warm, self.clock.now()) == GuardState::Ok;
        if !allowed && !self.is_quiet() {
            debug!(key = %key, attempts = state.attempts, failures = state.failures, "lookup denied");
        }
        allowed
    }

    /// Count an attempt. A key whose cooldown window has fully elapsed since
    /// its previous attempt starts a fresh burst.
    pub fn record_attempt(&self, key: &AccessKey) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.count_attempt(&mut inner, key, now);
    }

    fn count_attempt(&self, inner: &mut GuardInner, key: &AccessKey, now: Instant) {
        let max = self.effective_max(inner.warm);
        let state = inner.states.entry(key.clone()).or_default();

        if let Some(last) = state.last_attempt
            && state.attempts > 0
            && now.saturating_duration_since(last) >= self.config.cooldown
        {
            if state.attempts >= max && !self.is_quiet() {
                info!(key = %key, "cooldown elapsed, allowing a fresh burst");
            }
            state.attempts = 0;
        }

        state.attempts = state.attempts.saturating_add(1);
        state.last_attempt = Some(now);
    }

    /// Check and count an attempt under one lock, so concurrent callers
    /// cannot all pass the check before any of them is counted.
    fn try_begin(&self, key: &AccessKey) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if let Some(state) = inner.states.get(key)
            && self.classify(state, inner.warm, now) != GuardState::Ok
        {
            if !self.is_quiet() {
                debug!(key = %key, attempts = state.attempts, failures = state.failures, "lookup denied");
            }
            return false;
        }
        self.count_attempt(&mut inner, key, now);
        true
    }

    /// Clear all counters and any blacklist for `key`.
    pub fn record_success(&self, key: &AccessKey) {
        let removed = self.inner.lock().states.remove(key);
        if let Some(state) = removed
            && state.failures > 0
            && !self.is_quiet()
        {
            debug!(key = %key, failures = state.failures, "lookup recovered");
        }
    }

    /// Count a failure; blacklist the key once the threshold is reached.
    pub fn record_failure(&self, key: &AccessKey) {
        let mut inner = self.inner.lock();
        let max = self.effective_max(inner.warm);
        let state = inner.states.entry(key.clone()).or_default();
        state.failures = state.failures.saturating_add(1);

        if !state.blacklisted && state.failures >= self.config.blacklist_after {
            state.blacklisted = true;
            warn!(key = %key, failures = state.failures, "key blacklisted after repeated failures");
        } else if !state.blacklisted && state.attempts == max && !self.is_quiet() {
            warn!(
                key = %key,
                attempts = state.attempts,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "retry budget exhausted, cooling down"
            );
        }
    }

    /// Run `lookup` under the guard.
    ///
    /// Returns `None` without calling `lookup` when the key is denied.
    /// `Ok(Some)` is a success. `Ok(None)` is a success for point lookups
    /// (a legitimately absent id) and a failure otherwise. `Err` is a failure.
    pub fn guarded<T, E, F>(&self, key: &AccessKey, lookup: F) -> Option<T>
    where
        E: fmt::Display,
        F: FnOnce() -> Result<Option<T>, E>,
    {
        if !self.try_begin(key) {
            return None;
        }
        match lookup() {
            Ok(Some(value)) => {
                self.record_success(key);
                Some(value)
            }
            Ok(None) => {
                if key.op == AccessOp::ById {
                    self.record_success(key);
                } else {
                    self.record_failure(key);
                }
                None
            }
            Err(e) => {
                if !self.is_quiet() {
                    debug!(key = %key, error = %e, "guarded lookup failed");
                }
                self.record_failure(key);
                None
            }
        }
    }

    /// Current state of `key`.
    pub fn state(&self, key: &AccessKey) -> GuardState {
        let inner = self.inner.lock();
        inner
            .states
            .get(key)
            .map(|s| self.classify(s, inner.warm, self.clock.now()))
            .unwrap_or(GuardState::Ok)
    }

    /// Raw bookkeeping for `key`, if tracked.
    pub fn retry_state(&self, key: &AccessKey) -> Option<RetryState> {
        self.inner.lock().states.get(key).copied()
    }

    pub fn stats(&self) -> GuardStats {
        let inner = self.inner.lock();
        let now = self.clock.now();
        let mut stats = GuardStats {
            tracked: inner.states.len(),
            ..GuardStats::default()
        };
        for state in inner.states.values() {
            match self.classify(state, inner.warm, now) {
                GuardState::Cooldown => stats.cooling += 1,
                GuardState::Blacklisted => stats.blacklisted += 1,
                GuardState::Ok => {}
            }
        }
        stats
    }

    /// Forget everything about `key`. Returns whether it was tracked.
    pub fn reset(&self, key: &AccessKey) -> bool {
        let removed = self.inner.lock().states.remove(key).is_some();
        if removed {
            info!(key = %key, "access guard reset");
        }
        removed
    }

    /// Forget all keys. The warm flag is kept.
    pub fn reset_all(&self) {
        let mut inner = self.inner.lock();
        let count = inner.states.len();
        inner.states.clear();
        info!(keys = count, "access guard reset");
    }

    /// Signal that the first full load has completed; leniency ends.
    pub fn mark_warm(&self) {
        self.inner.lock().warm = true;
    }

    pub fn is_warm(&self) -> bool {
        self.inner.lock().warm
    }

    /// Suppress recovery logging until the returned scope is dropped.
    pub fn quiet(&self) -> QuietScope<'_> {
        let previous = self.quiet.swap(true, Ordering::SeqCst);
        QuietScope {
            guard: self,
            previous,
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet.load(Ordering::SeqCst)
    }
}

/// Scope returned by [`AccessGuard::quiet`]. Restores the previous quiet
/// flag when dropped, including during unwinding.
#[must_use = "quiet mode ends when the scope is dropped"]
#[derive(Debug)]
pub struct QuietScope<'a> {
    guard: &'a AccessGuard,
    previous: bool,
}

impl Drop for QuietScope<'_> {
    fn drop(&mut self) {
        self.guard.quiet.store(self.previous, Ordering::SeqCst);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
