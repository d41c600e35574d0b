//! Per-source circuit breaking (source health tracking).
//!
//! Stops the engine from hammering a source that keeps failing.
//!
//! # Source States
//!
//! ```text
//! HEALTHY --[threshold failures within grace window]--> BLOCKED
//!    ^                                                     |
//!    +------------[cool-down elapsed since last failure]---+
//! ```
//!
//! Unlike a request-level breaker there is no half-open probing: a success
//! while blocked does not release the source, so a single lucky response
//! during a flapping outage cannot mask a broken source. Release is purely
//! time based, lazily in [`SourceBreaker::is_blocked`] and eagerly in
//! [`SourceBreaker::reconcile`].
//!
//! Two tiers share this state machine with different thresholds:
//! [`BreakerTier::Fetch`] (minutes-scale, generic page fetches) and
//! [`BreakerTier::Render`] (hours-scale, render and fallback paths).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{BreakerConfig, EngineConfig};
use crate::events::{EngineEvent, EngineReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerTier {
    /// Fast fetch-blacklist for generic page fetches.
    Fetch,
    /// Slow tier for render and fallback fetch paths.
    Render,
}

impl fmt::Display for BreakerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerTier::Fetch => write!(f, "fetch"),
            BreakerTier::Render => write!(f, "render"),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    error_count: u32,
    total_error_count: u64,
    last_error_at: Option<Instant>,
    blocked: bool,
}

/// Snapshot of one source's breaker for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStats {
    pub source: String,
    pub tier: BreakerTier,
    pub blocked: bool,
    pub error_count: u32,
    pub total_error_count: u64,
    pub time_until_reset: Option<Duration>,
}

/// Thread-safe breaker table for one tier, keyed by source name.
#[derive(Clone)]
pub struct SourceBreaker {
    tier: BreakerTier,
    config: BreakerConfig,
    states: Arc<Mutex<HashMap<String, BreakerState>>>,
    reporter: Arc<dyn EngineReporter>,
}

impl SourceBreaker {
    pub fn new(tier: BreakerTier, config: BreakerConfig, reporter: Arc<dyn EngineReporter>) -> Self {
        Self {
            tier,
            config,
            states: Arc::new(Mutex::new(HashMap::new())),
            reporter,
        }
    }

    pub fn tier(&self) -> BreakerTier {
        self.tier
    }

    /// Acquires the state lock, recovering from poison if necessary.
    fn lock_states(&self) -> MutexGuard<'_, HashMap<String, BreakerState>> {
        self.states.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(tier = %self.tier, "Recovered from poisoned breaker mutex");
            poisoned.into_inner()
        })
    }

    pub fn record_failure(&self, source: &str) {
        let now = Instant::now();
        let opened = {
            let mut states = self.lock_states();
            let state = states.entry(source.to_string()).or_default();
            self.maybe_release(state, now);

            // Sparse, unrelated failures must not accumulate.
            if !state.blocked
                && let Some(last) = state.last_error_at
                && now.duration_since(last) > self.config.grace_window()
            {
                state.error_count = 0;
            }

            state.error_count = state.error_count.saturating_add(1);
            state.total_error_count += 1;
            state.last_error_at = Some(now);

            if !state.blocked && state.error_count >= self.config.threshold {
                state.blocked = true;
                Some(state.error_count)
            } else {
                None
            }
        };

        if let Some(error_count) = opened {
            self.reporter.report(EngineEvent::SourceTooManyErrors {
                source,
                tier: self.tier,
                error_count,
                cool_down: self.config.cool_down(),
            });
        }
    }

    /// A success never releases a blocked source; it only resets the
    /// failure streak of a healthy one.
    pub fn record_success(&self, source: &str) {
        let mut states = self.lock_states();
        if let Some(state) = states.get_mut(source)
            && !state.blocked
        {
            state.error_count = 0;
        }
    }

    pub fn is_blocked(&self, source: &str) -> bool {
        let now = Instant::now();
        let (blocked, released) = {
            let mut states = self.lock_states();
            match states.get_mut(source) {
                Some(state) => {
                    let released = self.maybe_release(state, now);
                    (state.blocked, released)
                }
                None => (false, false),
            }
        };
        if released {
            self.reporter.report(EngineEvent::SourceUnblocked {
                source,
                tier: self.tier,
            });
        }
        blocked
    }

    /// Releases every source whose cool-down has elapsed. Returns the
    /// released source names.
    pub fn reconcile(&self) -> Vec<String> {
        let now = Instant::now();
        let released: Vec<String> = {
            let mut states = self.lock_states();
            states
                .iter_mut()
                .filter_map(|(source, state)| {
                    self.maybe_release(state, now).then(|| source.clone())
                })
                .collect()
        };
        for source in &released {
            self.reporter.report(EngineEvent::SourceUnblocked {
                source,
                tier: self.tier,
            });
        }
        released
    }

    pub fn stats(&self, source: &str) -> Option<BreakerStats> {
        let now = Instant::now();
        let states = self.lock_states();
        let state = states.get(source)?;
        let time_until_reset = match (state.blocked, state.last_error_at) {
            (true, Some(last)) => Some(
                self.config
                    .cool_down()
                    .saturating_sub(now.duration_since(last)),
            ),
            _ => None,
        };
        Some(BreakerStats {
            source: source.to_string(),
            tier: self.tier,
            blocked: state.blocked,
            error_count: state.error_count,
            total_error_count: state.total_error_count,
            time_until_reset,
        })
    }

    /// Operator override: forget the failure streak and unblock.
    pub fn reset(&self, source: &str) {
        let mut states = self.lock_states();
        if let Some(state) = states.get_mut(source) {
            tracing::info!(%source, tier = %self.tier, "Source breaker manually reset");
            state.blocked = false;
            state.error_count = 0;
        }
    }

    /// Returns true when this call released the source.
    fn maybe_release(&self, state: &mut BreakerState, now: Instant) -> bool {
        if state.blocked
            && let Some(last) = state.last_error_at
            && now.duration_since(last) >= self.config.cool_down()
        {
            state.blocked = false;
            state.error_count = 0;
            return true;
        }
        false
    }
}

/// Both breaker tiers, shared process-wide.
#[derive(Clone)]
pub struct BreakerRegistry {
    fetch: SourceBreaker,
    render: SourceBreaker,
}

impl BreakerRegistry {
    pub fn new(config: &EngineConfig, reporter: Arc<dyn EngineReporter>) -> Self {
        Self {
            fetch: SourceBreaker::new(
                BreakerTier::Fetch,
                config.fetch_breaker.clone(),
                reporter.clone(),
            ),
            render: SourceBreaker::new(
                BreakerTier::Render,
                config.render_breaker.clone(),
                reporter,
            ),
        }
    }

    pub fn tier(&self, tier: BreakerTier) -> &SourceBreaker {
        match tier {
            BreakerTier::Fetch => &self.fetch,
            BreakerTier::Render => &self.render,
        }
    }

    pub fn is_blocked(&self, tier: BreakerTier, source: &str) -> bool {
        self.tier(tier).is_blocked(source)
    }

    /// Time-based release sweep over both tiers.
    pub fn reconcile(&self) -> usize {
        self.fetch.reconcile().len() + self.render.reconcile().len()
    }
}
