//! Per-credential call budgets for metadata APIs.
//!
//! Each credential (an API key or token) owns one counter per configured
//! window, e.g. 1 call/second and 60 calls/minute at the same time. A slot
//! is granted only when every window has budget left; over-limit callers are
//! deferred, never rejected.
//!
//! Callers of one credential queue on a FIFO async lock (the turnstile), so
//! slots are handed out in arrival order. The caller at the head of the
//! queue sleeps until the earliest blocking window rolls over instead of
//! spinning. The counters themselves sit behind a short synchronous critical
//! section that is never held across an `.await`.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trawl_core::config::{RateLimitConfig, WindowConfig};
//! use trawl_core::events::TracingReporter;
//! use trawl_core::rate_limit::RateLimiter;
//!
//! # async fn run() -> Result<(), trawl_core::AppError> {
//! let mut config = RateLimitConfig::default();
//! config.credentials.insert(
//!     "omdb-key-1".into(),
//!     vec![WindowConfig::per_second(1), WindowConfig::per_minute(60)],
//! );
//! let limiter = RateLimiter::new(config, Arc::new(TracingReporter));
//! limiter.acquire("omdb-key-1").await?;
//! // ... issue the call ...
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{RateLimitConfig, WindowConfig};
use crate::error::AppError;
use crate::events::{EngineEvent, EngineReporter};

#[derive(Debug)]
struct WindowCounter {
    limit: u32,
    duration: Duration,
    window_start: Option<Instant>,
    calls: u32,
}

impl WindowCounter {
    fn new(config: &WindowConfig) -> Self {
        Self {
            limit: config.limit,
            duration: config.duration(),
            window_start: None,
            calls: 0,
        }
    }

    /// Resets this window (and only this one) once it has lapsed.
    fn roll(&mut self, now: Instant) {
        if let Some(start) = self.window_start
            && now.duration_since(start) >= self.duration
        {
            self.window_start = None;
            self.calls = 0;
        }
    }

    /// Time until this window can take another call, if it is full.
    fn wait(&self, now: Instant) -> Option<Duration> {
        if self.calls < self.limit {
            return None;
        }
        let start = self.window_start?;
        Some(self.duration.saturating_sub(now.duration_since(start)))
    }

    fn charge(&mut self, now: Instant) {
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.calls += 1;
    }
}

#[derive(Debug)]
struct CredentialBudget {
    windows: Vec<WindowCounter>,
    exhausted_until: Option<Instant>,
}

impl CredentialBudget {
    fn new(windows: &[WindowConfig]) -> Self {
        Self {
            windows: windows.iter().map(WindowCounter::new).collect(),
            exhausted_until: None,
        }
    }

    fn exhausted(&mut self, now: Instant) -> Option<Duration> {
        match self.exhausted_until {
            Some(until) if until > now => Some(until - now),
            Some(_) => {
                self.exhausted_until = None;
                None
            }
            None => None,
        }
    }

    /// Charges every window, or returns how long to wait before retrying.
    fn try_charge(&mut self, now: Instant) -> Result<(), Duration> {
        for window in &mut self.windows {
            window.roll(now);
        }
        let wait = self.windows.iter().filter_map(|w| w.wait(now)).max();
        match wait {
            Some(wait) => Err(wait),
            None => {
                for window in &mut self.windows {
                    window.charge(now);
                }
                Ok(())
            }
        }
    }
}

struct CredentialSlot {
    /// FIFO queue of callers waiting for this credential.
    turnstile: tokio::sync::Mutex<()>,
    budget: Mutex<CredentialBudget>,
}

/// Counter state of one window, for monitoring and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub limit: u32,
    pub duration: Duration,
    pub calls_in_window: u32,
}

/// Thread-safe per-credential rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    config: Arc<RateLimitConfig>,
    slots: Arc<Mutex<HashMap<String, Arc<CredentialSlot>>>>,
    reporter: Arc<dyn EngineReporter>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, reporter: Arc<dyn EngineReporter>) -> Self {
        Self {
            config: Arc::new(config),
            slots: Arc::new(Mutex::new(HashMap::new())),
            reporter,
        }
    }

    fn slot(&self, credential: &str) -> Arc<CredentialSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate limiter mutex");
            poisoned.into_inner()
        });
        slots
            .entry(credential.to_string())
            .or_insert_with(|| {
                Arc::new(CredentialSlot {
                    turnstile: tokio::sync::Mutex::new(()),
                    budget: Mutex::new(CredentialBudget::new(
                        self.config.windows_for(credential),
                    )),
                })
            })
            .clone()
    }

    fn lock_budget(slot: &CredentialSlot) -> MutexGuard<'_, CredentialBudget> {
        slot.budget.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits until every window of `credential` has budget, then charges them.
    ///
    /// Fails fast with [`AppError::CredentialExhausted`] while the credential
    /// is marked exhausted.
    pub async fn acquire(&self, credential: &str) -> Result<(), AppError> {
        let slot = self.slot(credential);
        let _turn = slot.turnstile.lock().await;

        loop {
            let now = Instant::now();
            let wait = {
                let mut budget = Self::lock_budget(&slot);
                if budget.exhausted(now).is_some() {
                    return Err(AppError::CredentialExhausted(credential.to_string()));
                }
                match budget.try_charge(now) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };

            if let Some(max_wait) = self.config.max_wait()
                && wait > max_wait
            {
                self.mark_exhausted(credential, wait);
                return Err(AppError::CredentialExhausted(credential.to_string()));
            }

            tracing::debug!(
                %credential,
                sleep_ms = %wait.as_millis(),
                "Waiting for rate window"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Marks a credential exhausted for `retry_after`, e.g. after the provider
    /// reported its quota consumed. Reported once per exhaustion episode.
    pub fn mark_exhausted(&self, credential: &str, retry_after: Duration) {
        let slot = self.slot(credential);
        let now = Instant::now();
        let newly_exhausted = {
            let mut budget = Self::lock_budget(&slot);
            let was_exhausted = budget.exhausted(now).is_some();
            let until = now + retry_after;
            if budget.exhausted_until.is_none_or(|current| current < until) {
                budget.exhausted_until = Some(until);
            }
            !was_exhausted
        };
        if newly_exhausted {
            self.reporter.report(EngineEvent::CredentialExhausted {
                credential,
                retry_after,
            });
        }
    }

    pub fn is_exhausted(&self, credential: &str) -> bool {
        let slot = self.slot(credential);
        let mut budget = Self::lock_budget(&slot);
        budget.exhausted(Instant::now()).is_some()
    }

    /// Current window counters of `credential` (after lapsed windows roll).
    pub fn snapshot(&self, credential: &str) -> Vec<WindowSnapshot> {
        let slot = self.slot(credential);
        let now = Instant::now();
        let mut budget = Self::lock_budget(&slot);
        budget
            .windows
            .iter_mut()
            .map(|w| {
                w.roll(now);
                WindowSnapshot {
                    limit: w.limit,
                    duration: w.duration,
                    calls_in_window: w.calls,
                }
            })
            .collect()
    }
}

/// Rotates calls across several credentials of one provider, skipping
/// exhausted ones.
#[derive(Clone)]
pub struct CredentialPool {
    provider: String,
    credentials: Arc<Vec<String>>,
    cursor: Arc<AtomicUsize>,
    limiter: RateLimiter,
}

impl CredentialPool {
    pub fn new(provider: impl Into<String>, credentials: Vec<String>, limiter: RateLimiter) -> Self {
        Self {
            provider: provider.into(),
            credentials: Arc::new(credentials),
            cursor: Arc::new(AtomicUsize::new(0)),
            limiter,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Picks the next credential that is not exhausted, without taking a
    /// rate slot. For callers that charge the credential later, e.g. through
    /// a fetch policy.
    pub fn select(&self) -> Result<String, AppError> {
        let n = self.credentials.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .map(|offset| &self.credentials[(start + offset) % n])
            .find(|credential| !self.limiter.is_exhausted(credential))
            .cloned()
            .ok_or_else(|| AppError::CredentialExhausted(self.provider.clone()))
    }

    /// Picks the next usable credential and waits for its rate slot.
    ///
    /// Fails fast once every credential of the pool is exhausted.
    pub async fn acquire(&self) -> Result<String, AppError> {
        let n = self.credentials.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..n {
            let credential = &self.credentials[(start + offset) % n];
            if self.limiter.is_exhausted(credential) {
                continue;
            }
            match self.limiter.acquire(credential).await {
                Ok(()) => return Ok(credential.clone()),
                Err(AppError::CredentialExhausted(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        tracing::warn!(provider = %self.provider, "All credentials exhausted");
        Err(AppError::CredentialExhausted(self.provider.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingReporter;

    fn limiter(windows: Vec<WindowConfig>) -> (RateLimiter, RecordingReporter) {
        let reporter = RecordingReporter::new();
        let config = RateLimitConfig {
            default_windows: windows,
            ..Default::default()
        };
        (
            RateLimiter::new(config, Arc::new(reporter.clone())),
            reporter,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_is_immediate_with_budget() {
        let (limiter, _) = limiter(vec![WindowConfig::per_second(3)]);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire("key").await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.snapshot("key")[0].calls_in_window, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn five_concurrent_acquires_are_a_second_apart() {
        let (limiter, _) = limiter(vec![WindowConfig::per_second(1), WindowConfig::per_minute(60)]);
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire("key").await.unwrap();
                Instant::now()
            }));
        }
        let mut granted = Vec::new();
        for handle in handles {
            granted.push(handle.await.unwrap());
        }
        granted.sort();

        for pair in granted.windows(2) {
            assert!(
                pair[1] - pair[0] >= Duration::from_secs(1),
                "slots granted too close together: {:?}",
                pair[1] - pair[0]
            );
        }
        assert!(granted[4] - start >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn nested_windows_never_overrun() {
        let (limiter, _) = limiter(vec![WindowConfig::per_second(3), WindowConfig::per_minute(5)]);

        let mut handles = Vec::new();
        for _ in 0..12 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire("key").await.unwrap();
                for window in limiter.snapshot("key") {
                    assert!(window.calls_in_window <= window.limit, "{window:?}");
                }
                Instant::now()
            }));
        }
        let start = Instant::now();
        let mut granted = Vec::new();
        for handle in handles {
            granted.push(handle.await.unwrap());
        }
        granted.sort();

        // Five fit in the first minute; the per-minute window gates the rest.
        assert!(granted[4] - start < Duration::from_secs(60));
        assert!(granted[5] - start >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn rollover_resets_only_lapsed_window() {
        let (limiter, _) = limiter(vec![WindowConfig::per_second(2), WindowConfig::per_minute(10)]);
        limiter.acquire("key").await.unwrap();
        limiter.acquire("key").await.unwrap();

        tokio::time::advance(Duration::from_millis(1_100)).await;
        let snapshot = limiter.snapshot("key");
        assert_eq!(snapshot[0].calls_in_window, 0);
        assert_eq!(snapshot[1].calls_in_window, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slots_granted_in_arrival_order() {
        let (limiter, _) = limiter(vec![WindowConfig::per_second(1)]);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..4 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire("key").await.unwrap();
                order.lock().unwrap().push(id);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn credentials_are_independent() {
        let (limiter, _) = limiter(vec![WindowConfig::per_second(1)]);
        let start = Instant::now();
        limiter.acquire("a").await.unwrap();
        limiter.acquire("b").await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_credential_fails_fast_then_recovers() {
        let (limiter, reporter) = limiter(vec![WindowConfig::per_second(5)]);
        limiter.mark_exhausted("key", Duration::from_secs(60));
        limiter.mark_exhausted("key", Duration::from_secs(30));

        let err = limiter.acquire("key").await.unwrap_err();
        assert!(matches!(err, AppError::CredentialExhausted(_)));
        assert_eq!(reporter.count("credential_exhausted"), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.acquire("key").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_turns_long_waits_into_exhaustion() {
        let reporter = RecordingReporter::new();
        let config = RateLimitConfig {
            default_windows: vec![WindowConfig {
                limit: 1,
                duration_ms: 24 * 60 * 60 * 1000,
            }],
            max_wait_ms: Some(60_000),
            ..Default::default()
        };
        let limiter = RateLimiter::new(config, Arc::new(reporter.clone()));

        limiter.acquire("daily").await.unwrap();
        let err = limiter.acquire("daily").await.unwrap_err();
        assert!(matches!(err, AppError::CredentialExhausted(_)));
        assert!(limiter.is_exhausted("daily"));
        assert_eq!(reporter.count("credential_exhausted"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_window_list_is_unlimited() {
        let (limiter, _) = limiter(vec![]);
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire("key").await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_skips_exhausted_credentials() {
        let (limiter, _) = limiter(vec![WindowConfig::per_second(10)]);
        let pool = CredentialPool::new("omdb", vec!["k1".into(), "k2".into()], limiter.clone());

        limiter.mark_exhausted("k1", Duration::from_secs(3600));
        for _ in 0..4 {
            assert_eq!(pool.acquire().await.unwrap(), "k2");
        }

        limiter.mark_exhausted("k2", Duration::from_secs(3600));
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, AppError::CredentialExhausted(p) if p == "omdb"));
        assert!(pool.select().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pool_select_rotates_without_charging() {
        let (limiter, _) = limiter(vec![WindowConfig::per_second(1)]);
        let pool = CredentialPool::new("omdb", vec!["k1".into(), "k2".into()], limiter.clone());

        let picks: Vec<String> = (0..4).map(|_| pool.select().unwrap()).collect();
        assert_eq!(picks, vec!["k1", "k2", "k1", "k2"]);
        assert_eq!(limiter.snapshot("k1")[0].calls_in_window, 0);
    }
}
