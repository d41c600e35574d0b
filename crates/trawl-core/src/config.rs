//! Engine configuration.
//!
//! Every tunable of the engine lives here and is supplied as one
//! [`EngineConfig`] object. It can be loaded from a JSON file (all fields
//! optional, missing ones take their defaults) and then overridden from
//! `TRAWL_*` environment variables:
//!
//! | variable                    | field                              |
//! |-----------------------------|------------------------------------|
//! | `TRAWL_CONCURRENCY`         | `scheduler.default_concurrency`    |
//! | `TRAWL_MAX_CONCURRENCY`     | `scheduler.max_concurrency`        |
//! | `TRAWL_FETCH_TIMEOUT_SECS`  | `retry.fetch_timeout_secs`         |
//! | `TRAWL_MAX_ATTEMPTS`        | `retry.max_attempts`               |
//! | `TRAWL_BREAKER_THRESHOLD`   | `fetch_breaker.threshold`          |
//! | `TRAWL_BREAKER_COOL_DOWN_SECS` | `fetch_breaker.cool_down_secs`  |
//! | `TRAWL_CACHE_MAX_ENTRIES`   | `cache.max_entries`                |
//! | `TRAWL_CACHE_TTL_SECS`      | `cache.ttl_secs`                   |

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub fetch_breaker: BreakerConfig,
    #[serde(default = "BreakerConfig::render_tier")]
    pub render_breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub crawl: CrawlConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            fetch_breaker: BreakerConfig::fetch_tier(),
            render_breaker: BreakerConfig::render_tier(),
            retry: RetryConfig::default(),
            scheduler: SchedulerConfig::default(),
            crawl: CrawlConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TRAWL_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self, AppError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply `TRAWL_*` overrides using `lookup` as the environment.
    pub fn apply_env_from<L>(mut self, lookup: L) -> Result<Self, AppError>
    where
        L: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "TRAWL_CONCURRENCY")? {
            self.scheduler.default_concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "TRAWL_MAX_CONCURRENCY")? {
            self.scheduler.max_concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "TRAWL_FETCH_TIMEOUT_SECS")? {
            self.retry.fetch_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "TRAWL_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "TRAWL_BREAKER_THRESHOLD")? {
            self.fetch_breaker.threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "TRAWL_BREAKER_COOL_DOWN_SECS")? {
            self.fetch_breaker.cool_down_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "TRAWL_CACHE_MAX_ENTRIES")? {
            self.cache.max_entries = v;
        }
        if let Some(v) = parse_var(&lookup, "TRAWL_CACHE_TTL_SECS")? {
            self.cache.ttl_secs = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        for (tier, breaker) in [
            ("fetch_breaker", &self.fetch_breaker),
            ("render_breaker", &self.render_breaker),
        ] {
            if breaker.threshold == 0 {
                return Err(AppError::ConfigError(format!(
                    "{tier}.threshold must be at least 1"
                )));
            }
        }
        if self.scheduler.default_concurrency == 0 || self.scheduler.max_concurrency == 0 {
            return Err(AppError::ConfigError(
                "scheduler concurrency must be at least 1".into(),
            ));
        }
        if self.scheduler.default_concurrency > self.scheduler.max_concurrency {
            return Err(AppError::ConfigError(format!(
                "scheduler.default_concurrency ({}) exceeds max_concurrency ({})",
                self.scheduler.default_concurrency, self.scheduler.max_concurrency
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::ConfigError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.hard_timeout_margin_ms == 0 {
            return Err(AppError::ConfigError(
                "retry.hard_timeout_margin_ms must be positive".into(),
            ));
        }
        if self.crawl.empty_page_run == 0 {
            return Err(AppError::ConfigError(
                "crawl.empty_page_run must be at least 1".into(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(AppError::ConfigError(
                "cache.max_entries must be at least 1".into(),
            ));
        }
        let credential_windows = self.rate_limit.credentials.values().flatten();
        for window in self.rate_limit.default_windows.iter().chain(credential_windows) {
            if window.limit == 0 || window.duration_ms == 0 {
                return Err(AppError::ConfigError(format!(
                    "rate window {window:?} must have a non-zero limit and duration"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.crawl.early_stop_fraction) {
            return Err(AppError::ConfigError(
                "crawl.early_stop_fraction must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<L, T>(lookup: &L, name: &str) -> Result<Option<T>, AppError>
where
    L: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            AppError::ConfigError(format!("Invalid {name} '{raw}': expected a number"))
        }),
    }
}

/// Response cache bounds and lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: u64,
    /// Aggregate body size bound. When set, it replaces the entry-count bound.
    pub max_bytes: Option<u64>,
    pub ttl_secs: u64,
    pub negative_ttl_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 5_000,
            max_bytes: None,
            ttl_secs: 6 * 60 * 60,
            negative_ttl_secs: 6 * 60 * 60,
        }
    }
}

/// One call window: at most `limit` calls per `duration_ms`. A lapsed window
/// restarts at the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub limit: u32,
    pub duration_ms: u64,
}

impl WindowConfig {
    pub fn per_second(limit: u32) -> Self {
        Self {
            limit,
            duration_ms: 1_000,
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            duration_ms: 60_000,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Call budgets per credential. Credentials without an entry use
/// `default_windows`; an empty window list means "unlimited".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub default_windows: Vec<WindowConfig>,
    pub credentials: HashMap<String, Vec<WindowConfig>>,
    /// When the wait for a slot would exceed this, the credential is treated
    /// as exhausted until its window rolls over and callers fail fast.
    /// `None` waits indefinitely.
    pub max_wait_ms: Option<u64>,
}

impl RateLimitConfig {
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_ms.map(Duration::from_millis)
    }

    pub fn windows_for(&self, credential: &str) -> &[WindowConfig] {
        self.credentials
            .get(credential)
            .map(Vec::as_slice)
            .unwrap_or(&self.default_windows)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_windows: vec![WindowConfig::per_second(1), WindowConfig::per_minute(60)],
            credentials: HashMap::new(),
            max_wait_ms: None,
        }
    }
}

/// Thresholds of one breaker tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within the grace window needed to block a source.
    pub threshold: u32,
    /// A failure older than this restarts the count at 1.
    pub grace_window_secs: u64,
    /// How long after the last failure a blocked source is released.
    pub cool_down_secs: u64,
}

impl BreakerConfig {
    /// Fast fetch-blacklist tier for generic page fetches.
    pub fn fetch_tier() -> Self {
        Self {
            threshold: 15,
            grace_window_secs: 5 * 60,
            cool_down_secs: 10 * 60,
        }
    }

    /// Slow tier for heavier render/fallback fetch paths.
    pub fn render_tier() -> Self {
        Self {
            threshold: 15,
            grace_window_secs: 5 * 60,
            cool_down_secs: 3 * 60 * 60,
        }
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.grace_window_secs)
    }

    pub fn cool_down(&self) -> Duration {
        Duration::from_secs(self.cool_down_secs)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::fetch_tier()
    }
}

/// Retry and timeout policy of the resilient fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts for transient server/network failures, first one included.
    pub max_attempts: u32,
    /// Backoff before retry `n` is `n * backoff_base_ms`.
    pub backoff_base_ms: u64,
    /// Retries after HTTP 429 before giving up.
    pub rate_limit_retries: u32,
    pub rate_limit_sleep_ms: u64,
    pub fetch_timeout_secs: u64,
    /// The watchdog fires this long after the soft timeout.
    pub hard_timeout_margin_ms: u64,
}

impl RetryConfig {
    pub fn backoff_for(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms.saturating_mul(u64::from(retry)))
    }

    pub fn rate_limit_sleep(&self) -> Duration {
        Duration::from_millis(self.rate_limit_sleep_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn hard_timeout_margin(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_margin_ms.max(1))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            rate_limit_retries: 3,
            rate_limit_sleep_ms: 5_000,
            fetch_timeout_secs: 10,
            hard_timeout_margin_ms: 5_000,
        }
    }
}

/// Concurrency limits of crawl sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub default_concurrency: usize,
    pub max_concurrency: usize,
    /// Added to the session concurrency when the host is otherwise idle.
    pub idle_boost: usize,
    /// Ceiling for sources that need the render transport.
    pub render_concurrency: usize,
    /// Undispatched tasks a producer may queue before `submit` blocks.
    pub queue_depth: usize,
    /// Poll interval for load controllers without change notification.
    pub pause_poll_ms: u64,
    /// Operator overrides by source name.
    pub per_source: HashMap<String, usize>,
}

impl SchedulerConfig {
    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 9,
            max_concurrency: 14,
            idle_boost: 5,
            render_concurrency: 3,
            queue_depth: 64,
            pause_poll_ms: 500,
            per_source: HashMap::new(),
        }
    }
}

/// End-of-listing detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Consecutive pages without new items that end a crawl.
    pub empty_page_run: usize,
    /// Ending before this fraction of `max_pages` (without a not-found
    /// marker) is reported as an unexpectedly early stop.
    pub early_stop_fraction: f64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            empty_page_run: 6,
            early_stop_fraction: 0.5,
        }
    }
}
