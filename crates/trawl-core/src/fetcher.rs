//! The resilient fetch primitive every scraper and metadata client builds on.
//!
//! One call to [`ResilientFetcher::fetch`] runs the whole failure policy:
//! breaker check, cache lookup, rate slot, the transport attempt under a
//! hard-timeout watchdog, classification and retry, breaker accounting and
//! finally the optional fallback path. Whatever happens, the caller receives
//! one of the [`FetchOutcome`] variants and never a transport error.
//!
//! # Retry taxonomy
//!
//! | class | handling |
//! |-------|----------|
//! | 429 / rate-limited | fixed sleep, up to `rate_limit_retries`; breaker charged only when exhausted |
//! | 502-504, 520-525, connection, DNS, soft timeout | backoff `base * n`, up to `max_attempts` |
//! | malformed URL | re-encode the last path segment once, then permanent |
//! | hard timeout | terminal for this call |
//! | credential exhausted | mark the credential, fail fast, no breaker charge |
//! | anything else | permanent, logged with full context |
//!
//! A classifier's `Transient`/`Permanent` verdict overrides the defaults for
//! the class it carries.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::{BreakerRegistry, BreakerTier};
use crate::cache::{CacheLookup, ResponseCache};
use crate::config::{EngineConfig, RetryConfig};
use crate::events::{EngineEvent, EngineReporter};
use crate::models::{ErrorClass, FetchOrigin, FetchOutcome, FetchRequest, Fetched, RawResponse, SourceProfile};
use crate::rate_limit::RateLimiter;
use crate::traits::{Classification, FallbackResolver, ResponseClassifier, StatusClassifier, Transport};
use crate::util::{append_query_param, cache_key, encode_last_path_segment};

/// Which cache entries a fetch reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Listing pages change; never cached.
    Disabled,
    /// Only confirmed not-found results are cached.
    NegativeOnly,
    /// Positive and negative results are cached (metadata-API calls).
    Full,
}

/// Per-call failure policy and the keys the call is charged to.
#[derive(Clone)]
pub struct FetchPolicy {
    /// Breaker key.
    pub source: String,
    pub tier: BreakerTier,
    /// Rate-budget key, if the call spends a credential.
    pub credential: Option<String>,
    /// Soft per-attempt timeout handed to the transport.
    pub timeout: Duration,
    /// Attempts for transient failures, the first one included.
    pub max_attempts: u32,
    pub allow_reencode: bool,
    pub allow_cache_fallback: bool,
    pub cache_mode: CacheMode,
    pub classifier: Arc<dyn ResponseClassifier>,
}

impl FetchPolicy {
    /// Policy for listing-page fetches of `profile`. Never cached; charged to
    /// the render tier when the source needs the render transport.
    pub fn for_source(profile: &SourceProfile, retry: &RetryConfig) -> Self {
        Self {
            source: profile.name.clone(),
            tier: if profile.needs_render {
                BreakerTier::Render
            } else {
                BreakerTier::Fetch
            },
            credential: None,
            timeout: profile.timeout,
            max_attempts: retry.max_attempts,
            allow_reencode: true,
            allow_cache_fallback: profile.allow_cache_fallback,
            cache_mode: CacheMode::Disabled,
            classifier: Arc::new(StatusClassifier),
        }
    }

    /// Policy for metadata-API calls: fully cached, no fallback.
    pub fn for_api(provider: impl Into<String>, retry: &RetryConfig) -> Self {
        Self {
            source: provider.into(),
            tier: BreakerTier::Fetch,
            credential: None,
            timeout: retry.fetch_timeout(),
            max_attempts: retry.max_attempts,
            allow_reencode: true,
            allow_cache_fallback: false,
            cache_mode: CacheMode::Full,
            classifier: Arc::new(StatusClassifier),
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ResponseClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_cache_fallback(mut self, allowed: bool) -> Self {
        self.allow_cache_fallback = allowed;
        self
    }

    pub fn without_reencode(mut self) -> Self {
        self.allow_reencode = false;
        self
    }
}

impl std::fmt::Debug for FetchPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchPolicy")
            .field("source", &self.source)
            .field("tier", &self.tier)
            .field("credential", &self.credential)
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .field("allow_reencode", &self.allow_reencode)
            .field("allow_cache_fallback", &self.allow_cache_fallback)
            .field("cache_mode", &self.cache_mode)
            .finish_non_exhaustive()
    }
}

/// A failed call, before breaker accounting.
struct Terminal {
    class: ErrorClass,
    transient: bool,
    charge_breaker: bool,
}

impl Terminal {
    fn charged(class: ErrorClass, transient: bool) -> Self {
        Self {
            class,
            transient,
            charge_breaker: true,
        }
    }

    fn credential_exhausted() -> Self {
        Self {
            class: ErrorClass::CredentialExhausted,
            transient: false,
            charge_breaker: false,
        }
    }
}

/// Wraps a [`Transport`] with the engine's shared breaker, budget and cache
/// state.
///
/// Clones share that state; build one per transport and hand clones out.
#[derive(Clone)]
pub struct ResilientFetcher<T: Transport> {
    transport: T,
    cache: ResponseCache,
    breakers: BreakerRegistry,
    limiter: RateLimiter,
    fallback: Option<Arc<dyn FallbackResolver>>,
    reporter: Arc<dyn EngineReporter>,
    retry: RetryConfig,
}

impl<T: Transport> ResilientFetcher<T> {
    /// Builds fresh cache, breaker and rate-limit state from `config`.
    pub fn new(transport: T, config: &EngineConfig, reporter: Arc<dyn EngineReporter>) -> Self {
        Self {
            transport,
            cache: ResponseCache::new(config.cache.clone()),
            breakers: BreakerRegistry::new(config, reporter.clone()),
            limiter: RateLimiter::new(config.rate_limit.clone(), reporter.clone()),
            fallback: None,
            reporter,
            retry: config.retry.clone(),
        }
    }

    /// A fetcher over another transport that shares this one's state, e.g.
    /// a render transport next to the plain HTTP one.
    pub fn with_transport<U: Transport>(&self, transport: U) -> ResilientFetcher<U> {
        ResilientFetcher {
            transport,
            cache: self.cache.clone(),
            breakers: self.breakers.clone(),
            limiter: self.limiter.clone(),
            fallback: self.fallback.clone(),
            reporter: self.reporter.clone(),
            retry: self.retry.clone(),
        }
    }

    /// Installs the alternate resolution path used by policies that allow it.
    pub fn with_fallback(mut self, resolver: Arc<dyn FallbackResolver>) -> Self {
        self.fallback = Some(resolver);
        self
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn fetch(&self, request: &FetchRequest, policy: &FetchPolicy) -> FetchOutcome {
        let fallback = if policy.allow_cache_fallback {
            self.fallback.as_deref()
        } else {
            None
        };
        let breaker = self.breakers.tier(policy.tier);

        if breaker.is_blocked(&policy.source) {
            return match fallback {
                Some(resolver) => {
                    tracing::debug!(
                        source = %policy.source,
                        url = %request.url,
                        "Source blocked, using fallback path"
                    );
                    self.try_fallback(resolver, request, policy).await
                }
                None => {
                    tracing::debug!(source = %policy.source, url = %request.url, "Source blocked, skipping");
                    FetchOutcome::Blocked
                }
            };
        }

        let key = cache_key(&request.url);
        if policy.cache_mode != CacheMode::Disabled {
            match self.cache.get(&key).await {
                CacheLookup::Hit { body, final_url } if policy.cache_mode == CacheMode::Full => {
                    tracing::trace!(%key, "Cache hit");
                    return FetchOutcome::Success(Fetched {
                        body,
                        final_url,
                        origin: FetchOrigin::Cache,
                    });
                }
                CacheLookup::Negative => {
                    tracing::trace!(%key, "Negative cache hit");
                    return FetchOutcome::NotFound;
                }
                _ => {}
            }
        }

        match self.attempt(request, policy, &key).await {
            Ok(outcome) => outcome,
            Err(terminal) => {
                if terminal.charge_breaker {
                    breaker.record_failure(&policy.source);
                }
                if terminal.class != ErrorClass::CredentialExhausted
                    && let Some(resolver) = fallback
                {
                    return self.try_fallback(resolver, request, policy).await;
                }
                FetchOutcome::failure(terminal.class, terminal.transient)
            }
        }
    }

    /// The retry loop. `Ok` carries the outcomes that are not source failures.
    async fn attempt(
        &self,
        request: &FetchRequest,
        policy: &FetchPolicy,
        key: &str,
    ) -> Result<FetchOutcome, Terminal> {
        let breaker = self.breakers.tier(policy.tier);
        let mut request = request.clone();
        let mut failures = 0u32;
        let mut rate_limited = 0u32;
        let mut reencoded = false;

        loop {
            if let Some(credential) = &policy.credential
                && let Err(e) = self.limiter.acquire(credential).await
            {
                tracing::warn!(
                    source = %policy.source,
                    %credential,
                    error = %e,
                    "No rate slot, failing fast"
                );
                return Err(Terminal::credential_exhausted());
            }

            let sent = {
                let wire = match (&request.credential_param, &policy.credential) {
                    (Some(param), Some(credential)) => Cow::Owned(
                        request.with_url(append_query_param(&request.url, param, credential)),
                    ),
                    _ => Cow::Borrowed(&request),
                };
                self.send_once(&wire, &request.url, policy).await
            };
            // The classifier's verdict decides retry, not the class's default.
            let (class, transient, status) = match sent {
                Ok(response) => match policy.classifier.classify(&response) {
                    Classification::Success => {
                        breaker.record_success(&policy.source);
                        if policy.cache_mode == CacheMode::Full {
                            self.cache
                                .set(
                                    key,
                                    response.body.clone(),
                                    response.final_url.clone(),
                                    self.cache.config().ttl(),
                                )
                                .await;
                        }
                        return Ok(FetchOutcome::Success(Fetched {
                            body: response.body,
                            final_url: response.final_url,
                            origin: FetchOrigin::Network,
                        }));
                    }
                    Classification::NotFound => {
                        breaker.record_success(&policy.source);
                        if policy.cache_mode != CacheMode::Disabled {
                            self.cache
                                .set_negative(key, self.cache.config().negative_ttl())
                                .await;
                        }
                        return Ok(FetchOutcome::NotFound);
                    }
                    Classification::CredentialExhausted { retry_after } => {
                        if let Some(credential) = &policy.credential {
                            self.limiter.mark_exhausted(credential, retry_after);
                        }
                        return Err(Terminal::credential_exhausted());
                    }
                    Classification::RateLimited => (ErrorClass::RateLimited, true, Some(response.status)),
                    Classification::Transient(class) => (class, true, Some(response.status)),
                    Classification::Permanent(class) => (class, false, Some(response.status)),
                },
                Err(class) => (class, class.is_transient(), None),
            };

            match class {
                ErrorClass::RateLimited => {
                    if rate_limited < self.retry.rate_limit_retries {
                        rate_limited += 1;
                        tracing::debug!(
                            source = %policy.source,
                            url = %request.url,
                            retry = rate_limited,
                            "Rate limited, sleeping before retry"
                        );
                        tokio::time::sleep(self.retry.rate_limit_sleep()).await;
                        continue;
                    }
                    self.reporter.report(EngineEvent::SourceRateLimitExhausted {
                        source: &policy.source,
                        url: &request.url,
                        attempts: rate_limited + 1,
                    });
                    return Err(Terminal::charged(class, true));
                }
                ErrorClass::HardTimeout => {
                    tracing::warn!(
                        source = %policy.source,
                        url = %request.url,
                        timeout_ms = %policy.timeout.as_millis(),
                        "Hard timeout watchdog fired"
                    );
                    return Err(Terminal::charged(class, true));
                }
                ErrorClass::MalformedUrl if !transient => {
                    if policy.allow_reencode
                        && !reencoded
                        && let Some(encoded) = encode_last_path_segment(&request.url)
                    {
                        tracing::debug!(
                            source = %policy.source,
                            url = %request.url,
                            %encoded,
                            "Retrying with re-encoded path segment"
                        );
                        reencoded = true;
                        request = request.with_url(encoded);
                        continue;
                    }
                    tracing::warn!(source = %policy.source, url = %request.url, "Malformed request");
                    return Err(Terminal::charged(class, false));
                }
                class if transient => {
                    failures += 1;
                    if failures < policy.max_attempts {
                        let backoff = self.retry.backoff_for(failures);
                        tracing::debug!(
                            source = %policy.source,
                            url = %request.url,
                            error = %class,
                            attempt = failures,
                            backoff_ms = %backoff.as_millis(),
                            "Transient failure, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    tracing::warn!(
                        source = %policy.source,
                        url = %request.url,
                        error = %class,
                        attempts = failures,
                        "Transient failure persisted after retries"
                    );
                    return Err(Terminal::charged(class, true));
                }
                class => {
                    tracing::warn!(
                        source = %policy.source,
                        url = %request.url,
                        credential = ?policy.credential,
                        status = ?status,
                        error = %class,
                        "Unexpected fetch failure"
                    );
                    return Err(Terminal::charged(class, false));
                }
            }
        }
    }

    /// One transport attempt under the hard-timeout watchdog. `url` is the
    /// request URL without any injected credential, for logging.
    async fn send_once(
        &self,
        request: &FetchRequest,
        url: &str,
        policy: &FetchPolicy,
    ) -> Result<RawResponse, ErrorClass> {
        let watchdog = policy.timeout + self.retry.hard_timeout_margin();
        match tokio::time::timeout(watchdog, self.transport.send(request, policy.timeout)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                tracing::debug!(%url, error = %e, "Transport error");
                Err(ErrorClass::from(&e))
            }
            Err(_) => Err(ErrorClass::HardTimeout),
        }
    }

    /// Tries the fallback path once, charged to the render tier under the
    /// resolver's name.
    async fn try_fallback(
        &self,
        resolver: &dyn FallbackResolver,
        request: &FetchRequest,
        policy: &FetchPolicy,
    ) -> FetchOutcome {
        let breaker = self.breakers.tier(BreakerTier::Render);
        let name = resolver.name();
        if breaker.is_blocked(name) {
            tracing::debug!(fallback = %name, "Fallback path blocked");
            return FetchOutcome::Blocked;
        }

        let watchdog = policy.timeout + self.retry.hard_timeout_margin();
        let (class, transient) = match tokio::time::timeout(watchdog, resolver.resolve(request, policy.timeout)).await {
            Ok(Ok(response)) => match policy.classifier.classify(&response) {
                Classification::Success => {
                    breaker.record_success(name);
                    return FetchOutcome::Success(Fetched {
                        body: response.body,
                        final_url: response.final_url,
                        origin: FetchOrigin::Fallback,
                    });
                }
                Classification::NotFound => {
                    breaker.record_success(name);
                    return FetchOutcome::NotFound;
                }
                Classification::RateLimited => (ErrorClass::RateLimited, true),
                Classification::CredentialExhausted { .. } => (ErrorClass::CredentialExhausted, false),
                Classification::Transient(class) => (class, true),
                Classification::Permanent(class) => (class, false),
            },
            Ok(Err(e)) => {
                let class = ErrorClass::from(&e);
                (class, class.is_transient())
            }
            Err(_) => (ErrorClass::HardTimeout, true),
        };

        tracing::info!(
            source = %policy.source,
            fallback = %name,
            url = %request.url,
            error = %class,
            "Fallback path failed"
        );
        breaker.record_failure(name);
        FetchOutcome::failure(class, transient)
    }
}
