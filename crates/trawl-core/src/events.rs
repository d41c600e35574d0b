//! Operator-warning events.
//!
//! The breaker, the fetcher and the crawl driver never raise on a degraded
//! source; they report here instead so a dead or rate-limited source only
//! costs visibility.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::breaker::BreakerTier;

/// Events emitted by the engine for monitoring/logging.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent<'a> {
    /// A source crossed its breaker threshold and is now blocked.
    SourceTooManyErrors {
        source: &'a str,
        tier: BreakerTier,
        error_count: u32,
        cool_down: Duration,
    },
    /// A blocked source was released after its cool-down.
    SourceUnblocked { source: &'a str, tier: BreakerTier },
    /// A source kept answering 429 after every rate-limit retry.
    SourceRateLimitExhausted {
        source: &'a str,
        url: &'a str,
        attempts: u32,
    },
    /// A crawl ended well before its page budget without a not-found marker.
    SourceLikelyEndedEarly {
        source: &'a str,
        last_page: u32,
        max_pages: u32,
        reason: EndReason,
    },
    /// A crawl ended at what looks like the true end of the listing.
    ListingEnded {
        source: &'a str,
        last_page: u32,
        reason: EndReason,
    },
    /// Every budget of a credential is consumed; calls fail fast until `retry_after`.
    CredentialExhausted {
        credential: &'a str,
        retry_after: Duration,
    },
}

impl EngineEvent<'_> {
    /// Stable event name for sinks that key on it.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::SourceTooManyErrors { .. } => "source_too_many_errors",
            EngineEvent::SourceUnblocked { .. } => "source_unblocked",
            EngineEvent::SourceRateLimitExhausted { .. } => "source_rate_limit_exhausted",
            EngineEvent::SourceLikelyEndedEarly { .. } => "source_likely_ended_early",
            EngineEvent::ListingEnded { .. } => "listing_ended",
            EngineEvent::CredentialExhausted { .. } => "credential_exhausted",
        }
    }
}

/// Why a paginated crawl stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The page budget was used up.
    PageBudget,
    /// Page title/body carried an explicit "page not found" marker, or the
    /// page fetch resolved to not-found.
    NotFoundMarker,
    /// No items on a page served by the fallback path.
    EmptyFallbackPage,
    /// The final URL did not reflect the requested page number.
    RedirectedAway,
    /// Several consecutive pages yielded no new items.
    EmptyPageRun,
    /// The listing page itself could not be fetched.
    FetchFailed,
    /// The source is blocked by its breaker.
    SourceBlocked,
    /// The load controller requested a stop.
    StopRequested,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndReason::PageBudget => "page budget reached",
            EndReason::NotFoundMarker => "not-found marker",
            EndReason::EmptyFallbackPage => "empty fallback page",
            EndReason::RedirectedAway => "final url does not match requested page",
            EndReason::EmptyPageRun => "consecutive empty pages",
            EndReason::FetchFailed => "listing fetch failed",
            EndReason::SourceBlocked => "source blocked",
            EndReason::StopRequested => "stop requested",
        };
        write!(f, "{s}")
    }
}

/// Trait for receiving engine events (decoupled logging).
pub trait EngineReporter: Send + Sync {
    fn report(&self, event: EngineEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl EngineReporter for TracingReporter {
    fn report(&self, event: EngineEvent<'_>) {
        match event {
            EngineEvent::SourceTooManyErrors {
                source,
                tier,
                error_count,
                cool_down,
            } => {
                tracing::warn!(
                    %source,
                    %tier,
                    error_count,
                    cool_down_secs = cool_down.as_secs(),
                    "Source blocked after too many errors"
                );
            }
            EngineEvent::SourceUnblocked { source, tier } => {
                tracing::info!(%source, %tier, "Source released after cool-down");
            }
            EngineEvent::SourceRateLimitExhausted {
                source,
                url,
                attempts,
            } => {
                tracing::warn!(%source, %url, attempts, "Rate limit retries exhausted");
            }
            EngineEvent::SourceLikelyEndedEarly {
                source,
                last_page,
                max_pages,
                reason,
            } => {
                tracing::warn!(
                    %source,
                    last_page,
                    max_pages,
                    %reason,
                    "Crawl stopped unexpectedly early"
                );
            }
            EngineEvent::ListingEnded {
                source,
                last_page,
                reason,
            } => {
                tracing::info!(%source, last_page, %reason, "Likely reached end of listing");
            }
            EngineEvent::CredentialExhausted {
                credential,
                retry_after,
            } => {
                tracing::warn!(
                    %credential,
                    retry_after_secs = retry_after.as_secs(),
                    "Credential exhausted"
                );
            }
        }
    }
}

/// Reporter that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl EngineReporter for NullReporter {}
