use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::models::{ErrorClass, FetchRequest, Fetched, RawResponse, TransportError};
use crate::scheduler::TaskContext;
use crate::util::url_reflects_page;

/// Performs exactly one outbound attempt. Retries, breakers, budgets and
/// caching are layered on top by the resilient fetcher.
pub trait Transport: Send + Sync + Clone {
    /// `timeout` is the soft per-attempt timeout the transport should enforce
    /// itself; a watchdog above it catches transports that hang anyway.
    fn send(
        &self,
        request: &FetchRequest,
        timeout: Duration,
    ) -> impl Future<Output = Result<RawResponse, TransportError>> + Send;
}

/// An alternate resolution path (e.g. a cached third-party mirror) tried once
/// after the primary source failed or is blocked.
pub trait FallbackResolver: Send + Sync {
    /// Breaker key the fallback path is charged to.
    fn name(&self) -> &str;

    fn resolve<'a>(
        &'a self,
        request: &'a FetchRequest,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RawResponse, TransportError>>;
}

/// How one raw response maps onto the shared outcome taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    /// 404 or a provider-specific "no match" payload.
    NotFound,
    /// 429 or a provider-specific "slow down" payload.
    RateLimited,
    /// Retried with incremental backoff.
    Transient(ErrorClass),
    /// The credential's quota is spent; fail fast until `retry_after`.
    CredentialExhausted { retry_after: Duration },
    Permanent(ErrorClass),
}

/// Per-integration response sniffing.
///
/// Third-party sources report "not found" and real errors in heterogeneous
/// shapes; each integration maps its shapes onto [`Classification`].
pub trait ResponseClassifier: Send + Sync {
    fn classify(&self, response: &RawResponse) -> Classification {
        classify_status(response.status)
    }
}

/// Status-code-only classification shared by all integrations.
pub fn classify_status(status: u16) -> Classification {
    match status {
        200..=299 => Classification::Success,
        404 | 410 => Classification::NotFound,
        429 => Classification::RateLimited,
        s if ErrorClass::is_transient_status(s) => Classification::Transient(ErrorClass::ServerError(s)),
        400 => Classification::Permanent(ErrorClass::MalformedUrl),
        400..=499 => Classification::Permanent(ErrorClass::ClientError(status)),
        _ => Classification::Permanent(ErrorClass::Unclassified),
    }
}

/// Classifier that looks at the status code only.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusClassifier;

impl ResponseClassifier for StatusClassifier {}

/// One entry discovered on a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingItem {
    /// De-duplication key across the crawl, usually the item link.
    pub key: String,
    pub title: String,
    pub url: String,
}

impl ListingItem {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            key: url.clone(),
            title: title.into(),
            url,
        }
    }
}

/// Items found on one listing page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub items: Vec<ListingItem>,
    /// The page title/body carries an explicit "page not found" marker.
    pub not_found: bool,
}

/// Site-specific pagination and extraction rules for one listing source.
pub trait ListingSource: Send + Sync {
    /// URL of page `page` (1-based) of the listing starting at `start_url`.
    fn page_url(&self, start_url: &str, page: u32) -> String;

    fn parse_page(&self, fetched: &Fetched) -> ListingPage;

    /// Whether the URL a page request ended at still points at `page`.
    /// Sources that redirect past-the-end pages to page 1 fail this check.
    ///
    /// The default looks for `page={page}` or a `/page/{page}` path.
    fn reflects_page(&self, final_url: &str, page: u32) -> bool {
        url_reflects_page(final_url, "page", page)
    }
}

/// Processes one discovered listing item as a scheduler task.
pub trait ItemHandler: Send + Sync + 'static {
    fn handle(&self, item: ListingItem, ctx: TaskContext) -> impl Future<Output = ()> + Send;
}
