//! Test utilities: mock implementations of the engine's collaborator traits.
//!
//! Handwritten mocks for dependency injection in unit and integration tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::events::{EngineEvent, EngineReporter};
use crate::models::{FetchRequest, Fetched, RawResponse, TransportError};
use crate::scheduler::TaskContext;
use crate::traits::{FallbackResolver, ItemHandler, ListingItem, ListingPage, ListingSource, Transport};

// ---------------------------------------------------------------------------
// MockReply
// ---------------------------------------------------------------------------

/// One scripted transport reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// `final_url: None` answers with the request URL.
    Respond {
        status: u16,
        body: String,
        final_url: Option<String>,
    },
    Fail(TransportError),
    /// Respond after a delay.
    Delayed(Duration, Box<MockReply>),
    /// Never resolves; only the hard-timeout watchdog ends the call.
    Hang,
}

impl MockReply {
    pub fn ok(body: impl Into<String>) -> Self {
        MockReply::Respond {
            status: 200,
            body: body.into(),
            final_url: None,
        }
    }

    pub fn status(status: u16) -> Self {
        MockReply::Respond {
            status,
            body: String::new(),
            final_url: None,
        }
    }

    /// A 200 served from another URL after redirects.
    pub fn redirected(body: impl Into<String>, final_url: impl Into<String>) -> Self {
        MockReply::Respond {
            status: 200,
            body: body.into(),
            final_url: Some(final_url.into()),
        }
    }

    async fn play(self, url: &str) -> Result<RawResponse, TransportError> {
        let mut reply = self;
        loop {
            match reply {
                MockReply::Respond {
                    status,
                    body,
                    final_url,
                } => {
                    return Ok(RawResponse::new(
                        status,
                        body,
                        final_url.unwrap_or_else(|| url.to_string()),
                    ));
                }
                MockReply::Fail(e) => return Err(e),
                MockReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                MockReply::Hang => {
                    std::future::pending::<()>().await;
                    return Err(TransportError::Timeout);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// Transport answering from a script queue, then per-URL routes, then 404.
#[derive(Clone, Default)]
pub struct MockTransport {
    script: Arc<Mutex<VecDeque<MockReply>>>,
    routes: Arc<Mutex<HashMap<String, MockReply>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply for the next call, whatever its URL.
    pub fn push(&self, reply: MockReply) {
        self.script.lock().unwrap().push_back(reply);
    }

    /// Answers every call to `url` with `reply` once the script is drained.
    pub fn route(&self, url: impl Into<String>, reply: MockReply) {
        self.routes.lock().unwrap().insert(url.into(), reply);
    }

    /// URLs of all calls so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_reply(&self, url: &str) -> MockReply {
        self.calls.lock().unwrap().push(url.to_string());
        if let Some(reply) = self.script.lock().unwrap().pop_front() {
            return reply;
        }
        self.routes
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| MockReply::status(404))
    }
}

impl Transport for MockTransport {
    async fn send(
        &self,
        request: &FetchRequest,
        _timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        let reply = self.next_reply(&request.url);
        reply.play(&request.url).await
    }
}

// ---------------------------------------------------------------------------
// MockFallback
// ---------------------------------------------------------------------------

/// Fallback resolver answering every call with the same reply.
pub struct MockFallback {
    name: String,
    reply: MockReply,
    calls: AtomicUsize,
}

impl MockFallback {
    pub fn new(name: impl Into<String>, reply: MockReply) -> Self {
        Self {
            name: name.into(),
            reply,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FallbackResolver for MockFallback {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve<'a>(
        &'a self,
        request: &'a FetchRequest,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<RawResponse, TransportError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(self.reply.clone().play(&request.url))
    }
}

// ---------------------------------------------------------------------------
// MockListing
// ---------------------------------------------------------------------------

/// Listing source over a line-based synthetic page format.
///
/// Each non-empty body line is `title|url`; a line reading `NOT FOUND` marks
/// the page as a not-found page. Page `n > 1` lives at `{start}?page={n}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockListing;

impl MockListing {
    /// Builds a page body with `count` items numbered from `first`.
    pub fn page_body(first: usize, count: usize) -> String {
        (first..first + count)
            .map(|i| format!("Title {i}|https://site.example/title/{i}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl ListingSource for MockListing {
    fn page_url(&self, start_url: &str, page: u32) -> String {
        if page <= 1 {
            start_url.to_string()
        } else {
            format!("{start_url}?page={page}")
        }
    }

    fn parse_page(&self, fetched: &Fetched) -> ListingPage {
        let mut page = ListingPage::default();
        for line in fetched.body.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if line == "NOT FOUND" {
                page.not_found = true;
                continue;
            }
            if let Some((title, url)) = line.split_once('|') {
                page.items.push(ListingItem::new(title, url));
            }
        }
        page
    }

    fn reflects_page(&self, final_url: &str, page: u32) -> bool {
        final_url.ends_with(&format!("page={page}"))
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Reporter that records the name and debug rendering of every event.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded events named `name` (see [`EngineEvent::name`]).
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .count()
    }

    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Debug renderings of all recorded events.
    pub fn details(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, d)| d.clone())
            .collect()
    }
}

impl EngineReporter for RecordingReporter {
    fn report(&self, event: EngineEvent<'_>) {
        self.events
            .lock()
            .unwrap()
            .push((event.name().to_string(), format!("{event:?}")));
    }
}

// ---------------------------------------------------------------------------
// CountingHandler
// ---------------------------------------------------------------------------

/// Item handler that records handled keys and peak concurrency.
#[derive(Clone, Default)]
pub struct CountingHandler {
    handled: Arc<Mutex<Vec<String>>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    delay: Duration,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each item takes `delay` to handle.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn handled(&self) -> Vec<String> {
        self.handled.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.handled.lock().unwrap().len()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl ItemHandler for CountingHandler {
    async fn handle(&self, item: ListingItem, _ctx: TaskContext) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.handled.lock().unwrap().push(item.key);
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}
