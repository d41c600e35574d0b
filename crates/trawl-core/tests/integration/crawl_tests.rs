use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use trawl_core::breaker::BreakerTier;
use trawl_core::config::{EngineConfig, WindowConfig};
use trawl_core::control::ControlHandle;
use trawl_core::events::EndReason;
use trawl_core::fetcher::{FetchPolicy, ResilientFetcher};
use trawl_core::models::{FetchOutcome, FetchRequest, SourceProfile};
use trawl_core::scheduler::TaskContext;
use trawl_core::testutil::{CountingHandler, MockListing, MockReply, MockTransport};
use trawl_core::traits::{ItemHandler, ListingItem, ListingSource};

use crate::common::{START, TestEngine};

fn page_url(page: u32) -> String {
    MockListing.page_url(START, page)
}

fn detail_url(item: &ListingItem) -> String {
    format!("{}/details", item.url)
}

/// Resolves every listing item against a detail page through the shared
/// fetcher, recording the outcomes.
struct DetailHandler {
    fetcher: ResilientFetcher<MockTransport>,
    policy: FetchPolicy,
    outcomes: Arc<Mutex<Vec<(FetchOutcome, Instant)>>>,
}

impl ItemHandler for DetailHandler {
    async fn handle(&self, item: ListingItem, ctx: TaskContext) {
        if ctx.should_stop() {
            return;
        }
        let outcome = self
            .fetcher
            .fetch(&FetchRequest::get(detail_url(&item)), &self.policy)
            .await;
        self.outcomes.lock().unwrap().push((outcome, Instant::now()));
    }
}

#[tokio::test(start_paused = true)]
async fn dead_detail_source_is_blocked_mid_crawl() {
    let mut config = EngineConfig::default();
    config.fetch_breaker.threshold = 3;
    config.retry.max_attempts = 1;
    let engine = TestEngine::new(config.clone());
    engine
        .transport
        .route(page_url(1), MockReply::ok(MockListing::page_body(0, 20)));
    for i in 0..20 {
        engine.transport.route(
            format!("https://site.example/title/{i}/details"),
            MockReply::status(503),
        );
    }

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(DetailHandler {
        fetcher: engine.fetcher().clone(),
        policy: FetchPolicy::for_api("details", &config.retry),
        outcomes: outcomes.clone(),
    });

    let report = engine
        .crawler
        .crawl(&SourceProfile::new("listing"), START, Some(1), &MockListing, handler)
        .await;
    assert_eq!(report.item_count, 20);

    let outcomes = outcomes.lock().unwrap();
    let failed = outcomes.iter().filter(|(o, _)| o.is_failure()).count();
    let blocked = outcomes
        .iter()
        .filter(|(o, _)| *o == FetchOutcome::Blocked)
        .count();
    assert_eq!(failed + blocked, 20);
    assert!(failed >= 3);
    assert!(blocked > 0);
    assert_eq!(engine.reporter.count("source_too_many_errors"), 1);

    // The listing source itself is unaffected.
    assert!(!engine.fetcher().breakers().is_blocked(BreakerTier::Fetch, "listing"));
}

#[tokio::test(start_paused = true)]
async fn detail_lookups_respect_credential_budget() {
    let mut config = EngineConfig::default();
    config.rate_limit.credentials.insert(
        "api-key".into(),
        vec![WindowConfig::per_second(1), WindowConfig::per_minute(60)],
    );
    let engine = TestEngine::new(config.clone());
    engine
        .transport
        .route(page_url(1), MockReply::ok(MockListing::page_body(0, 5)));
    for i in 0..5 {
        engine.transport.route(
            format!("https://site.example/title/{i}/details"),
            MockReply::ok("{}"),
        );
    }

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(DetailHandler {
        fetcher: engine.fetcher().clone(),
        policy: FetchPolicy::for_api("details", &config.retry).with_credential("api-key"),
        outcomes: outcomes.clone(),
    });

    let start = Instant::now();
    engine
        .crawler
        .crawl(&SourceProfile::new("listing"), START, Some(1), &MockListing, handler)
        .await;

    let mut finished: Vec<Instant> = outcomes
        .lock()
        .unwrap()
        .iter()
        .map(|(outcome, at)| {
            assert!(outcome.is_success());
            *at
        })
        .collect();
    finished.sort();
    assert_eq!(finished.len(), 5);
    for pair in finished.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(1));
    }
    assert!(start.elapsed() >= Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn pause_holds_the_walk_and_its_items() {
    let engine = TestEngine::default();
    engine
        .transport
        .route(page_url(1), MockReply::ok(MockListing::page_body(0, 6)));
    let handler = Arc::new(CountingHandler::new());

    engine.control.pause();
    let crawl = {
        let crawler = engine.crawler.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            crawler
                .crawl(&SourceProfile::new("listing"), START, Some(1), &MockListing, handler)
                .await
        })
    };

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(handler.count(), 0);
    assert_eq!(engine.transport.call_count(), 0);

    engine.control.resume();
    let report = crawl.await.unwrap();
    assert_eq!(report.end, EndReason::PageBudget);
    assert_eq!(handler.count(), 6);
}

/// Requests a stop while handling its first item.
struct StopAfterFirst {
    control: ControlHandle,
    handled: Arc<Mutex<Vec<String>>>,
}

impl ItemHandler for StopAfterFirst {
    async fn handle(&self, item: ListingItem, _ctx: TaskContext) {
        self.control.request_stop();
        self.handled.lock().unwrap().push(item.key);
    }
}

#[tokio::test(start_paused = true)]
async fn stop_from_handler_ends_crawl() {
    let engine = TestEngine::default();
    for page in 1..=3 {
        engine.transport.route(
            page_url(page),
            MockReply::ok(MockListing::page_body(page as usize * 10, 5)),
        );
    }
    let handled = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(StopAfterFirst {
        control: engine.control.clone(),
        handled: handled.clone(),
    });

    let profile = SourceProfile::new("listing").with_concurrency_hint(1);
    let report = engine
        .crawler
        .crawl(&profile, START, None, &MockListing, handler)
        .await;

    assert_eq!(report.end, EndReason::StopRequested);
    assert_eq!(report.item_count, 1);
    assert_eq!(report.last_page_reached, 1);
    assert_eq!(handled.lock().unwrap().len(), 1);
    assert_eq!(engine.transport.call_count(), 1);
    assert!(engine.reporter.names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn six_empty_pages_end_unbounded_crawl() {
    let engine = TestEngine::default();
    engine
        .transport
        .route(page_url(1), MockReply::ok(MockListing::page_body(0, 3)));
    for page in 2..=30 {
        engine.transport.route(page_url(page), MockReply::ok(""));
    }
    let handler = Arc::new(CountingHandler::new());

    let report = engine
        .crawler
        .crawl(&SourceProfile::new("listing"), START, None, &MockListing, handler.clone())
        .await;

    assert_eq!(report.end, EndReason::EmptyPageRun);
    assert_eq!(report.last_page_reached, 7);
    assert_eq!(report.pages.len(), 7);
    assert_eq!(handler.count(), 3);
    assert_eq!(engine.reporter.count("listing_ended"), 1);
}
