//! Paginated crawl driver.
//!
//! Walks a listing page by page through the [`ResilientFetcher`] and feeds
//! every newly discovered item into a scheduler session. Pagination is
//! strictly sequential: page N+1 is fetched only after every item of page N
//! has been dispatched (not necessarily completed).
//!
//! The walk ends at the first of several independent end-of-listing signals:
//!
//! - the page resolves to not-found, or carries a not-found marker
//! - a page served by the fallback path yields no items
//! - the final URL of page N > 1 does not reflect N (the source redirected
//!   a past-the-end page back to the start)
//! - a trailing run of `empty_page_run` pages yields no new items
//!
//! Fetch failures, a blocked source, the page budget and stop requests end
//! the walk as well.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::CrawlConfig;
use crate::events::{EndReason, EngineEvent, EngineReporter};
use crate::fetcher::{FetchPolicy, ResilientFetcher};
use crate::models::{FetchOrigin, FetchOutcome, FetchRequest, SourceProfile};
use crate::scheduler::{CrawlTask, RunSummary, Scheduler};
use crate::traits::{ItemHandler, ListingSource, Transport};

/// Summary of one crawl session.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlReport {
    pub session_id: Uuid,
    pub source: String,
    /// Last listing page that was fetched and processed (0 if none).
    pub last_page_reached: u32,
    /// Distinct items dispatched to the handler.
    pub item_count: usize,
    /// New items found on each processed page, in page order.
    pub pages: Vec<usize>,
    pub end: EndReason,
    pub run: RunSummary,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Drives paginated crawls over a shared fetcher and scheduler.
#[derive(Clone)]
pub struct Crawler<T: Transport> {
    fetcher: ResilientFetcher<T>,
    scheduler: Scheduler,
    config: CrawlConfig,
    reporter: Arc<dyn EngineReporter>,
    /// Sources that already got their end-of-crawl warning.
    warned: Arc<Mutex<HashSet<String>>>,
}

impl<T: Transport> Crawler<T> {
    pub fn new(
        fetcher: ResilientFetcher<T>,
        scheduler: Scheduler,
        config: CrawlConfig,
        reporter: Arc<dyn EngineReporter>,
    ) -> Self {
        Self {
            fetcher,
            scheduler,
            config,
            reporter,
            warned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn fetcher(&self) -> &ResilientFetcher<T> {
        &self.fetcher
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Crawls the listing at `start_url` for up to `max_pages` pages
    /// (unbounded when `None`), handing every new item to `handler`.
    pub async fn crawl<L, H>(
        &self,
        profile: &SourceProfile,
        start_url: &str,
        max_pages: Option<u32>,
        source: &L,
        handler: Arc<H>,
    ) -> CrawlReport
    where
        L: ListingSource + ?Sized,
        H: ItemHandler,
    {
        let session_id = Uuid::new_v4();
        let started_at = Utc::now();
        let concurrency = self.scheduler.session_concurrency(profile);
        tracing::info!(
            source = %profile.name,
            %session_id,
            start_url,
            max_pages = ?max_pages,
            concurrency,
            "Crawl started"
        );

        let policy = FetchPolicy::for_source(profile, self.fetcher.retry_config());
        let controller = self.scheduler.controller().clone();
        let pause_poll = self.scheduler.config().pause_poll();
        let mut session = self.scheduler.session(concurrency);
        let mut seen: HashSet<String> = HashSet::new();
        let mut pages: Vec<usize> = Vec::new();
        let mut last_page = 0u32;
        let mut empty_run = 0usize;
        let mut item_count = 0usize;

        let end = 'pages: loop {
            if let Some(max) = max_pages
                && last_page >= max
            {
                break EndReason::PageBudget;
            }
            if controller.is_pause_requested() {
                tracing::debug!(source = %profile.name, page = last_page + 1, "Crawl paused by load controller");
                controller.wait_while_paused(pause_poll).await;
            }
            if controller.is_stop_requested() {
                break EndReason::StopRequested;
            }

            let page = last_page + 1;
            let url = source.page_url(start_url, page);
            let request = FetchRequest::get(url).with_headers(&profile.headers);
            let fetched = match self.fetcher.fetch(&request, &policy).await {
                FetchOutcome::Success(fetched) => fetched,
                FetchOutcome::NotFound => break EndReason::NotFoundMarker,
                FetchOutcome::Blocked => break EndReason::SourceBlocked,
                failure => {
                    tracing::warn!(
                        source = %profile.name,
                        page,
                        url = %request.url,
                        outcome = %failure,
                        "Listing page fetch failed"
                    );
                    break EndReason::FetchFailed;
                }
            };

            if page > 1 && !source.reflects_page(&fetched.final_url, page) {
                tracing::debug!(
                    source = %profile.name,
                    page,
                    final_url = %fetched.final_url,
                    "Listing redirected away from requested page"
                );
                break EndReason::RedirectedAway;
            }
            let parsed = source.parse_page(&fetched);
            if parsed.not_found {
                break EndReason::NotFoundMarker;
            }
            if parsed.items.is_empty() && fetched.origin == FetchOrigin::Fallback {
                break EndReason::EmptyFallbackPage;
            }
            last_page = page;

            let mut fresh = 0usize;
            for item in parsed.items {
                if !seen.insert(item.key.clone()) {
                    continue;
                }
                fresh += 1;
                let handler = handler.clone();
                let task = CrawlTask::new(item.key.clone(), move |ctx| async move {
                    if ctx.should_stop() {
                        return;
                    }
                    handler.handle(item, ctx).await;
                });
                if !session.dispatch(task).await {
                    pages.push(fresh - 1);
                    break 'pages EndReason::StopRequested;
                }
                item_count += 1;
            }
            pages.push(fresh);
            tracing::debug!(source = %profile.name, page, new_items = fresh, "Listing page dispatched");

            if fresh == 0 {
                empty_run += 1;
                if empty_run >= self.config.empty_page_run {
                    break EndReason::EmptyPageRun;
                }
            } else {
                empty_run = 0;
            }
        };

        let run = session.finish().await;
        self.report_end(&profile.name, last_page, max_pages, end);

        let finished_at = Utc::now();
        tracing::info!(
            source = %profile.name,
            %session_id,
            last_page,
            items = item_count,
            end = %end,
            panicked = run.panicked,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "Crawl finished"
        );

        CrawlReport {
            session_id,
            source: profile.name.clone(),
            last_page_reached: last_page,
            item_count,
            pages,
            end,
            run,
            started_at,
            finished_at,
        }
    }

    /// One-time (per source) warning distinguishing a likely true end of
    /// the listing from a suspiciously early stop.
    fn report_end(&self, source: &str, last_page: u32, max_pages: Option<u32>, end: EndReason) {
        if matches!(end, EndReason::PageBudget | EndReason::StopRequested) {
            return;
        }
        let first_time = self
            .warned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(source.to_string());
        if !first_time {
            return;
        }

        match max_pages {
            Some(max)
                if end != EndReason::NotFoundMarker
                    && f64::from(last_page) < f64::from(max) * self.config.early_stop_fraction =>
            {
                self.reporter.report(EngineEvent::SourceLikelyEndedEarly {
                    source,
                    last_page,
                    max_pages: max,
                    reason: end,
                });
            }
            _ => self.reporter.report(EngineEvent::ListingEnded {
                source,
                last_page,
                reason: end,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::EngineConfig;
    use crate::control::{ControlHandle, Unthrottled};
    use crate::testutil::{CountingHandler, MockFallback, MockListing, MockReply, MockTransport, RecordingReporter};

    const START: &str = "https://site.example/list";

    fn page_url(page: u32) -> String {
        MockListing.page_url(START, page)
    }

    fn crawler(transport: MockTransport) -> (Crawler<MockTransport>, RecordingReporter) {
        let reporter = RecordingReporter::new();
        let config = EngineConfig::default();
        let fetcher = ResilientFetcher::new(transport, &config, Arc::new(reporter.clone()));
        let scheduler = Scheduler::new(config.scheduler.clone(), Arc::new(Unthrottled));
        let crawler = Crawler::new(fetcher, scheduler, config.crawl, Arc::new(reporter.clone()));
        (crawler, reporter)
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_six_empty_pages() {
        let transport = MockTransport::new();
        transport.route(page_url(1), MockReply::ok(MockListing::page_body(0, 5)));
        transport.route(page_url(2), MockReply::ok(MockListing::page_body(5, 5)));
        for page in 3..=20 {
            transport.route(page_url(page), MockReply::ok(""));
        }
        let (crawler, reporter) = crawler(transport.clone());
        let handler = Arc::new(CountingHandler::new());

        let report = crawler
            .crawl(&SourceProfile::new("site"), START, Some(50), &MockListing, handler.clone())
            .await;

        assert_eq!(report.end, EndReason::EmptyPageRun);
        assert_eq!(report.last_page_reached, 8);
        assert_eq!(report.pages, vec![5, 5, 0, 0, 0, 0, 0, 0]);
        assert_eq!(report.item_count, 10);
        assert_eq!(handler.count(), 10);
        assert_eq!(transport.call_count(), 8);
        assert_eq!(reporter.count("source_likely_ended_early"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_items_count_as_empty() {
        let transport = MockTransport::new();
        // The source keeps serving page 1's items on every page.
        for page in 1..=10 {
            transport.route(page_url(page), MockReply::ok(MockListing::page_body(0, 3)));
        }
        let (crawler, _) = crawler(transport);
        let handler = Arc::new(CountingHandler::new());

        let report = crawler
            .crawl(&SourceProfile::new("site"), START, None, &MockListing, handler.clone())
            .await;

        assert_eq!(report.end, EndReason::EmptyPageRun);
        assert_eq!(report.last_page_reached, 7);
        assert_eq!(handler.count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn page_budget_bounds_the_walk() {
        let transport = MockTransport::new();
        for page in 1..=10 {
            transport.route(
                page_url(page),
                MockReply::ok(MockListing::page_body(page as usize * 10, 2)),
            );
        }
        let (crawler, reporter) = crawler(transport.clone());
        let handler = Arc::new(CountingHandler::new());

        let report = crawler
            .crawl(&SourceProfile::new("site"), START, Some(3), &MockListing, handler.clone())
            .await;

        assert_eq!(report.end, EndReason::PageBudget);
        assert_eq!(report.last_page_reached, 3);
        assert_eq!(report.item_count, 6);
        assert_eq!(transport.call_count(), 3);
        assert!(reporter.names().is_empty());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["end"], "page_budget");
        assert_eq!(json["pages"], serde_json::json!([2, 2, 2]));
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_marker_ends_listing() {
        let transport = MockTransport::new();
        transport.route(page_url(1), MockReply::ok(MockListing::page_body(0, 4)));
        transport.route(page_url(2), MockReply::ok("NOT FOUND"));
        let (crawler, reporter) = crawler(transport);

        let report = crawler
            .crawl(
                &SourceProfile::new("site"),
                START,
                Some(40),
                &MockListing,
                Arc::new(CountingHandler::new()),
            )
            .await;

        assert_eq!(report.end, EndReason::NotFoundMarker);
        assert_eq!(report.last_page_reached, 1);
        // A not-found marker is a true end, even far below the budget.
        assert_eq!(reporter.count("listing_ended"), 1);
        assert_eq!(reporter.count("source_likely_ended_early"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_status_ends_listing() {
        let transport = MockTransport::new();
        transport.route(page_url(1), MockReply::ok(MockListing::page_body(0, 4)));
        let (crawler, _) = crawler(transport);

        let report = crawler
            .crawl(
                &SourceProfile::new("site"),
                START,
                None,
                &MockListing,
                Arc::new(CountingHandler::new()),
            )
            .await;

        assert_eq!(report.end, EndReason::NotFoundMarker);
        assert_eq!(report.last_page_reached, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn redirect_to_first_page_ends_listing() {
        let transport = MockTransport::new();
        transport.route(page_url(1), MockReply::ok(MockListing::page_body(0, 4)));
        transport.route(page_url(2), MockReply::ok(MockListing::page_body(4, 4)));
        transport.route(
            page_url(3),
            MockReply::redirected(MockListing::page_body(0, 4), START),
        );
        let (crawler, _) = crawler(transport);
        let handler = Arc::new(CountingHandler::new());

        let report = crawler
            .crawl(&SourceProfile::new("site"), START, Some(10), &MockListing, handler.clone())
            .await;

        assert_eq!(report.end, EndReason::RedirectedAway);
        assert_eq!(report.last_page_reached, 2);
        assert_eq!(handler.count(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_fallback_page_ends_listing() {
        let transport = MockTransport::new();
        transport.route(page_url(1), MockReply::ok(MockListing::page_body(0, 4)));
        transport.route(page_url(2), MockReply::status(503));
        let (crawler, _) = crawler(transport);
        let crawler = Crawler {
            fetcher: crawler
                .fetcher
                .clone()
                .with_fallback(Arc::new(MockFallback::new("mirror", MockReply::ok("")))),
            ..crawler
        };

        let report = crawler
            .crawl(
                &SourceProfile::new("site").with_cache_fallback(),
                START,
                Some(10),
                &MockListing,
                Arc::new(CountingHandler::new()),
            )
            .await;

        assert_eq!(report.end, EndReason::EmptyFallbackPage);
        assert_eq!(report.last_page_reached, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_warns_once_per_source() {
        let transport = MockTransport::new();
        transport.route(page_url(1), MockReply::status(403));
        let (crawler, reporter) = crawler(transport);
        let profile = SourceProfile::new("site");

        for _ in 0..3 {
            let report = crawler
                .crawl(&profile, START, Some(20), &MockListing, Arc::new(CountingHandler::new()))
                .await;
            assert_eq!(report.end, EndReason::FetchFailed);
            assert_eq!(report.last_page_reached, 0);
        }
        assert_eq!(reporter.count("source_likely_ended_early"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_end_is_reported_as_listing_end() {
        let transport = MockTransport::new();
        for page in 1..=6 {
            transport.route(
                page_url(page),
                MockReply::ok(MockListing::page_body(page as usize * 10, 1)),
            );
        }
        let (crawler, reporter) = crawler(transport);

        let report = crawler
            .crawl(
                &SourceProfile::new("site"),
                START,
                Some(10),
                &MockListing,
                Arc::new(CountingHandler::new()),
            )
            .await;

        assert_eq!(report.end, EndReason::NotFoundMarker);
        assert_eq!(report.last_page_reached, 6);
        assert_eq!(reporter.count("listing_ended"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn item_concurrency_follows_session_ceiling() {
        let transport = MockTransport::new();
        transport.route(page_url(1), MockReply::ok(MockListing::page_body(0, 30)));
        let (crawler, _) = crawler(transport);
        let handler = Arc::new(CountingHandler::with_delay(Duration::from_millis(100)));

        let profile = SourceProfile::new("site").with_concurrency_hint(4);
        let report = crawler
            .crawl(&profile, START, Some(1), &MockListing, handler.clone())
            .await;

        assert_eq!(report.run.completed, 30);
        assert_eq!(handler.peak_concurrency(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_request_ends_crawl_between_pages() {
        let transport = MockTransport::new();
        for page in 1..=5 {
            transport.route(
                page_url(page),
                MockReply::ok(MockListing::page_body(page as usize * 10, 2)),
            );
        }
        let reporter = RecordingReporter::new();
        let config = EngineConfig::default();
        let control = ControlHandle::new();
        let fetcher = ResilientFetcher::new(transport.clone(), &config, Arc::new(reporter.clone()));
        let scheduler = Scheduler::new(config.scheduler.clone(), Arc::new(control.clone()));
        let crawler = Crawler::new(fetcher, scheduler, config.crawl, Arc::new(reporter.clone()));

        control.request_stop();
        let report = crawler
            .crawl(
                &SourceProfile::new("site"),
                START,
                None,
                &MockListing,
                Arc::new(CountingHandler::new()),
            )
            .await;

        assert_eq!(report.end, EndReason::StopRequested);
        assert_eq!(report.last_page_reached, 0);
        assert_eq!(transport.call_count(), 0);
        assert!(reporter.names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_page_fetches_until_resumed() {
        let transport = MockTransport::new();
        for page in 1..=10 {
            transport.route(page_url(page), MockReply::ok(""));
        }
        let reporter = RecordingReporter::new();
        let config = EngineConfig::default();
        let control = ControlHandle::new();
        let fetcher = ResilientFetcher::new(transport.clone(), &config, Arc::new(reporter.clone()));
        let scheduler = Scheduler::new(config.scheduler.clone(), Arc::new(control.clone()));
        let crawler = Crawler::new(fetcher, scheduler, config.crawl, Arc::new(reporter));

        control.pause();
        let crawl = tokio::spawn(async move {
            crawler
                .crawl(
                    &SourceProfile::new("site"),
                    START,
                    None,
                    &MockListing,
                    Arc::new(CountingHandler::new()),
                )
                .await
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.call_count(), 0);
        assert!(!crawl.is_finished());

        control.resume();
        let report = crawl.await.unwrap();
        assert_eq!(report.end, EndReason::EmptyPageRun);
        assert_eq!(transport.call_count(), 6);
    }
}
