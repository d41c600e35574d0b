use std::sync::Arc;

use trawl_core::config::EngineConfig;
use trawl_core::control::{ControlHandle, LoadController};
use trawl_core::crawl::Crawler;
use trawl_core::fetcher::ResilientFetcher;
use trawl_core::scheduler::Scheduler;
use trawl_core::testutil::{MockTransport, RecordingReporter};

pub const START: &str = "https://listing.example/movies";

/// A fully wired engine over a scripted transport.
pub struct TestEngine {
    pub transport: MockTransport,
    pub reporter: RecordingReporter,
    pub control: ControlHandle,
    pub crawler: Crawler<MockTransport>,
}

impl TestEngine {
    pub fn new(config: EngineConfig) -> Self {
        let transport = MockTransport::new();
        let reporter = RecordingReporter::new();
        let control = ControlHandle::new();
        let fetcher = ResilientFetcher::new(transport.clone(), &config, Arc::new(reporter.clone()));
        let controller: Arc<dyn LoadController> = Arc::new(control.clone());
        let scheduler = Scheduler::new(config.scheduler.clone(), controller);
        let crawler = Crawler::new(fetcher, scheduler, config.crawl, Arc::new(reporter.clone()));
        Self {
            transport,
            reporter,
            control,
            crawler,
        }
    }

    pub fn fetcher(&self) -> &ResilientFetcher<MockTransport> {
        self.crawler.fetcher()
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
