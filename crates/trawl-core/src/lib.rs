pub mod breaker;
pub mod cache;
pub mod config;
pub mod control;
pub mod crawl;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod models;
pub mod rate_limit;
pub mod scheduler;
pub mod testutil;
pub mod traits;
pub mod util;

pub use breaker::{BreakerRegistry, BreakerStats, BreakerTier, SourceBreaker};
pub use cache::{CacheLookup, ResponseCache};
pub use config::EngineConfig;
pub use control::{ControlHandle, LoadController, Unthrottled};
pub use crawl::{CrawlReport, Crawler};
pub use error::AppError;
pub use events::{EndReason, EngineEvent, EngineReporter, NullReporter, TracingReporter};
pub use fetcher::{CacheMode, FetchPolicy, ResilientFetcher};
pub use models::{
    ErrorClass, FetchOrigin, FetchOutcome, FetchRequest, Fetched, RawResponse, SourceProfile,
    TransportError,
};
pub use rate_limit::{CredentialPool, RateLimiter};
pub use scheduler::{CrawlTask, RunSummary, Scheduler, SchedulerClosed, Session, TaskContext, TaskSender};
pub use traits::{
    Classification, FallbackResolver, ItemHandler, ListingItem, ListingPage, ListingSource,
    ResponseClassifier, StatusClassifier, Transport, classify_status,
};
