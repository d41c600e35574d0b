use std::sync::Arc;
use std::time::Duration;

use trawl_core::breaker::BreakerTier;
use trawl_core::config::{EngineConfig, WindowConfig};
use trawl_core::fetcher::FetchPolicy;
use trawl_core::models::{ErrorClass, FetchOrigin, FetchOutcome, FetchRequest, SourceProfile};
use trawl_core::rate_limit::CredentialPool;
use trawl_core::testutil::MockReply;

use crate::common::TestEngine;

const URL: &str = "https://site-x.example/title/9";

#[tokio::test(start_paused = true)]
async fn twenty_failures_block_source_until_cool_down() {
    let engine = TestEngine::default();
    engine.transport.route(URL, MockReply::status(403));
    let policy = FetchPolicy::for_source(&SourceProfile::new("X"), &EngineConfig::default().retry);

    for _ in 0..20 {
        engine.fetcher().fetch(&FetchRequest::get(URL), &policy).await;
        tokio::time::advance(Duration::from_secs(6)).await;
    }
    let breakers = engine.fetcher().breakers();
    assert!(breakers.is_blocked(BreakerTier::Fetch, "X"));
    // Calls stop reaching the network once the source is blocked.
    assert_eq!(engine.transport.call_count(), 15);
    assert_eq!(engine.reporter.count("source_too_many_errors"), 1);

    tokio::time::advance(Duration::from_secs(10 * 60)).await;
    assert!(!breakers.is_blocked(BreakerTier::Fetch, "X"));
    assert_eq!(engine.reporter.count("source_unblocked"), 1);

    engine.transport.route(URL, MockReply::ok("back"));
    let outcome = engine.fetcher().fetch(&FetchRequest::get(URL), &policy).await;
    assert!(outcome.is_success());
}

#[tokio::test(start_paused = true)]
async fn blocked_source_does_not_affect_others() {
    let mut config = EngineConfig::default();
    config.fetch_breaker.threshold = 1;
    let engine = TestEngine::new(config.clone());
    engine.transport.route(URL, MockReply::status(403));
    engine
        .transport
        .route("https://site-y.example/title/1", MockReply::ok("fine"));

    let dead = FetchPolicy::for_source(&SourceProfile::new("X"), &config.retry);
    let healthy = FetchPolicy::for_source(&SourceProfile::new("Y"), &config.retry);

    engine.fetcher().fetch(&FetchRequest::get(URL), &dead).await;
    assert_eq!(
        engine.fetcher().fetch(&FetchRequest::get(URL), &dead).await,
        FetchOutcome::Blocked
    );
    let outcome = engine
        .fetcher()
        .fetch(&FetchRequest::get("https://site-y.example/title/1"), &healthy)
        .await;
    assert!(outcome.is_success());
}

#[tokio::test(start_paused = true)]
async fn reconcile_sweep_releases_sources() {
    let mut config = EngineConfig::default();
    config.fetch_breaker.threshold = 1;
    config.fetch_breaker.cool_down_secs = 60;
    let engine = TestEngine::new(config);
    let breakers = engine.fetcher().breakers();

    breakers.tier(BreakerTier::Fetch).record_failure("a");
    breakers.tier(BreakerTier::Fetch).record_failure("b");
    tokio::time::advance(Duration::from_secs(61)).await;

    assert_eq!(breakers.reconcile(), 2);
    assert_eq!(engine.reporter.count("source_unblocked"), 2);
}

#[tokio::test]
async fn negative_entry_expires_after_ttl() {
    let mut config = EngineConfig::default();
    config.cache.negative_ttl_secs = 1;
    let engine = TestEngine::new(config.clone());
    let policy = FetchPolicy::for_api("api", &config.retry);
    let request = FetchRequest::get("https://api.example/search?q=nothing");

    assert_eq!(engine.fetcher().fetch(&request, &policy).await, FetchOutcome::NotFound);
    assert_eq!(engine.fetcher().fetch(&request, &policy).await, FetchOutcome::NotFound);
    assert_eq!(engine.transport.call_count(), 1);

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    engine.transport.route(request.url.clone(), MockReply::ok("{}"));
    let outcome = engine.fetcher().fetch(&request, &policy).await;
    assert_eq!(outcome.fetched().map(|f| f.origin), Some(FetchOrigin::Network));
    assert_eq!(engine.transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn credential_pool_spreads_lookups() {
    let mut config = EngineConfig::default();
    for key in ["k1", "k2"] {
        config
            .rate_limit
            .credentials
            .insert(key.into(), vec![WindowConfig::per_second(1)]);
    }
    let engine = TestEngine::new(config.clone());
    let fetcher = engine.fetcher();
    let pool = CredentialPool::new(
        "omdb",
        vec!["k1".into(), "k2".into()],
        fetcher.rate_limiter().clone(),
    );

    let start = tokio::time::Instant::now();
    for i in 0..4 {
        let url = format!("https://api.example/?i=tt{i}");
        engine.transport.route(url.clone(), MockReply::ok("{}"));
        let credential = pool.select().unwrap();
        let policy = FetchPolicy::for_api("omdb", &config.retry).with_credential(credential);
        assert!(fetcher.fetch(&FetchRequest::get(url), &policy).await.is_success());
    }
    // Two keys at 1/s each: four calls need one rollover, not three.
    assert_eq!(start.elapsed(), Duration::from_secs(1));

    fetcher.rate_limiter().mark_exhausted("k1", Duration::from_secs(3600));
    for _ in 0..3 {
        assert_eq!(pool.select().unwrap(), "k2");
    }
}

#[tokio::test(start_paused = true)]
async fn exhausted_credential_does_not_stall_other_credentials() {
    let engine = TestEngine::default();
    let retry = EngineConfig::default().retry;
    engine.fetcher().rate_limiter().mark_exhausted("spent", Duration::from_secs(3600));
    engine.transport.route(URL, MockReply::ok("{}"));

    let spent = FetchPolicy::for_api("omdb", &retry).with_credential("spent");
    let fresh = FetchPolicy::for_api("omdb", &retry)
        .with_credential("fresh")
        .with_cache_mode(trawl_core::CacheMode::Disabled);

    assert_eq!(
        engine.fetcher().fetch(&FetchRequest::get(URL), &spent).await,
        FetchOutcome::PermanentFailure(ErrorClass::CredentialExhausted)
    );
    assert!(engine.fetcher().fetch(&FetchRequest::get(URL), &fresh).await.is_success());
    assert_eq!(engine.reporter.count("credential_exhausted"), 1);
    assert!(
        !engine
            .fetcher()
            .breakers()
            .is_blocked(BreakerTier::Fetch, "omdb")
    );
}

#[tokio::test(start_paused = true)]
async fn fallback_is_not_used_for_not_found() {
    let engine = TestEngine::default();
    let mirror = Arc::new(trawl_core::testutil::MockFallback::new(
        "mirror",
        MockReply::ok("mirror"),
    ));
    let fetcher = engine.fetcher().clone().with_fallback(mirror.clone());
    let policy = FetchPolicy::for_source(
        &SourceProfile::new("X").with_cache_fallback(),
        &EngineConfig::default().retry,
    );

    let outcome = fetcher.fetch(&FetchRequest::get(URL), &policy).await;
    assert_eq!(outcome, FetchOutcome::NotFound);
    assert_eq!(mirror.call_count(), 0);
}
