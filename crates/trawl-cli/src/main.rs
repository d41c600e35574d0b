use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

use trawl_client::{HttpTransport, JsonApiClient, MirrorFallback, Pagination, SelectorListing};
use trawl_core::{
    ControlHandle, CrawlReport, Crawler, EngineConfig, EngineReporter, ItemHandler, ListingItem,
    LoadController, ResilientFetcher, Scheduler, SourceProfile, TaskContext, TracingReporter,
    Transport,
};

#[derive(Parser)]
#[command(name = "trawl", version, about = "Resilient listing crawler and metadata lookup")]
struct Cli {
    /// JSON engine configuration (TRAWL_* variables override it)
    #[arg(short, long, global = true, env = "TRAWL_CONFIG")]
    config: Option<PathBuf>,

    /// Allow requests to private/loopback addresses
    #[arg(long, global = true, default_value_t = false)]
    allow_private: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk a paginated listing and print every item as a JSON line
    Crawl {
        /// First page of the listing
        #[arg(short, long)]
        url: String,

        /// CSS selector matching one listing item
        #[arg(short, long)]
        items: String,

        /// CSS selector for the title inside an item (defaults to the item text)
        #[arg(long)]
        title: Option<String>,

        /// Source name used for breaker accounting (defaults to the URL host)
        #[arg(short, long)]
        source: Option<String>,

        /// Stop after this many pages (unbounded by default)
        #[arg(short, long)]
        max_pages: Option<u32>,

        /// Query parameter carrying the page number
        #[arg(long, default_value = "page")]
        page_param: String,

        /// Address pages as `{url}/{page-param}/{n}` instead of a query parameter
        #[arg(long, default_value_t = false)]
        path_pages: bool,

        /// Extra request header, `Name: value` (repeatable)
        #[arg(long = "header")]
        headers: Vec<String>,

        /// Items handled concurrently
        #[arg(long)]
        concurrency: Option<usize>,

        /// Per-attempt timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,

        /// Render pages with headless Chromium
        #[arg(long, default_value_t = false)]
        render: bool,

        /// Mirror prefix tried when the source fails (e.g. a web archive)
        #[arg(long)]
        mirror: Option<String>,

        /// Page-title text that marks a past-the-end page (repeatable)
        #[arg(long = "not-found")]
        not_found: Vec<String>,

        /// Write the crawl report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Look up one record on a JSON metadata API
    Lookup {
        /// Lookup URL, without the API key
        #[arg(short, long)]
        url: String,

        /// Provider name used for breaker accounting
        #[arg(short, long, default_value = "api")]
        provider: String,

        /// Query parameter carrying the API key
        #[arg(long, default_value = "apikey")]
        key_param: String,

        /// API keys, rotated per call
        #[arg(short, long, env = "TRAWL_API_KEYS", value_delimiter = ',')]
        keys: Vec<String>,
    },
}

/// Prints each item as one JSON line on stdout.
struct PrintHandler;

impl ItemHandler for PrintHandler {
    async fn handle(&self, item: ListingItem, ctx: TaskContext) {
        if ctx.should_stop() {
            return;
        }
        let line = serde_json::json!({ "title": item.title, "url": item.url });
        println!("{line}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trawl=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let token = CancellationToken::new();
    let control = ControlHandle::with_cancellation(token.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight work");
            token.cancel();
        }
    });

    let mut transport = HttpTransport::new().context("Failed to create HTTP client")?;
    if cli.allow_private {
        transport = transport.allow_private_urls();
    }

    match cli.command {
        Commands::Crawl {
            url,
            items,
            title,
            source,
            max_pages,
            page_param,
            path_pages,
            headers,
            concurrency,
            timeout_secs,
            render,
            mirror,
            not_found,
            report,
        } => {
            let name = match source {
                Some(name) => name,
                None => source_name(&url)?,
            };
            let mut profile =
                SourceProfile::new(name).with_timeout(Duration::from_secs(timeout_secs));
            for header in &headers {
                let (header_name, value) = parse_header(header)?;
                profile = profile.with_header(header_name, value);
            }
            if let Some(concurrency) = concurrency {
                profile = profile.with_concurrency_hint(concurrency);
            }
            if mirror.is_some() {
                profile = profile.with_cache_fallback();
            }
            if render {
                profile = profile.with_render();
            }

            let mut listing = SelectorListing::new(&items)?.with_pagination(if path_pages {
                Pagination::PathSegment(page_param)
            } else {
                Pagination::Query(page_param)
            });
            if let Some(title) = &title {
                listing = listing.with_title_selector(title)?;
            }
            for marker in not_found {
                listing = listing.with_not_found_marker(marker);
            }

            let reporter: Arc<dyn EngineReporter> = Arc::new(TracingReporter);
            let mut fetcher = ResilientFetcher::new(transport.clone(), &config, reporter.clone());
            if let Some(prefix) = mirror {
                fetcher = fetcher.with_fallback(Arc::new(MirrorFallback::new(
                    "mirror",
                    prefix,
                    transport,
                )));
            }
            let controller: Arc<dyn LoadController> = Arc::new(control);
            let scheduler = Scheduler::new(config.scheduler.clone(), controller);

            #[cfg(feature = "browser")]
            if render {
                let browser = trawl_client::BrowserTransport::launch()
                    .await
                    .context("Failed to launch headless browser")?;
                let crawler = Crawler::new(
                    fetcher.with_transport(browser),
                    scheduler,
                    config.crawl.clone(),
                    reporter,
                );
                let crawl_report = run_crawl(&crawler, &profile, &url, max_pages, &listing).await;
                return write_report(&crawl_report, report.as_deref());
            }
            #[cfg(not(feature = "browser"))]
            if render {
                bail!("--render needs trawl built with the `browser` feature");
            }

            let crawler = Crawler::new(fetcher, scheduler, config.crawl.clone(), reporter);
            let crawl_report = run_crawl(&crawler, &profile, &url, max_pages, &listing).await;
            write_report(&crawl_report, report.as_deref())?;
        }
        Commands::Lookup {
            url,
            provider,
            key_param,
            keys,
        } => {
            let fetcher = ResilientFetcher::new(transport, &config, Arc::new(TracingReporter));
            let mut client = JsonApiClient::new(provider, fetcher);
            if !keys.is_empty() {
                client = client.with_credentials(key_param, keys);
            }

            match client.lookup_json(&url).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => bail!("No match for {url}"),
            }
        }
    }

    Ok(())
}

/// Config file (if any), then `TRAWL_*` overrides.
fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.apply_env().context("Invalid TRAWL_* override")
}

async fn run_crawl<T: Transport>(
    crawler: &Crawler<T>,
    profile: &SourceProfile,
    url: &str,
    max_pages: Option<u32>,
    listing: &SelectorListing,
) -> CrawlReport {
    let report = crawler
        .crawl(profile, url, max_pages, listing, Arc::new(PrintHandler))
        .await;
    tracing::info!(
        source = %report.source,
        session_id = %report.session_id,
        end = %report.end,
        last_page = report.last_page_reached,
        items = report.item_count,
        panicked = report.run.panicked,
        "Crawl finished"
    );
    report
}

fn write_report(report: &CrawlReport, path: Option<&Path>) -> Result<()> {
    if let Some(path) = path {
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
    }
    Ok(())
}

fn source_name(url: &str) -> Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("Invalid listing URL: {url}"))?;
    parsed
        .host_str()
        .map(str::to_string)
        .with_context(|| format!("Listing URL has no host: {url}"))
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let Some((name, value)) = raw.split_once(':') else {
        bail!("Header must look like `Name: value`, got `{raw}`");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("Header name is empty in `{raw}`");
    }
    Ok((name.to_string(), value.trim().to_string()))
}
