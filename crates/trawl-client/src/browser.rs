use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::time::Instant;
use trawl_core::error::AppError;
use trawl_core::models::{FetchRequest, RawResponse, TransportError};
use trawl_core::traits::Transport;

/// Render transport backed by headless Chromium over the DevTools Protocol.
///
/// Meant for sources whose profile sets `needs_render`: the page's scripts
/// run before the DOM is returned. One Chromium process is shared by all
/// clones; every attempt opens a tab, reads the rendered HTML and closes it,
/// timeouts included.
///
/// CDP does not surface the document's HTTP status, so a rendered page is
/// reported as `200`. Sources that render error pages must flag them through
/// their listing parser (e.g. a not-found title marker). Request headers are
/// not forwarded.
#[derive(Clone)]
pub struct BrowserTransport {
    browser: Arc<Browser>,
}

impl BrowserTransport {
    /// Launches a headless Chromium.
    ///
    /// Requires a Chromium / Chrome binary reachable via `$PATH`, `CHROME_BIN`
    /// or one of the well-known install locations.
    pub async fn launch() -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        // Snap-packaged Chromium ships a wrapper that drops standard Chrome
        // flags (--headless, ...), so the real binary is preferred.
        if let Some(bin) = find_chrome_binary() {
            tracing::info!(binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::Generic(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::Generic(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser CDP handler error");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
        })
    }

    async fn render(page: &Page, url: &str) -> Result<RawResponse, TransportError> {
        page.goto(url)
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to navigate to {url}: {e}")))?;
        // <body> present is the minimal signal that the main content rendered.
        page.find_element("body")
            .await
            .map_err(|e| TransportError::Other(format!("Page did not render body: {e}")))?;
        let body = page
            .content()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to read page content: {e}")))?;
        let final_url = page.url().await.ok().flatten().unwrap_or_else(|| url.to_string());
        Ok(RawResponse::new(200, body, final_url))
    }
}

impl Transport for BrowserTransport {
    async fn send(
        &self,
        request: &FetchRequest,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        let deadline = Instant::now() + timeout;
        let page = tokio::time::timeout_at(deadline, self.browser.new_page("about:blank"))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Connection(format!("Failed to open tab: {e}")))?;
        let tab = OpenTab {
            page,
            closed: false,
        };

        let rendered = match tokio::time::timeout_at(deadline, Self::render(&tab.page, &request.url)).await {
            Ok(rendered) => rendered,
            Err(_) => Err(TransportError::Timeout),
        };
        tab.close().await;
        rendered
    }
}

/// A browser tab that is closed on every path, including when the future
/// holding it is dropped by an outer timeout.
struct OpenTab {
    page: Page,
    closed: bool,
}

impl OpenTab {
    async fn close(mut self) {
        self.closed = true;
        close_tab(self.page.clone()).await;
    }
}

impl Drop for OpenTab {
    fn drop(&mut self) {
        if !self.closed
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            runtime.spawn(close_tab(self.page.clone()));
        }
    }
}

async fn close_tab(page: Page) {
    if let Err(e) = page.close().await {
        tracing::debug!(error = %e, "Failed to close tab");
    }
}

/// Tries to locate the real Chrome/Chromium binary. `None` lets
/// `chromiumoxide` do its own lookup.
fn find_chrome_binary() -> Option<PathBuf> {
    const CANDIDATES: &[&str] = &[
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    CANDIDATES.iter().map(PathBuf::from).find(|p| p.exists())
}
