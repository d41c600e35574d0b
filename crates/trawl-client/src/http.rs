use std::error::Error as StdError;
use std::net::IpAddr;
use std::time::Duration;

use reqwest::Client;
use reqwest::redirect::Policy;
use trawl_core::error::AppError;
use trawl_core::models::{FetchRequest, RawResponse, TransportError};
use trawl_core::traits::Transport;
use url::Url;

const DEFAULT_USER_AGENT: &str = "trawl/0.3";
const MAX_REDIRECTS: usize = 10;

/// Plain HTTP transport using reqwest.
///
/// Performs exactly one GET per call and reports the status, body and the
/// URL the request ended at after redirects. Non-2xx statuses are returned
/// as responses, not errors; classification happens in the fetcher.
///
/// SSRF protection is **enabled** by default: requests resolving to
/// private/reserved IP ranges are refused. Use
/// [`allow_private_urls`](Self::allow_private_urls) to disable it (e.g. for
/// CLI usage where the user controls the machine).
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    ssrf_protection: bool,
}

impl HttpTransport {
    pub fn new() -> Result<Self, AppError> {
        Self::with_user_agent(DEFAULT_USER_AGENT)
    }

    pub fn with_user_agent(user_agent: &str) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            ssrf_protection: true,
        })
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &FetchRequest,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        if self.ssrf_protection {
            validate_url(&request.url).await?;
        }

        let mut builder = self.client.get(&request.url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(transport_error)?;

        Ok(RawResponse {
            status,
            body,
            final_url,
        })
    }
}

fn transport_error(e: reqwest::Error) -> TransportError {
    let detail = error_chain(&e);
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        let lower = detail.to_ascii_lowercase();
        if lower.contains("dns") || lower.contains("resolve") || lower.contains("lookup") {
            TransportError::Dns(detail)
        } else {
            TransportError::Connection(detail)
        }
    } else if e.is_builder() {
        TransportError::InvalidUrl(detail)
    } else if e.is_request() || e.is_body() || e.is_decode() {
        TransportError::Connection(detail)
    } else {
        TransportError::Other(detail)
    }
}

/// reqwest's own message hides the cause (e.g. "error sending request");
/// the useful part sits further down the source chain.
fn error_chain(e: &dyn StdError) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
async fn validate_url(url: &str) -> Result<(), TransportError> {
    let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(TransportError::Other(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl("URL has no host".to_string()))?;

    // IP literals are checked directly; IPv6 hosts come bracketed.
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(TransportError::Other(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::Dns(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(TransportError::Dns(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    for socket_addr in &addrs {
        if is_private_ip(socket_addr.ip()) {
            return Err(TransportError::Other(format!(
                "SSRF blocked: {host} resolves to private/reserved IP {}",
                socket_addr.ip()
            )));
        }
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()           // 127.0.0.0/8
                || v4.is_private()     // 10/8, 172.16/12, 192.168/16
                || v4.is_link_local()  // 169.254.0.0/16 (cloud metadata)
                || v4.is_unspecified() // 0.0.0.0
                || v4.is_broadcast()   // 255.255.255.255
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 (link-local)
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                // fc00::/7 (unique local)
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                || match v6.to_ipv4_mapped() {
                    Some(v4) => is_private_ip(IpAddr::V4(v4)),
                    None => false,
                }
        }
    }
}
