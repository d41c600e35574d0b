use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Static description of one listing site or metadata provider.
///
/// Immutable for the duration of a crawl session; the engine only reads it.
#[derive(Debug, Clone)]
pub struct SourceProfile {
    pub name: String,
    /// Pages need a rendering transport (headless browser) instead of plain HTTP.
    pub needs_render: bool,
    /// A third-party mirror may answer when the source itself is failing.
    pub allow_cache_fallback: bool,
    /// Soft per-attempt timeout handed to the transport.
    pub timeout: Duration,
    /// Extra request headers, cookies included (`Cookie: ...`).
    pub headers: Vec<(String, String)>,
    pub concurrency_hint: Option<usize>,
}

impl SourceProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            needs_render: false,
            allow_cache_fallback: false,
            timeout: Duration::from_secs(10),
            headers: Vec::new(),
            concurrency_hint: None,
        }
    }

    pub fn with_render(mut self) -> Self {
        self.needs_render = true;
        self
    }

    pub fn with_cache_fallback(mut self) -> Self {
        self.allow_cache_fallback = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_concurrency_hint(mut self, hint: usize) -> Self {
        self.concurrency_hint = Some(hint);
        self
    }
}

/// One outbound request as handed to a [`Transport`](crate::traits::Transport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Query parameter that receives the policy's credential on the wire.
    /// The credential never becomes part of the cache key.
    pub credential_param: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            credential_param: None,
        }
    }

    pub fn with_headers(mut self, headers: &[(String, String)]) -> Self {
        self.headers.extend_from_slice(headers);
        self
    }

    pub fn with_credential_param(mut self, name: impl Into<String>) -> Self {
        self.credential_param = Some(name.into());
        self
    }

    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..self.clone()
        }
    }
}

/// What a transport returned for one attempt, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    /// URL after redirects.
    pub final_url: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>, final_url: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            final_url: final_url.into(),
        }
    }
}

/// Transport-level failure of a single attempt (no HTTP status available).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport's own (soft) timeout fired.
    Timeout,
    /// Connection reset, refused or dropped mid-flight.
    Connection(String),
    /// Temporary DNS resolution failure.
    Dns(String),
    /// The URL could not be parsed or contains illegal characters.
    InvalidUrl(String),
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "timed out"),
            TransportError::Connection(msg) => write!(f, "connection error: {msg}"),
            TransportError::Dns(msg) => write!(f, "dns error: {msg}"),
            TransportError::InvalidUrl(msg) => write!(f, "invalid url: {msg}"),
            TransportError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

/// Closed set of failure classes a fetch can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// HTTP 429 and its provider-specific equivalents.
    RateLimited,
    /// 502/503/504 and the 520-525 family.
    ServerError(u16),
    Connection,
    DnsTemporary,
    /// The transport's own timeout.
    SoftTimeout,
    /// The watchdog fired; the transport hung past its own timeout.
    HardTimeout,
    MalformedUrl,
    CredentialExhausted,
    /// 4xx other than 404/429.
    ClientError(u16),
    Unclassified,
}

impl ErrorClass {
    /// Classes that are expected to heal on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorClass::RateLimited
                | ErrorClass::ServerError(_)
                | ErrorClass::Connection
                | ErrorClass::DnsTemporary
                | ErrorClass::SoftTimeout
                | ErrorClass::HardTimeout
        )
    }

    /// Server status codes retried with backoff.
    pub fn is_transient_status(status: u16) -> bool {
        matches!(status, 502..=504 | 520..=525)
    }
}

impl From<&TransportError> for ErrorClass {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::Timeout => ErrorClass::SoftTimeout,
            TransportError::Connection(_) => ErrorClass::Connection,
            TransportError::Dns(_) => ErrorClass::DnsTemporary,
            TransportError::InvalidUrl(_) => ErrorClass::MalformedUrl,
            TransportError::Other(_) => ErrorClass::Unclassified,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::RateLimited => write!(f, "rate-limited"),
            ErrorClass::ServerError(code) => write!(f, "server error {code}"),
            ErrorClass::Connection => write!(f, "connection"),
            ErrorClass::DnsTemporary => write!(f, "dns temporary failure"),
            ErrorClass::SoftTimeout => write!(f, "timeout"),
            ErrorClass::HardTimeout => write!(f, "hard timeout"),
            ErrorClass::MalformedUrl => write!(f, "malformed url"),
            ErrorClass::CredentialExhausted => write!(f, "credential exhausted"),
            ErrorClass::ClientError(code) => write!(f, "client error {code}"),
            ErrorClass::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Where a successful payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrigin {
    Network,
    Cache,
    /// An alternate resolution path (e.g. a cached third-party mirror).
    Fallback,
}

/// A successfully fetched payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub body: String,
    pub final_url: String,
    pub origin: FetchOrigin,
}

/// Result of one resilient fetch. Callers never see transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success(Fetched),
    NotFound,
    /// The source's breaker is open and no fallback was allowed.
    Blocked,
    TransientFailure(ErrorClass),
    PermanentFailure(ErrorClass),
}

impl FetchOutcome {
    pub(crate) fn failure(class: ErrorClass, transient: bool) -> Self {
        if transient {
            FetchOutcome::TransientFailure(class)
        } else {
            FetchOutcome::PermanentFailure(class)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            FetchOutcome::TransientFailure(_) | FetchOutcome::PermanentFailure(_)
        )
    }

    pub fn fetched(&self) -> Option<&Fetched> {
        match self {
            FetchOutcome::Success(fetched) => Some(fetched),
            _ => None,
        }
    }

    pub fn into_fetched(self) -> Option<Fetched> {
        match self {
            FetchOutcome::Success(fetched) => Some(fetched),
            _ => None,
        }
    }
}

impl fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchOutcome::Success(fetched) => write!(f, "success ({})", fetched.final_url),
            FetchOutcome::NotFound => write!(f, "not found"),
            FetchOutcome::Blocked => write!(f, "blocked"),
            FetchOutcome::TransientFailure(class) => write!(f, "transient failure: {class}"),
            FetchOutcome::PermanentFailure(class) => write!(f, "permanent failure: {class}"),
        }
    }
}
