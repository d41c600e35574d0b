//! Client for JSON metadata APIs (OMDb/TMDb style lookups).
//!
//! Providers rarely use status codes for "no match": they answer `200` with
//! `{"Response":"False","Error":"Movie not found!"}` or an empty result list,
//! and report spent quotas the same way. [`JsonApiClassifier`] maps those
//! shapes onto the engine's classification so the fetcher caches misses and
//! rotates away from spent keys.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use trawl_core::error::AppError;
use trawl_core::fetcher::{FetchPolicy, ResilientFetcher};
use trawl_core::models::{ErrorClass, FetchOutcome, FetchRequest, RawResponse};
use trawl_core::rate_limit::CredentialPool;
use trawl_core::traits::{Classification, ResponseClassifier, Transport, classify_status};

/// How long a spent key is left alone when the provider gives no hint.
const DEFAULT_QUOTA_RESET: Duration = Duration::from_secs(60 * 60);

const NOT_FOUND_MARKERS: &[&str] = &["not found", "no results", "could not be found"];
const QUOTA_MARKERS: &[&str] = &["limit reached", "invalid api key", "daily limit", "quota"];

/// Fields providers put human-readable errors in.
const ERROR_FIELDS: &[&str] = &["Error", "error", "status_message"];

/// Fields holding the result list of a search endpoint.
const RESULT_FIELDS: &[&str] = &["results", "Search", "items"];

#[derive(Debug, Clone)]
pub struct JsonApiClassifier {
    quota_reset: Duration,
}

impl JsonApiClassifier {
    pub fn new(quota_reset: Duration) -> Self {
        Self { quota_reset }
    }
}

impl Default for JsonApiClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_QUOTA_RESET)
    }
}

impl ResponseClassifier for JsonApiClassifier {
    fn classify(&self, response: &RawResponse) -> Classification {
        let parsed = serde_json::from_str::<Value>(&response.body).ok();

        if let Some(message) = parsed.as_ref().and_then(error_message) {
            let lower = message.to_ascii_lowercase();
            if QUOTA_MARKERS.iter().any(|m| lower.contains(m)) {
                return Classification::CredentialExhausted {
                    retry_after: self.quota_reset,
                };
            }
            if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
                return Classification::NotFound;
            }
            if (200..300).contains(&response.status) {
                tracing::warn!(url = %response.final_url, %message, "Metadata API reported an error");
                return Classification::Permanent(ErrorClass::Unclassified);
            }
        }

        match classify_status(response.status) {
            Classification::Success => match parsed {
                Some(value) if is_empty_result(&value) => Classification::NotFound,
                Some(_) => Classification::Success,
                None => {
                    tracing::warn!(
                        url = %response.final_url,
                        "Unparseable payload from metadata API"
                    );
                    Classification::Permanent(ErrorClass::Unclassified)
                }
            },
            other => other,
        }
    }
}

fn error_message(value: &Value) -> Option<&str> {
    if value.get("Response").and_then(Value::as_str) == Some("False")
        && value.get("Error").is_none()
    {
        return Some("not found");
    }
    ERROR_FIELDS
        .iter()
        .find_map(|field| value.get(*field).and_then(Value::as_str))
}

fn is_empty_result(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(_) => RESULT_FIELDS.iter().any(|field| {
            value
                .get(*field)
                .and_then(Value::as_array)
                .is_some_and(Vec::is_empty)
        }),
        _ => false,
    }
}

/// Lookups against one metadata provider through the shared fetcher.
///
/// Results are cached positively and negatively. When keys are configured
/// they rotate per call and are sent as a query parameter; the cache key is
/// the URL without the key.
#[derive(Clone)]
pub struct JsonApiClient<T: Transport> {
    fetcher: ResilientFetcher<T>,
    policy: FetchPolicy,
    credentials: Option<(String, CredentialPool)>,
}

impl<T: Transport> JsonApiClient<T> {
    pub fn new(provider: impl Into<String>, fetcher: ResilientFetcher<T>) -> Self {
        let policy = FetchPolicy::for_api(provider, fetcher.retry_config())
            .with_classifier(Arc::new(JsonApiClassifier::default()));
        Self {
            fetcher,
            policy,
            credentials: None,
        }
    }

    /// Rotates `keys`, sending the chosen one as `?{param}=<key>`.
    pub fn with_credentials(mut self, param: impl Into<String>, keys: Vec<String>) -> Self {
        let pool = CredentialPool::new(
            self.policy.source.clone(),
            keys,
            self.fetcher.rate_limiter().clone(),
        );
        self.credentials = Some((param.into(), pool));
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ResponseClassifier>) -> Self {
        self.policy = self.policy.with_classifier(classifier);
        self
    }

    pub fn with_policy(mut self, f: impl FnOnce(FetchPolicy) -> FetchPolicy) -> Self {
        self.policy = f(self.policy);
        self
    }

    pub fn provider(&self) -> &str {
        &self.policy.source
    }

    pub fn fetcher(&self) -> &ResilientFetcher<T> {
        &self.fetcher
    }

    pub async fn lookup(&self, url: &str) -> FetchOutcome {
        let mut request = FetchRequest::get(url);
        let mut policy = self.policy.clone();

        if let Some((param, pool)) = &self.credentials {
            match pool.select() {
                Ok(credential) => {
                    policy = policy.with_credential(credential);
                    request = request.with_credential_param(param.as_str());
                }
                Err(e) => {
                    tracing::warn!(provider = %self.provider(), error = %e, "No usable key");
                    return FetchOutcome::PermanentFailure(ErrorClass::CredentialExhausted);
                }
            }
        }

        self.fetcher.fetch(&request, &policy).await
    }

    /// [`lookup`](Self::lookup) decoded as JSON; `None` when the provider has
    /// no match.
    pub async fn lookup_json(&self, url: &str) -> Result<Option<Value>, AppError> {
        match self.lookup(url).await {
            FetchOutcome::Success(fetched) => Ok(Some(serde_json::from_str(&fetched.body)?)),
            FetchOutcome::NotFound => Ok(None),
            FetchOutcome::Blocked => Err(AppError::Generic(format!(
                "{} is blocked after repeated errors",
                self.provider()
            ))),
            FetchOutcome::PermanentFailure(ErrorClass::CredentialExhausted) => {
                Err(AppError::CredentialExhausted(self.provider().to_string()))
            }
            FetchOutcome::TransientFailure(class) | FetchOutcome::PermanentFailure(class) => Err(
                AppError::HttpError(format!("{} lookup failed: {class}", self.provider())),
            ),
        }
    }
}
