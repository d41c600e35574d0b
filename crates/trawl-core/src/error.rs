use thiserror::Error;

/// Application-wide error types for trawl.
///
/// These never cross the [`ResilientFetcher`](crate::fetcher::ResilientFetcher)
/// boundary: fetch failures are folded into a
/// [`FetchOutcome`](crate::models::FetchOutcome). `AppError` covers setup,
/// configuration and transport construction.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP client construction or request building failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Reading a configuration file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every call budget of a credential has been consumed.
    #[error("Credential '{0}' is exhausted")]
    CredentialExhausted(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}
