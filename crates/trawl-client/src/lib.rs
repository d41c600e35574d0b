pub mod api;
#[cfg(feature = "browser")]
pub mod browser;
pub mod http;
pub mod listing;
pub mod mirror;

pub use api::{JsonApiClassifier, JsonApiClient};
#[cfg(feature = "browser")]
pub use browser::BrowserTransport;
pub use http::HttpTransport;
pub use listing::{Pagination, SelectorListing};
pub use mirror::MirrorFallback;
