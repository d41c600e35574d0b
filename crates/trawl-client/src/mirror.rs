use std::time::Duration;

use futures::future::BoxFuture;
use trawl_core::models::{FetchRequest, RawResponse, TransportError};
use trawl_core::traits::{FallbackResolver, Transport};

/// Fallback that asks a third-party mirror for a copy of the page, e.g. a
/// web archive that serves `{prefix}{original url}`.
///
/// Charged to the render breaker tier under its own name, so a failing
/// mirror gets blocked independently of the sources it stands in for.
#[derive(Clone)]
pub struct MirrorFallback<T: Transport> {
    name: String,
    prefix: String,
    transport: T,
}

impl<T: Transport> MirrorFallback<T> {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>, transport: T) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            transport,
        }
    }

    pub fn mirror_url(&self, url: &str) -> String {
        format!("{}{url}", self.prefix)
    }
}

impl<T: Transport + 'static> FallbackResolver for MirrorFallback<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve<'a>(
        &'a self,
        request: &'a FetchRequest,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RawResponse, TransportError>> {
        Box::pin(async move {
            let mirrored = request.with_url(self.mirror_url(&request.url));
            tracing::debug!(mirror = %self.name, url = %mirrored.url, "Resolving through mirror");
            self.transport.send(&mirrored, timeout).await
        })
    }
}
