//! # Proxy Module
//!
//! Proxy rotation for outbound requests.
//!
//! - **ProxyPool**: the shared active set, refreshed from the proxy table on a TTL
//! - **ProxyMiddleware**: binds a random active proxy to every outgoing request
//! - **RetryEvictionPolicy** / **CaptchaEvictionPolicy**: decide when a proxy is banned
//!
//! All three hold the same `Arc<ProxyPool>`, built once per run by the builder.

mod policy;
mod pool;

pub use policy::{reissue_without_body, CaptchaEvictionPolicy, RetryEvictionPolicy};
pub use pool::{
    EvictionOutcome, ProxyEndpoint, ProxyPool, StrikeOutcome, PROXY_FAMILY, PROXY_QUALIFIER,
};

use crate::abort::{AbortReason, AbortSignal};
use crate::error::CrawlError;
use crate::middleware::{Middleware, MiddlewareAction};
use crate::request::Request;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

/// Assigns a proxy to each request. Drops the request and aborts the run when the
/// pool has no capacity left.
pub struct ProxyMiddleware {
    pool: Arc<ProxyPool>,
    abort: AbortSignal,
}

impl ProxyMiddleware {
    pub fn new(pool: Arc<ProxyPool>, abort: AbortSignal) -> Self {
        Self { pool, abort }
    }
}

#[async_trait]
impl Middleware for ProxyMiddleware {
    fn name(&self) -> &str {
        "ProxyMiddleware"
    }

    async fn process_request(
        &self,
        mut request: Request,
    ) -> Result<MiddlewareAction<Request>, CrawlError> {
        match self.pool.acquire().await {
            Ok(proxy) => {
                trace!("Using proxy {} for <{}>", proxy, request.url);
                request.meta.proxy = Some(proxy.to_string());
                Ok(MiddlewareAction::Continue(request))
            }
            Err(CrawlError::EmptyProxyPool) => {
                debug!("No proxy left for <{}>, dropping it", request.url);
                self.abort.abort(AbortReason::NoProxyCapacity);
                Ok(MiddlewareAction::Drop)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ColumnFamily, MemoryBackend};
    use std::time::Duration;

    #[tokio::test]
    async fn assigns_proxy_and_overwrites_stale_one() {
        let backend = MemoryBackend::new();
        backend.create_table("proxies", &[ColumnFamily::new(PROXY_FAMILY)]);
        let pool = Arc::new(ProxyPool::new(
            Arc::new(backend.client("proxies")),
            Duration::from_secs(300),
        ));
        pool.publish(&ProxyEndpoint::from("http://b:1")).await.unwrap();
        let middleware = ProxyMiddleware::new(pool, AbortSignal::new());

        let mut request = Request::get("https://bj.lianjia.com/").unwrap();
        request.meta.proxy = Some("http://banned:1".into());
        let MiddlewareAction::Continue(request) = middleware.process_request(request).await.unwrap()
        else {
            panic!("request should continue");
        };
        assert_eq!(request.meta.proxy.as_deref(), Some("http://b:1"));
    }

    #[tokio::test]
    async fn empty_pool_drops_and_aborts() {
        let backend = MemoryBackend::new();
        backend.create_table("proxies", &[ColumnFamily::new(PROXY_FAMILY)]);
        let pool = Arc::new(ProxyPool::new(
            Arc::new(backend.client("proxies")),
            Duration::from_secs(300),
        ));
        let abort = AbortSignal::new();
        let middleware = ProxyMiddleware::new(pool, abort.clone());

        let action = middleware
            .process_request(Request::get("https://bj.lianjia.com/").unwrap())
            .await
            .unwrap();
        assert!(matches!(action, MiddlewareAction::Drop));
        assert_eq!(abort.reason(), Some(AbortReason::NoProxyCapacity));
    }
}
