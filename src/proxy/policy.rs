//! Proxy eviction policies.
//!
//! A proxy moves `active -> active(+1 strike)` on every failure tied to it and becomes
//! `evicted` (terminal) when its strikes reach the threshold, or immediately when a
//! response redirects it to the captcha page. Evicting the last proxy aborts the run.

use super::pool::{EvictionOutcome, ProxyEndpoint, ProxyPool, StrikeOutcome};
use crate::abort::{AbortReason, AbortSignal};
use crate::error::CrawlError;
use crate::middleware::{Middleware, MiddlewareAction};
use crate::request::{Request, Response};
use crate::stats::StatCollector;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bans a proxy after `threshold` failures.
///
/// The engine re-issues a timed-out request with `retry_times` incremented and the
/// proxy it used still recorded in its meta; this policy sees that request before a
/// new proxy is assigned and charges the failure to the old one.
pub struct RetryEvictionPolicy {
    pool: Arc<ProxyPool>,
    threshold: u32,
    abort: AbortSignal,
    stats: Arc<StatCollector>,
}

impl RetryEvictionPolicy {
    pub fn new(
        pool: Arc<ProxyPool>,
        threshold: u32,
        abort: AbortSignal,
        stats: Arc<StatCollector>,
    ) -> Self {
        Self {
            pool,
            threshold: threshold.max(1),
            abort,
            stats,
        }
    }

    /// Charges one failure to `proxy`.
    pub async fn on_proxy_failure(&self, proxy: &ProxyEndpoint) -> StrikeOutcome {
        self.stats.increment_proxy_strikes();
        let outcome = self.pool.strike(proxy, self.threshold).await;
        if let StrikeOutcome::Evicted(eviction) = outcome {
            self.stats.increment_proxies_evicted_by_retry();
            signal_if_exhausted(eviction, &self.abort);
        }
        outcome
    }
}

#[async_trait]
impl Middleware for RetryEvictionPolicy {
    fn name(&self) -> &str {
        "RetryEvictionPolicy"
    }

    async fn process_request(
        &self,
        request: Request,
    ) -> Result<MiddlewareAction<Request>, CrawlError> {
        if request.meta.retry_times > 0 {
            if let Some(proxy) = request.meta.proxy.as_deref() {
                debug!("Crawl <{}> timeout with proxy: {}", request.url, proxy);
                self.on_proxy_failure(&ProxyEndpoint::new(proxy)).await;
            }
        }
        Ok(MiddlewareAction::Continue(request))
    }
}

/// Bans the proxy of any request redirected to a captcha page and re-issues the request.
pub struct CaptchaEvictionPolicy {
    pool: Arc<ProxyPool>,
    marker: String,
    abort: AbortSignal,
    stats: Arc<StatCollector>,
}

impl CaptchaEvictionPolicy {
    pub fn new(
        pool: Arc<ProxyPool>,
        marker: impl Into<String>,
        abort: AbortSignal,
        stats: Arc<StatCollector>,
    ) -> Self {
        Self {
            pool,
            marker: marker.into(),
            abort,
            stats,
        }
    }

    fn is_captcha(&self, response: &Response) -> bool {
        if !response.is_redirect() {
            return false;
        }
        response
            .location()
            .map(|location| location.as_str().contains(self.marker.as_str()))
            .unwrap_or(false)
    }
}

/// The re-issued form of a request that hit a captcha: same URL, body-less GET, no
/// content headers, proxy unassigned.
pub fn reissue_without_body(request: &Request) -> Request {
    let mut next = request.clone();
    next.method = Method::GET;
    next.body = Bytes::new();
    next.headers.remove(CONTENT_TYPE);
    next.headers.remove(CONTENT_LENGTH);
    next.meta.proxy = None;
    next
}

#[async_trait]
impl Middleware for CaptchaEvictionPolicy {
    fn name(&self) -> &str {
        "CaptchaEvictionPolicy"
    }

    async fn process_response(
        &self,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, CrawlError> {
        if !self.is_captcha(&response) {
            return Ok(MiddlewareAction::Continue(response));
        }

        self.stats.increment_captcha_hits();
        let request = response.request_from_response();
        if let Some(proxy) = request.meta.proxy.as_deref() {
            warn!(
                "Request <{}> redirected to captcha using proxy: {}",
                request.url, proxy
            );
            let eviction = self.pool.evict(&ProxyEndpoint::new(proxy)).await;
            if eviction.newly_evicted {
                self.stats.increment_proxies_evicted_by_captcha();
            }
            signal_if_exhausted(eviction, &self.abort);
        } else {
            warn!("Request <{}> redirected to captcha without proxy", request.url);
        }

        Ok(MiddlewareAction::Retry(
            Box::new(reissue_without_body(request)),
            Duration::ZERO,
        ))
    }
}

fn signal_if_exhausted(eviction: EvictionOutcome, abort: &AbortSignal) {
    if eviction.pool_empty {
        abort.abort(AbortReason::NoProxyCapacity);
    }
}
