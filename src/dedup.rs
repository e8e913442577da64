//! # Dedup Module
//!
//! Keeps a crawl from re-fetching targets it already processed in the current epoch.
//!
//! ## Overview
//!
//! A request opts in through `meta.check_crawled`. Before dispatch its fingerprint,
//! the hex MD5 digest of the URL followed by the optional epoch suffix, is looked up in
//! the history table; any row means the target was crawled and the request is dropped.
//! Only after a 2xx response is a marker written, so a failing URL is never marked done
//! and a crash between dispatch and record costs at most one re-crawl.
//!
//! Marker rows expire on the store side (column-family TTL), which bounds the table and
//! lets a URL be crawled again in a later epoch.

use crate::abort::{AbortReason, AbortSignal};
use crate::error::CrawlError;
use crate::middleware::{Middleware, MiddlewareAction};
use crate::request::{Request, Response};
use crate::stats::StatCollector;
use crate::store::{column, ColumnFamily, Mutation, RowStore};
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Column family of dedup marker rows.
pub const DEDUP_FAMILY: &str = "cf";
/// Qualifier of dedup marker rows.
pub const DEDUP_QUALIFIER: &str = "0";

/// Hex MD5 of `url` followed by `suffix`.
pub fn fingerprint(url: &str, suffix: Option<&str>) -> String {
    let mut context = md5::Context::new();
    context.consume(url.as_bytes());
    if let Some(suffix) = suffix {
        context.consume(suffix.as_bytes());
    }
    format!("{:x}", context.compute())
}

/// Day-stamp suffix (`yymmdd`) scoping dedup to one calendar day.
pub fn crawl_epoch(day: NaiveDate) -> String {
    day.format("%y%m%d").to_string()
}

/// Today's epoch suffix in local time.
pub fn current_epoch() -> String {
    crawl_epoch(Local::now().date_naive())
}

pub struct DedupGuard {
    store: Arc<dyn RowStore>,
    ttl_secs: u64,
}

impl DedupGuard {
    pub fn new(store: Arc<dyn RowStore>, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    /// Table layout: a single marker family expiring after one epoch.
    pub fn families(&self) -> Vec<ColumnFamily> {
        vec![ColumnFamily::new(DEDUP_FAMILY).with_ttl(self.ttl_secs)]
    }

    pub async fn ensure_table(&self) -> Result<(), CrawlError> {
        self.store.ensure_table(&self.families()).await?;
        Ok(())
    }

    /// Whether `url` was already recorded within the epoch `suffix`.
    pub async fn should_skip(&self, url: &str, suffix: Option<&str>) -> Result<bool, CrawlError> {
        let key = fingerprint(url, suffix);
        let columns = [column(DEDUP_FAMILY, DEDUP_QUALIFIER)];
        let rows = self.store.get(&key, &columns).await?;
        Ok(!rows.is_empty())
    }

    /// Marks `url` as crawled within the epoch `suffix`. Idempotent.
    pub async fn record(&self, url: &str, suffix: Option<&str>) -> Result<(), CrawlError> {
        let key = fingerprint(url, suffix);
        self.store
            .put(&key, vec![Mutation::marker(DEDUP_FAMILY, DEDUP_QUALIFIER)])
            .await?;
        Ok(())
    }
}

/// Hooks the guard into the request/response chain.
///
/// A failed lookup drops the request, since its crawl state is unknown. When the
/// history store is unreachable even after reconnecting, the run is aborted. Failures
/// to record are logged and counted only.
pub struct DedupMiddleware {
    guard: Arc<DedupGuard>,
    abort: AbortSignal,
    stats: Arc<StatCollector>,
}

impl DedupMiddleware {
    pub fn new(guard: Arc<DedupGuard>, abort: AbortSignal, stats: Arc<StatCollector>) -> Self {
        Self {
            guard,
            abort,
            stats,
        }
    }
}

#[async_trait]
impl Middleware for DedupMiddleware {
    fn name(&self) -> &str {
        "DedupMiddleware"
    }

    async fn process_request(
        &self,
        request: Request,
    ) -> Result<MiddlewareAction<Request>, CrawlError> {
        if !request.meta.check_crawled {
            return Ok(MiddlewareAction::Continue(request));
        }

        trace!("Checking requested history for <{}>", request.url);
        match self
            .guard
            .should_skip(request.url.as_str(), request.meta.suffix.as_deref())
            .await
        {
            Ok(true) => {
                debug!("Request crawled: <{}>, ignore it", request.url);
                self.stats.increment_dedup_skipped();
                Ok(MiddlewareAction::Drop)
            }
            Ok(false) => Ok(MiddlewareAction::Continue(request)),
            Err(e) => {
                warn!("History lookup failed for <{}>, dropping it: {}", request.url, e);
                self.stats.increment_dedup_errors();
                if e.is_store_unavailable() {
                    self.abort
                        .abort(AbortReason::StoreUnavailable(format!("history lookup: {}", e)));
                }
                Ok(MiddlewareAction::Drop)
            }
        }
    }

    async fn process_response(
        &self,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, CrawlError> {
        let request = response.request_from_response();
        if request.meta.check_crawled && response.is_success() {
            trace!("Recording <{}> into request history", request.url);
            match self
                .guard
                .record(request.url.as_str(), request.meta.suffix.as_deref())
                .await
            {
                Ok(()) => self.stats.increment_dedup_recorded(),
                Err(e) => {
                    warn!("Failed to record <{}> into history: {}", request.url, e);
                    self.stats.increment_dedup_errors();
                }
            }
        }
        Ok(MiddlewareAction::Continue(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, RemoteStoreClient, TcpConnector};
    use http::StatusCode;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn guard(backend: &MemoryBackend, ttl_secs: u64) -> Arc<DedupGuard> {
        Arc::new(DedupGuard::new(Arc::new(backend.client("history")), ttl_secs))
    }

    #[test]
    fn fingerprint_is_md5_of_url_and_suffix() {
        assert_eq!(
            fingerprint("http://x/1", Some("200101")),
            format!("{:x}", md5::compute(b"http://x/1200101"))
        );
        assert_eq!(
            fingerprint("http://x/1", None),
            format!("{:x}", md5::compute(b"http://x/1"))
        );
        assert_ne!(
            fingerprint("http://x/1", Some("200101")),
            fingerprint("http://x/1", Some("200102"))
        );
        assert_eq!(fingerprint("", None), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn epoch_is_day_stamp() {
        let day = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        assert_eq!(crawl_epoch(day), "200101");
    }

    #[tokio::test]
    async fn epoch_scoped_dedup_scenario() {
        let backend = MemoryBackend::new();
        let guard = guard(&backend, 86_400);
        guard.ensure_table().await.unwrap();

        assert!(!guard.should_skip("http://x/1", Some("200101")).await.unwrap());
        guard.record("http://x/1", Some("200101")).await.unwrap();
        assert!(guard.should_skip("http://x/1", Some("200101")).await.unwrap());
        assert!(!guard.should_skip("http://x/1", Some("200102")).await.unwrap());

        guard.record("http://x/1", Some("200101")).await.unwrap();
        assert!(guard.should_skip("http://x/1", Some("200101")).await.unwrap());
        assert_eq!(backend.live_rows("history"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn markers_expire_with_epoch() {
        let backend = MemoryBackend::new();
        let guard = guard(&backend, 3_600);
        guard.ensure_table().await.unwrap();

        guard.record("http://x/2", None).await.unwrap();
        assert!(guard.should_skip("http://x/2", None).await.unwrap());

        tokio::time::advance(Duration::from_secs(3_601)).await;
        assert!(!guard.should_skip("http://x/2", None).await.unwrap());
    }

    #[tokio::test]
    async fn middleware_records_only_successes() {
        let backend = MemoryBackend::new();
        let guard = guard(&backend, 86_400);
        guard.ensure_table().await.unwrap();
        let stats = Arc::new(StatCollector::new());
        let middleware = DedupMiddleware::new(guard.clone(), AbortSignal::new(), stats.clone());

        let request = Request::get("https://bj.lianjia.com/ershoufang/101.html")
            .unwrap()
            .check_crawled(Some("200101"));

        let failed = Response::new(request.clone(), StatusCode::SERVICE_UNAVAILABLE);
        middleware.process_response(failed).await.unwrap();
        assert!(matches!(
            middleware.process_request(request.clone()).await.unwrap(),
            MiddlewareAction::Continue(_)
        ));

        let ok = Response::new(request.clone(), StatusCode::OK);
        middleware.process_response(ok).await.unwrap();
        assert!(matches!(
            middleware.process_request(request).await.unwrap(),
            MiddlewareAction::Drop
        ));
        assert_eq!(stats.dedup_recorded.load(Ordering::SeqCst), 1);
        assert_eq!(stats.dedup_skipped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unflagged_requests_bypass_history() {
        let backend = MemoryBackend::new();
        let guard = guard(&backend, 86_400);
        guard.ensure_table().await.unwrap();
        let middleware = DedupMiddleware::new(
            guard.clone(),
            AbortSignal::new(),
            Arc::new(StatCollector::new()),
        );

        let request = Request::get("https://bj.lianjia.com/ershoufang/").unwrap();
        middleware
            .process_response(Response::new(request.clone(), StatusCode::OK))
            .await
            .unwrap();
        assert_eq!(backend.live_rows("history"), 0);
    }

    #[tokio::test]
    async fn rejected_lookup_drops_request() {
        // Table never created: lookups are rejected by the store.
        let backend = MemoryBackend::new();
        let abort = AbortSignal::new();
        let stats = Arc::new(StatCollector::new());
        let middleware =
            DedupMiddleware::new(guard(&backend, 86_400), abort.clone(), stats.clone());

        let request = Request::get("https://bj.lianjia.com/ershoufang/7.html")
            .unwrap()
            .check_crawled(None);
        assert!(matches!(
            middleware.process_request(request).await.unwrap(),
            MiddlewareAction::Drop
        ));
        assert_eq!(stats.dedup_errors.load(Ordering::SeqCst), 1);
        assert!(!abort.is_aborted());
    }

    #[tokio::test]
    async fn unreachable_history_aborts_run() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = Arc::new(RemoteStoreClient::new(
            TcpConnector::new(addr.to_string(), Duration::from_millis(500)),
            "history",
        ));
        let abort = AbortSignal::new();
        let middleware = DedupMiddleware::new(
            Arc::new(DedupGuard::new(store, 86_400)),
            abort.clone(),
            Arc::new(StatCollector::new()),
        );

        let request = Request::get("https://bj.lianjia.com/ershoufang/8.html")
            .unwrap()
            .check_crawled(Some("200101"));
        assert!(matches!(
            middleware.process_request(request).await.unwrap(),
            MiddlewareAction::Drop
        ));
        assert!(matches!(
            abort.reason(),
            Some(AbortReason::StoreUnavailable(_))
        ));
    }
}
