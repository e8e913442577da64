//! The control plane a crawl engine drives.
//!
//! A `ControlPlane` owns everything shared across one run: the middleware chain (idle
//! watchdog, eviction policies, dedup, proxy and user-agent assignment), the record
//! pipelines with their processor task, the optional fan-out server, the abort signal
//! and the statistics. The engine calls [`ControlPlane::process_request`] before each
//! dispatch, [`ControlPlane::process_response`] on each response, and
//! [`ControlPlane::submit_item`] for every extracted record; it watches
//! [`ControlPlane::abort_signal`] to know when to stop scheduling.

use super::item_processor::spawn_item_processor_task;
use super::middleware_manager::MiddlewareManager;
use crate::abort::{AbortReason, AbortSignal};
use crate::dedup::DedupGuard;
use crate::error::CrawlError;
use crate::fanout::ItemFanout;
use crate::middleware::MiddlewareAction;
use crate::pipeline::Pipeline;
use crate::proxy::ProxyPool;
use crate::records::CrawlRecord;
use crate::request::{Request, Response};
use crate::stats::StatCollector;
use futures_util::future::join_all;
use kanal::{bounded_async, AsyncSender};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// How long shutdown waits for in-flight records before abandoning them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

struct Running {
    item_tx: AsyncSender<CrawlRecord>,
    processor: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct ControlPlane {
    middlewares: MiddlewareManager,
    pipelines: Arc<Vec<Box<dyn Pipeline<CrawlRecord>>>>,
    pool: Arc<ProxyPool>,
    dedup: Arc<DedupGuard>,
    fanout: Option<Arc<ItemFanout>>,
    abort: AbortSignal,
    stats: Arc<StatCollector>,
    max_concurrent_pipelines: usize,
    channel_capacity: usize,
    running: Mutex<Option<Running>>,
}

impl ControlPlane {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        middlewares: MiddlewareManager,
        pipelines: Vec<Box<dyn Pipeline<CrawlRecord>>>,
        pool: Arc<ProxyPool>,
        dedup: Arc<DedupGuard>,
        fanout: Option<Arc<ItemFanout>>,
        abort: AbortSignal,
        stats: Arc<StatCollector>,
        max_concurrent_pipelines: usize,
        channel_capacity: usize,
    ) -> Self {
        Self {
            middlewares,
            pipelines: Arc::new(pipelines),
            pool,
            dedup,
            fanout,
            abort,
            stats,
            max_concurrent_pipelines,
            channel_capacity,
            running: Mutex::new(None),
        }
    }

    /// Starts the fan-out server (when configured) and the record processor.
    ///
    /// Returns the fan-out address. Calling `start` on a running control plane is a no-op.
    pub async fn start(&self) -> Result<Option<SocketAddr>, CrawlError> {
        if self.running.lock().is_some() {
            return Ok(self.fanout.as_ref().and_then(|f| f.local_addr()));
        }

        info!(
            "Control plane starting: middlewares=[{}], pipelines={}, max_concurrent_pipelines={}",
            self.middlewares.names().join(", "),
            self.pipelines.len(),
            self.max_concurrent_pipelines
        );

        let fanout_addr = match &self.fanout {
            Some(fanout) => Some(fanout.start().await?),
            None => None,
        };

        let (item_tx, item_rx) = bounded_async(self.channel_capacity.max(1));
        let cancel = CancellationToken::new();
        let processor = spawn_item_processor_task(
            item_rx,
            self.pipelines.clone(),
            self.max_concurrent_pipelines,
            self.stats.clone(),
            cancel.clone(),
        );

        let mut running = self.running.lock();
        if running.is_some() {
            // Lost a race with a concurrent start; the other one wins.
            processor.abort();
        } else {
            *running = Some(Running {
                item_tx,
                processor,
                cancel,
            });
        }
        Ok(fanout_addr)
    }

    /// Runs a request through the middleware chain before dispatch.
    pub async fn process_request(
        &self,
        request: Request,
    ) -> Result<MiddlewareAction<Request>, CrawlError> {
        if self.abort.is_aborted() {
            trace!("Run aborted, dropping <{}>", request.url);
            self.stats.increment_requests_dropped();
            return Ok(MiddlewareAction::Drop);
        }

        let action = self.middlewares.process_request(request).await?;
        match &action {
            MiddlewareAction::Continue(_) => self.stats.increment_requests_admitted(),
            MiddlewareAction::Retry(_, _) => self.stats.increment_requests_retried(),
            MiddlewareAction::Drop => self.stats.increment_requests_dropped(),
        }
        Ok(action)
    }

    /// Runs a response through the middleware chain in reverse order.
    pub async fn process_response(
        &self,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, CrawlError> {
        self.stats.record_response_status(response.status.as_u16());
        let action = self.middlewares.process_response(response).await?;
        if let MiddlewareAction::Retry(request, _) = &action {
            debug!("Re-issuing <{}>", request.url);
            self.stats.increment_requests_retried();
        }
        Ok(action)
    }

    /// Hands an extracted record to the pipelines.
    ///
    /// Waits for channel capacity; fails when the control plane is not running.
    pub async fn submit_item(&self, record: CrawlRecord) -> Result<(), CrawlError> {
        let sender = self
            .running
            .lock()
            .as_ref()
            .map(|running| running.item_tx.clone())
            .ok_or_else(|| CrawlError::General("control plane is not running".to_string()))?;

        self.stats.increment_items_received();
        sender
            .send(record)
            .await
            .map_err(|e| CrawlError::General(format!("record channel closed: {}", e)))
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Asks the run to stop. Returns `false` if it was already aborted.
    pub fn request_abort(&self, reason: impl Into<String>) -> bool {
        self.abort.abort(AbortReason::Requested(reason.into()))
    }

    pub fn stats(&self) -> Arc<StatCollector> {
        Arc::clone(&self.stats)
    }

    pub fn proxy_pool(&self) -> Arc<ProxyPool> {
        Arc::clone(&self.pool)
    }

    pub fn dedup_guard(&self) -> Arc<DedupGuard> {
        Arc::clone(&self.dedup)
    }

    pub fn fanout_addr(&self) -> Option<SocketAddr> {
        self.fanout.as_ref().and_then(|f| f.local_addr())
    }

    /// Stops the fan-out listener, drains submitted records, closes the pipelines and
    /// logs how the run ended.
    ///
    /// Records still in a pipeline after the drain timeout are abandoned before any
    /// pipeline is closed.
    pub async fn shutdown(&self) {
        if let Some(fanout) = &self.fanout {
            fanout.stop().await;
        }

        let running = self.running.lock().take();
        if let Some(Running {
            item_tx,
            mut processor,
            cancel,
        }) = running
        {
            trace!("Closing record channel");
            drop(item_tx);
            let finished = match tokio::time::timeout(DRAIN_TIMEOUT, &mut processor).await {
                Ok(finished) => finished,
                Err(_) => {
                    warn!(
                        "Records did not drain within {}s, abandoning them",
                        DRAIN_TIMEOUT.as_secs()
                    );
                    cancel.cancel();
                    processor.await
                }
            };
            match finished {
                Ok(()) => trace!("Item processor finished"),
                Err(e) => error!("Item processor failed during shutdown: {}", e),
            }
        }

        info!("Closing item pipelines...");
        let closing_futures: Vec<_> = self.pipelines.iter().map(|p| p.close()).collect();
        join_all(closing_futures).await;
        debug!("All item pipelines closed");

        match self.abort.reason() {
            Some(reason) => error!("Crawl aborted: {}", reason),
            None => info!("Crawl finished."),
        }
        info!("{}", self.stats);
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::ControlPlaneBuilder;
    use crate::error::CrawlError;
    use crate::pipeline::Pipeline;
    use crate::records::{CrawlRecord, SoldHouse};
    use crate::settings::Settings;
    use crate::store::MemoryBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Holds every record forever; remembers whether its work was gone when closed.
    #[derive(Default)]
    struct Hang {
        in_flight: Arc<AtomicBool>,
        busy_at_close: Arc<AtomicBool>,
    }

    struct InFlight(Arc<AtomicBool>);

    impl Drop for InFlight {
        fn drop(&mut self) {
            self.0.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Pipeline<CrawlRecord> for Hang {
        fn name(&self) -> &str {
            "Hang"
        }

        async fn process_item(
            &self,
            _item: CrawlRecord,
        ) -> Result<Option<CrawlRecord>, CrawlError> {
            self.in_flight.store(true, Ordering::SeqCst);
            let _guard = InFlight(self.in_flight.clone());
            std::future::pending().await
        }

        async fn close(&self) {
            self.busy_at_close
                .store(self.in_flight.load(Ordering::SeqCst), Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_stuck_records_before_closing() {
        let hang = Hang::default();
        let in_flight = hang.in_flight.clone();
        let busy_at_close = hang.busy_at_close.clone();
        let control = ControlPlaneBuilder::new(Settings::default())
            .connector(MemoryBackend::new().connector())
            .add_pipeline(hang)
            .build()
            .await
            .unwrap();
        control.start().await.unwrap();

        control
            .submit_item(CrawlRecord::Sold(SoldHouse {
                id: Some("9".into()),
                deal: Some("2017.05.01".into()),
                ..Default::default()
            }))
            .await
            .unwrap();
        while !in_flight.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        control.shutdown().await;
        assert!(!in_flight.load(Ordering::SeqCst));
        assert!(!busy_at_close.load(Ordering::SeqCst));
    }
}
