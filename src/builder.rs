//! # Builder Module
//!
//! Provides the `ControlPlaneBuilder`, a fluent API that assembles one run's control
//! plane from [`Settings`].
//!
//! ## Overview
//!
//! Everything shared across requests (the proxy pool, the dedup guard, the idle
//! watchdog, the abort signal, the statistics) is constructed exactly once here and
//! handed to each middleware and pipeline that needs it. `build` also makes sure every
//! table the run touches exists.
//!
//! ## Example
//!
//! ```rust,ignore
//! use house_core::{ControlPlaneBuilder, Settings};
//!
//! let settings = Settings::load(Some("house.toml".as_ref()))?;
//! let control = ControlPlaneBuilder::new(settings).build().await?;
//! control.start().await?;
//! // hand `control` to the engine ...
//! control.shutdown().await;
//! ```

use crate::abort::AbortSignal;
use crate::crawler::{ControlPlane, MiddlewareManager};
use crate::dedup::{DedupGuard, DedupMiddleware};
use crate::error::CrawlError;
use crate::fanout::{FanoutPipeline, ItemFanout};
use crate::middleware::Middleware;
use crate::persistence::PersistencePipeline;
use crate::pipeline::Pipeline;
use crate::proxy::{
    CaptchaEvictionPolicy, ProxyMiddleware, ProxyPool, RetryEvictionPolicy, PROXY_FAMILY,
};
use crate::records::{CrawlRecord, RecordKind, RunDate};
use crate::settings::Settings;
use crate::stats::StatCollector;
use crate::store::{ColumnFamily, Connector, RemoteStoreClient, RowStore, TcpConnector};
use crate::user_agent::UserAgentMiddleware;
use crate::watchdog::IdleWatchdog;
use std::sync::Arc;
use tracing::{debug, info};

/// Opens a table-bound store handle by table name.
pub type StoreFactory = Arc<dyn Fn(&str) -> Arc<dyn RowStore> + Send + Sync>;

pub struct ControlPlaneBuilder {
    settings: Settings,
    store_factory: Option<StoreFactory>,
    user_agents: Option<Vec<String>>,
    middlewares: Vec<Box<dyn Middleware>>,
    item_pipelines: Vec<Box<dyn Pipeline<CrawlRecord>>>,
    abort: Option<AbortSignal>,
    run_date: Option<RunDate>,
}

impl ControlPlaneBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            store_factory: None,
            user_agents: None,
            middlewares: Vec::new(),
            item_pipelines: Vec::new(),
            abort: None,
            run_date: None,
        }
    }

    /// Opens every table through `connector`, one client per table.
    pub fn connector<C>(self, connector: C) -> Self
    where
        C: Connector + Clone,
    {
        self.store_factory(Arc::new(move |table: &str| {
            Arc::new(RemoteStoreClient::new(connector.clone(), table)) as Arc<dyn RowStore>
        }))
    }

    pub fn store_factory(mut self, factory: StoreFactory) -> Self {
        self.store_factory = Some(factory);
        self
    }

    /// Replaces the default user-agent list. An empty list disables the middleware.
    pub fn user_agents(mut self, user_agents: Vec<String>) -> Self {
        self.user_agents = Some(user_agents);
        self
    }

    /// Appends a middleware after the built-in chain.
    pub fn add_middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middlewares.push(Box::new(middleware));
        self
    }

    /// Adds a record pipeline. It runs after persistence and before the fan-out.
    pub fn add_pipeline<P: Pipeline<CrawlRecord>>(mut self, pipeline: P) -> Self {
        self.item_pipelines.push(Box::new(pipeline));
        self
    }

    /// Shares an externally created abort signal with the run.
    pub fn abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Stamps records with `run_date` instead of today.
    pub fn run_date(mut self, run_date: RunDate) -> Self {
        self.run_date = Some(run_date);
        self
    }

    pub fn max_concurrent_pipelines(mut self, limit: usize) -> Self {
        self.settings.crawler.max_concurrent_pipelines = limit;
        self
    }

    pub async fn build(self) -> Result<ControlPlane, CrawlError> {
        let ControlPlaneBuilder {
            settings,
            store_factory,
            user_agents,
            middlewares: extra_middlewares,
            item_pipelines: extra_pipelines,
            abort,
            run_date,
        } = self;
        settings.validate()?;

        let open_table: StoreFactory = store_factory.unwrap_or_else(|| {
            let connector = TcpConnector::new(
                settings.store.address(),
                settings.store.connect_timeout(),
            );
            let factory: StoreFactory = Arc::new(move |table: &str| {
                Arc::new(RemoteStoreClient::new(connector.clone(), table)) as Arc<dyn RowStore>
            });
            factory
        });
        let abort = abort.unwrap_or_default();
        let stats = Arc::new(StatCollector::new());
        let run_date = run_date.unwrap_or_else(RunDate::today);

        let proxy_store = open_table(&settings.store.proxy_table);
        proxy_store
            .ensure_table(&[ColumnFamily::new(PROXY_FAMILY).with_ttl(settings.proxy.row_ttl_secs)])
            .await?;
        let pool = Arc::new(ProxyPool::new(proxy_store, settings.proxy.refresh_ttl()));

        let dedup = Arc::new(DedupGuard::new(
            open_table(&settings.store.history_table),
            settings.dedup.ttl_secs,
        ));
        dedup.ensure_table().await?;

        let watchdog = settings
            .watchdog
            .idle_window()
            .map(|window| Arc::new(IdleWatchdog::new(window, abort.clone())));

        let mut middlewares: Vec<Box<dyn Middleware>> = Vec::new();
        if let Some(watchdog) = &watchdog {
            middlewares.push(Box::new(watchdog.clone()));
        }
        if settings.proxy.retry_threshold > 0 {
            middlewares.push(Box::new(RetryEvictionPolicy::new(
                pool.clone(),
                settings.proxy.retry_threshold,
                abort.clone(),
                stats.clone(),
            )));
        }
        middlewares.push(Box::new(DedupMiddleware::new(
            dedup.clone(),
            abort.clone(),
            stats.clone(),
        )));
        middlewares.push(Box::new(ProxyMiddleware::new(pool.clone(), abort.clone())));
        let user_agent = match user_agents {
            Some(list) => UserAgentMiddleware::new(list),
            None => Some(UserAgentMiddleware::with_defaults()),
        };
        if let Some(user_agent) = user_agent {
            middlewares.push(Box::new(user_agent));
        }
        middlewares.push(Box::new(CaptchaEvictionPolicy::new(
            pool.clone(),
            settings.proxy.captcha_marker.clone(),
            abort.clone(),
            stats.clone(),
        )));
        middlewares.extend(extra_middlewares);

        let mut pipelines: Vec<Box<dyn Pipeline<CrawlRecord>>> = Vec::new();
        for (kind, table) in [
            (RecordKind::Secondhand, &settings.store.secondhand_table),
            (RecordKind::Sold, &settings.store.sold_table),
            (RecordKind::NewHouse, &settings.store.new_house_table),
        ] {
            pipelines.push(Box::new(PersistencePipeline::new(
                kind,
                open_table(table),
                run_date.clone(),
                stats.clone(),
            )));
        }
        pipelines.extend(extra_pipelines);
        let fanout = if settings.fanout.enabled {
            let fanout = Arc::new(ItemFanout::new(&settings.fanout, stats.clone()));
            pipelines.push(Box::new(FanoutPipeline::new(fanout.clone())));
            Some(fanout)
        } else {
            None
        };
        // Last, so only records that made it through every pipeline count as progress.
        if let Some(watchdog) = &watchdog {
            pipelines.push(Box::new(watchdog.clone()));
        }

        for pipeline in &pipelines {
            debug!("Opening pipeline {}", pipeline.name());
            pipeline.open().await?;
        }

        info!(
            "Control plane built: store={}, proxy_refresh={}s, retry_threshold={}, idle_window={:?}, fanout={}",
            settings.store.address(),
            settings.proxy.refresh_ttl_secs,
            settings.proxy.retry_threshold,
            settings.watchdog.idle_window(),
            settings.fanout.enabled
        );

        Ok(ControlPlane::new(
            MiddlewareManager::new(middlewares),
            pipelines,
            pool,
            dedup,
            fanout,
            abort,
            stats,
            settings.crawler.max_concurrent_pipelines,
            settings.crawler.channel_capacity,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortReason;
    use crate::error::StoreError;
    use crate::middleware::MiddlewareAction;
    use crate::records::SecondhandHouse;
    use crate::request::Request;
    use crate::store::{MemoryBackend, Mutation, RowResult, ScanFilter};
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    /// Delegates to a real table but rejects every write.
    struct ReadOnly(Arc<dyn RowStore>);

    #[async_trait]
    impl RowStore for ReadOnly {
        fn table(&self) -> &str {
            self.0.table()
        }

        async fn put(&self, _row: &str, _mutations: Vec<Mutation>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable {
                operation: "put",
                source: Box::new(StoreError::Codec("write refused".into())),
            })
        }

        async fn get(&self, row: &str, columns: &[String]) -> Result<Vec<RowResult>, StoreError> {
            self.0.get(row, columns).await
        }

        async fn delete(&self, row: &str) -> Result<(), StoreError> {
            self.0.delete(row).await
        }

        async fn scan(
            &self,
            filter: &ScanFilter,
            limit: usize,
        ) -> Result<Vec<RowResult>, StoreError> {
            self.0.scan(filter, limit).await
        }

        async fn ensure_table(&self, families: &[ColumnFamily]) -> Result<(), StoreError> {
            self.0.ensure_table(families).await
        }
    }

    #[tokio::test]
    async fn build_creates_every_table() {
        let backend = MemoryBackend::new();
        let control = ControlPlaneBuilder::new(Settings::default())
            .connector(backend.connector())
            .build()
            .await
            .unwrap();

        for table in ["proxies", "history", "second1", "sold1", "new"] {
            assert!(backend.families(table).is_some(), "missing table {}", table);
        }
        assert_eq!(
            backend.families("proxies").unwrap()[0].time_to_live,
            Some(86_400)
        );
        assert!(!control.abort_signal().is_aborted());
    }

    #[tokio::test]
    async fn invalid_settings_fail_fast() {
        let mut settings = Settings::default();
        settings.proxy.captcha_marker.clear();
        let result = ControlPlaneBuilder::new(settings)
            .connector(MemoryBackend::new().connector())
            .build()
            .await;
        assert!(matches!(result, Err(CrawlError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_persist_is_not_progress() {
        let backend = MemoryBackend::new();
        let factory_backend = backend.clone();
        let factory: StoreFactory = Arc::new(move |table: &str| {
            let client: Arc<dyn RowStore> = Arc::new(factory_backend.client(table));
            if table == "second1" {
                Arc::new(ReadOnly(client)) as Arc<dyn RowStore>
            } else {
                client
            }
        });
        let control = ControlPlaneBuilder::new(Settings::default())
            .store_factory(factory)
            .build()
            .await
            .unwrap();
        control.start().await.unwrap();

        control
            .submit_item(CrawlRecord::Secondhand(SecondhandHouse {
                id: Some("101101".into()),
                ..Default::default()
            }))
            .await
            .unwrap();
        let stats = control.stats();
        while stats.items_failed.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        tokio::time::advance(Duration::from_secs(90)).await;
        let request = Request::get("https://bj.lianjia.com/ershoufang/").unwrap();
        assert!(matches!(
            control.process_request(request).await.unwrap(),
            MiddlewareAction::Drop
        ));
        assert_eq!(
            control.abort_signal().reason(),
            Some(AbortReason::NoItemScraped)
        );
        control.shutdown().await;
    }
}
