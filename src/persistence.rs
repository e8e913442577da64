//! Persistence pipeline.
//!
//! One pipeline per listing table. A pipeline passes through records of other kinds,
//! drops malformed ones, and writes the rest. A store failure is returned as an error
//! so the record is never reported as saved.

use crate::error::CrawlError;
use crate::pipeline::Pipeline;
use crate::records::{CrawlRecord, RecordKind, RunDate};
use crate::stats::StatCollector;
use crate::store::RowStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PersistencePipeline {
    kind: RecordKind,
    store: Arc<dyn RowStore>,
    date: RunDate,
    stats: Arc<StatCollector>,
    name: String,
}

impl PersistencePipeline {
    pub fn new(
        kind: RecordKind,
        store: Arc<dyn RowStore>,
        date: RunDate,
        stats: Arc<StatCollector>,
    ) -> Self {
        let name = format!("PersistencePipeline({})", store.table());
        Self {
            kind,
            store,
            date,
            stats,
            name,
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }
}

#[async_trait]
impl Pipeline<CrawlRecord> for PersistencePipeline {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), CrawlError> {
        self.store.ensure_table(&self.kind.families()).await?;
        info!("{} ready on table {}", self.kind.name(), self.store.table());
        Ok(())
    }

    async fn process_item(&self, item: CrawlRecord) -> Result<Option<CrawlRecord>, CrawlError> {
        if item.kind() != self.kind {
            return Ok(Some(item));
        }

        let rows = match item.rows(&self.date) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Dropping record: {}", e);
                self.stats.increment_malformed_records();
                return Ok(None);
            }
        };

        for row in rows {
            self.store.put(&row.row, row.mutations).await?;
        }
        debug!(
            "Saved {} {} into {}",
            self.kind.name(),
            item.id().unwrap_or_default(),
            self.store.table()
        );
        self.stats.increment_items_persisted();
        Ok(Some(item))
    }

    async fn close(&self) {
        self.store.close().await;
        debug!("Closed table {}", self.store.table());
    }
}
