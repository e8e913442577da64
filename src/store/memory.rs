//! In-process row store.
//!
//! Speaks the same request/response protocol as the remote store, honoring column
//! family TTLs against the tokio clock, so paused-time tests can expire markers.

use super::client::{Connector, StoreConnection};
use super::{
    column_selected, ColumnFamily, RemoteStoreClient, RowResult, StoreRequest, StoreResponse,
};
use crate::error::{RemoteErrorKind, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct Cell {
    value: Vec<u8>,
    written_at: Instant,
}

#[derive(Default)]
struct Table {
    families: Vec<ColumnFamily>,
    rows: BTreeMap<String, BTreeMap<String, Cell>>,
}

impl Table {
    fn ttl_of(&self, column: &str) -> Option<Duration> {
        let family = column.split_once(':').map(|(f, _)| f).unwrap_or(column);
        self.families
            .iter()
            .find(|cf| cf.name == family)
            .and_then(|cf| cf.time_to_live)
            .map(Duration::from_secs)
    }

    fn live_row(&self, row: &str, selection: &[String], now: Instant) -> Option<RowResult> {
        let cells = self.rows.get(row)?;
        let columns: BTreeMap<String, Vec<u8>> = cells
            .iter()
            .filter(|(column, _)| column_selected(column, selection))
            .filter(|(column, cell)| match self.ttl_of(column) {
                Some(ttl) => now.duration_since(cell.written_at) < ttl,
                None => true,
            })
            .map(|(column, cell)| (column.clone(), cell.value.clone()))
            .collect();
        if columns.is_empty() {
            None
        } else {
            Some(RowResult {
                row: row.to_string(),
                columns,
            })
        }
    }
}

/// Shared in-memory tables.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<HashMap<String, Table>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            backend: self.clone(),
        }
    }

    /// A table-bound client going through the regular RPC path.
    pub fn client(&self, table: &str) -> RemoteStoreClient<MemoryConnector> {
        RemoteStoreClient::new(self.connector(), table)
    }

    /// Creates a table directly, replacing an existing one.
    pub fn create_table(&self, table: &str, families: &[ColumnFamily]) {
        self.tables.lock().insert(
            table.to_string(),
            Table {
                families: families.to_vec(),
                rows: BTreeMap::new(),
            },
        );
    }

    pub fn families(&self, table: &str) -> Option<Vec<ColumnFamily>> {
        self.tables.lock().get(table).map(|t| t.families.clone())
    }

    /// Number of rows with at least one unexpired cell.
    pub fn live_rows(&self, table: &str) -> usize {
        let now = Instant::now();
        self.tables
            .lock()
            .get(table)
            .map(|t| {
                t.rows
                    .keys()
                    .filter(|row| t.live_row(row, &[], now).is_some())
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn handle(&self, request: &StoreRequest) -> StoreResponse {
        let now = Instant::now();
        let mut tables = self.tables.lock();

        if let StoreRequest::CreateTable { table, families } = request {
            if tables.contains_key(table) {
                return StoreResponse::Error {
                    kind: RemoteErrorKind::AlreadyExists,
                    message: format!("table {} already exists", table),
                };
            }
            tables.insert(
                table.clone(),
                Table {
                    families: families.clone(),
                    rows: BTreeMap::new(),
                },
            );
            return StoreResponse::Done;
        }

        let table_name = match request {
            StoreRequest::MutateRow { table, .. }
            | StoreRequest::GetRow { table, .. }
            | StoreRequest::DeleteRow { table, .. }
            | StoreRequest::Scan { table, .. }
            | StoreRequest::GetColumnDescriptors { table }
            | StoreRequest::CreateTable { table, .. } => table,
        };
        let Some(table) = tables.get_mut(table_name) else {
            return StoreResponse::Error {
                kind: RemoteErrorKind::TableNotFound,
                message: format!("table {} not found", table_name),
            };
        };

        match request {
            StoreRequest::MutateRow { row, mutations, .. } => {
                for mutation in mutations {
                    let family = mutation.column.split_once(':').map(|(f, _)| f);
                    let known = family
                        .map(|f| table.families.iter().any(|cf| cf.name == f))
                        .unwrap_or(false);
                    if !known {
                        return StoreResponse::Error {
                            kind: RemoteErrorKind::Rejected,
                            message: format!("unknown column family in {}", mutation.column),
                        };
                    }
                }
                let cells = table.rows.entry(row.clone()).or_default();
                for mutation in mutations {
                    cells.insert(
                        mutation.column.clone(),
                        Cell {
                            value: mutation.value.clone(),
                            written_at: now,
                        },
                    );
                }
                StoreResponse::Done
            }
            StoreRequest::GetRow { row, columns, .. } => {
                StoreResponse::Rows(table.live_row(row, columns, now).into_iter().collect())
            }
            StoreRequest::DeleteRow { row, .. } => {
                table.rows.remove(row);
                StoreResponse::Done
            }
            StoreRequest::Scan { filter, limit, .. } => {
                let rows = table
                    .rows
                    .keys()
                    .filter(|row| filter.matches_row(row))
                    .filter_map(|row| table.live_row(row, &filter.columns, now))
                    .take(*limit)
                    .collect();
                StoreResponse::Rows(rows)
            }
            StoreRequest::GetColumnDescriptors { .. } => {
                StoreResponse::Descriptors(table.families.clone())
            }
            StoreRequest::CreateTable { .. } => StoreResponse::Done,
        }
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    backend: MemoryBackend,
}

pub struct MemoryConnection {
    backend: MemoryBackend,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<Self::Connection, StoreError> {
        Ok(MemoryConnection {
            backend: self.backend.clone(),
        })
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn call(&mut self, request: &StoreRequest) -> Result<StoreResponse, StoreError> {
        Ok(self.backend.handle(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Mutation, RowStore, ScanFilter};

    #[tokio::test(start_paused = true)]
    async fn cells_expire_with_family_ttl() {
        let backend = MemoryBackend::new();
        let client = backend.client("history");
        client
            .ensure_table(&[ColumnFamily::new("cf").with_ttl(60)])
            .await
            .unwrap();

        client
            .put("abc", vec![Mutation::marker("cf", "0")])
            .await
            .unwrap();
        assert_eq!(client.get("abc", &[]).await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(client.get("abc", &[]).await.unwrap().is_empty());
        assert_eq!(backend.live_rows("history"), 0);
    }

    #[tokio::test]
    async fn scan_respects_limit_and_order() {
        let backend = MemoryBackend::new();
        let client = backend.client("proxies");
        client.ensure_table(&[ColumnFamily::new("cf")]).await.unwrap();
        for row in ["c", "a", "b"] {
            client
                .put(row, vec![Mutation::marker("cf", "0")])
                .await
                .unwrap();
        }

        let rows = client.scan(&ScanFilter::all(), 2).await.unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r.row.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn unknown_family_is_rejected() {
        let backend = MemoryBackend::new();
        let client = backend.client("history");
        client.ensure_table(&[ColumnFamily::new("cf")]).await.unwrap();

        let err = client
            .put("abc", vec![Mutation::marker("basic", "0")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Remote {
                kind: RemoteErrorKind::Rejected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let backend = MemoryBackend::new();
        let client = backend.client("proxies");
        client.ensure_table(&[ColumnFamily::new("cf")]).await.unwrap();
        client
            .put("http://10.0.0.1:8080", vec![Mutation::marker("cf", "0")])
            .await
            .unwrap();

        client.delete("http://10.0.0.1:8080").await.unwrap();
        assert_eq!(backend.live_rows("proxies"), 0);
    }
}
