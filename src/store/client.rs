//! Fault-tolerant RPC client for the row store.

use super::{ColumnFamily, Mutation, RowResult, RowStore, ScanFilter, StoreRequest, StoreResponse};
use crate::error::StoreError;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// One physical connection able to carry a single RPC at a time.
#[async_trait]
pub trait StoreConnection: Send + 'static {
    async fn call(&mut self, request: &StoreRequest) -> Result<StoreResponse, StoreError>;

    async fn close(&mut self) {}
}

/// Opens connections to the store.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: StoreConnection;

    async fn connect(&self) -> Result<Self::Connection, StoreError>;
}

/// Table-bound client owning one lazily opened connection.
///
/// Calls are serialized per instance. A transport fault closes the connection, reopens
/// it and retries the same call once; a second consecutive fault is returned as
/// [`StoreError::Unavailable`].
pub struct RemoteStoreClient<C: Connector> {
    connector: C,
    table: String,
    connection: Mutex<Option<C::Connection>>,
}

impl<C: Connector> RemoteStoreClient<C> {
    pub fn new(connector: C, table: impl Into<String>) -> Self {
        Self {
            connector,
            table: table.into(),
            connection: Mutex::new(None),
        }
    }

    async fn call(
        &self,
        operation: &'static str,
        request: StoreRequest,
    ) -> Result<StoreResponse, StoreError> {
        let mut slot = self.connection.lock().await;

        let reply = match self.attempt(&mut slot, &request).await {
            Err(first) if first.is_transport() => {
                warn!(
                    "Store {} on table '{}' hit a transport fault, reopening connection: {}",
                    operation, self.table, first
                );
                match self.attempt(&mut slot, &request).await {
                    Err(second) if second.is_transport() => {
                        return Err(StoreError::Unavailable {
                            operation,
                            source: Box::new(second),
                        });
                    }
                    other => other?,
                }
            }
            other => other?,
        };

        reply.into_result()
    }

    /// Runs one RPC with the connection taken out of `slot`.
    ///
    /// The connection goes back only once a reply was read. A call dropped mid-flight
    /// drops its connection too, so no unread reply is left for the next caller.
    async fn attempt(
        &self,
        slot: &mut Option<C::Connection>,
        request: &StoreRequest,
    ) -> Result<StoreResponse, StoreError> {
        let mut connection = match slot.take() {
            Some(connection) => connection,
            None => {
                debug!("Opening store connection for table '{}'", self.table);
                self.connector.connect().await?
            }
        };

        let reply = connection.call(request).await;
        match &reply {
            Err(e) if e.is_transport() => connection.close().await,
            _ => *slot = Some(connection),
        }
        reply
    }

    async fn discard(slot: &mut Option<C::Connection>) {
        if let Some(mut connection) = slot.take() {
            connection.close().await;
        }
    }
}

#[async_trait]
impl<C: Connector> RowStore for RemoteStoreClient<C> {
    fn table(&self) -> &str {
        &self.table
    }

    async fn put(&self, row: &str, mutations: Vec<Mutation>) -> Result<(), StoreError> {
        trace!("put {}/{} ({} cells)", self.table, row, mutations.len());
        self.call(
            "put",
            StoreRequest::MutateRow {
                table: self.table.clone(),
                row: row.to_string(),
                mutations,
            },
        )
        .await
        .map(|_| ())
    }

    async fn get(&self, row: &str, columns: &[String]) -> Result<Vec<RowResult>, StoreError> {
        let reply = self
            .call(
                "get",
                StoreRequest::GetRow {
                    table: self.table.clone(),
                    row: row.to_string(),
                    columns: columns.to_vec(),
                },
            )
            .await?;
        expect_rows("get", reply)
    }

    async fn delete(&self, row: &str) -> Result<(), StoreError> {
        self.call(
            "delete",
            StoreRequest::DeleteRow {
                table: self.table.clone(),
                row: row.to_string(),
            },
        )
        .await
        .map(|_| ())
    }

    async fn scan(&self, filter: &ScanFilter, limit: usize) -> Result<Vec<RowResult>, StoreError> {
        let reply = self
            .call(
                "scan",
                StoreRequest::Scan {
                    table: self.table.clone(),
                    filter: filter.clone(),
                    limit,
                },
            )
            .await?;
        expect_rows("scan", reply)
    }

    async fn ensure_table(&self, families: &[ColumnFamily]) -> Result<(), StoreError> {
        let probe = self
            .call(
                "ensure_table",
                StoreRequest::GetColumnDescriptors {
                    table: self.table.clone(),
                },
            )
            .await;
        match probe {
            Ok(_) => return Ok(()),
            Err(e) if e.is_table_not_found() => {}
            Err(e) => return Err(e),
        }

        debug!("Creating table '{}'", self.table);
        match self
            .call(
                "ensure_table",
                StoreRequest::CreateTable {
                    table: self.table.clone(),
                    families: families.to_vec(),
                },
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => {
                debug!("Table '{}' was created concurrently", self.table);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self) {
        let mut slot = self.connection.lock().await;
        Self::discard(&mut slot).await;
    }
}

fn expect_rows(operation: &str, reply: StoreResponse) -> Result<Vec<RowResult>, StoreError> {
    match reply {
        StoreResponse::Rows(rows) => Ok(rows),
        other => Err(StoreError::Codec(format!(
            "unexpected reply to {}: {:?}",
            operation, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, MemoryConnector};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Fails the next `faults` calls with a broken pipe, then delegates.
    struct FlakyConnector {
        inner: MemoryConnector,
        faults: Arc<AtomicUsize>,
        connects: Arc<AtomicUsize>,
    }

    struct FlakyConnection {
        inner: <MemoryConnector as Connector>::Connection,
        faults: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StoreConnection for FlakyConnection {
        async fn call(&mut self, request: &StoreRequest) -> Result<StoreResponse, StoreError> {
            let remaining = self.faults.load(Ordering::SeqCst);
            if remaining > 0 {
                self.faults.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Transport(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "simulated",
                )));
            }
            self.inner.call(request).await
        }
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        type Connection = FlakyConnection;

        async fn connect(&self) -> Result<Self::Connection, StoreError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(FlakyConnection {
                inner: self.inner.connect().await?,
                faults: Arc::clone(&self.faults),
            })
        }
    }

    fn flaky_client(
        backend: &MemoryBackend,
        faults: usize,
    ) -> (
        RemoteStoreClient<FlakyConnector>,
        Arc<AtomicUsize>,
        Arc<AtomicUsize>,
    ) {
        let faults = Arc::new(AtomicUsize::new(faults));
        let connects = Arc::new(AtomicUsize::new(0));
        let connector = FlakyConnector {
            inner: backend.connector(),
            faults: Arc::clone(&faults),
            connects: Arc::clone(&connects),
        };
        (RemoteStoreClient::new(connector, "history"), faults, connects)
    }

    #[tokio::test]
    async fn single_fault_is_retried_transparently() {
        let backend = MemoryBackend::new();
        backend.create_table("history", &[ColumnFamily::new("cf")]);
        let (client, _faults, connects) = flaky_client(&backend, 1);

        client
            .put("row-1", vec![Mutation::marker("cf", "0")])
            .await
            .expect("one fault must be absorbed");

        let rows = client.get("row-1", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn two_consecutive_faults_surface_as_unavailable() {
        let backend = MemoryBackend::new();
        backend.create_table("history", &[ColumnFamily::new("cf")]);
        let (client, faults, connects) = flaky_client(&backend, 2);

        let err = client
            .put("row-1", vec![Mutation::marker("cf", "0")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Unavailable {
                operation: "put",
                ..
            }
        ));
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(faults.load(Ordering::SeqCst), 0);
        assert!(client.get("row-1", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_errors_are_not_retried() {
        let backend = MemoryBackend::new();
        let (client, _faults, connects) = flaky_client(&backend, 0);

        let err = client.get("row-1", &[]).await.unwrap_err();
        assert!(err.is_table_not_found());
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ensure_table_is_idempotent() {
        let backend = MemoryBackend::new();
        let (client, _faults, _connects) = flaky_client(&backend, 0);
        let families = [ColumnFamily::new("cf").with_ttl(86_400)];

        client.ensure_table(&families).await.unwrap();
        client.ensure_table(&families).await.unwrap();
        assert_eq!(backend.families("history"), Some(families.to_vec()));
    }
}
