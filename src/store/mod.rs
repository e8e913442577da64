//! # Store Module
//!
//! Access to the remote column-oriented row store that backs dedup markers, the proxy
//! list and persisted records.
//!
//! ## Overview
//!
//! Every entity is one row addressed by a string key. Cells are addressed as
//! `family:qualifier` and hold opaque bytes. Column families carry an optional
//! store-side time-to-live so marker rows expire on their own.
//!
//! ## Key Components
//!
//! - **RowStore**: the table-bound async interface the rest of the crate depends on
//! - **RemoteStoreClient**: RPC client with a single reconnect-and-retry on transport faults
//! - **TcpConnector**: length-prefixed MessagePack frames over TCP
//! - **MemoryBackend**: in-process store honoring column-family TTLs, for tests and dry runs

mod client;
mod memory;
mod tcp;

pub use client::{Connector, RemoteStoreClient, StoreConnection};
pub use memory::{MemoryBackend, MemoryConnector};
pub use tcp::{FramedConnection, TcpConnector};

use crate::error::{RemoteErrorKind, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Formats a `family:qualifier` column name.
pub fn column(family: &str, qualifier: &str) -> String {
    format!("{}:{}", family, qualifier)
}

/// A single cell write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub column: String,
    pub value: Vec<u8>,
}

impl Mutation {
    pub fn put(family: &str, qualifier: &str, value: impl Into<Vec<u8>>) -> Self {
        Self {
            column: column(family, qualifier),
            value: value.into(),
        }
    }

    /// A marker cell: presence is the information.
    pub fn marker(family: &str, qualifier: &str) -> Self {
        Self::put(family, qualifier, Vec::new())
    }
}

/// Column family definition used when creating tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFamily {
    pub name: String,
    pub max_versions: u32,
    /// Cell expiry in seconds; `None` keeps cells forever.
    pub time_to_live: Option<u64>,
}

impl ColumnFamily {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            max_versions: 1,
            time_to_live: None,
        }
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.time_to_live = Some(seconds);
        self
    }
}

/// A row and the cells that matched the query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowResult {
    pub row: String,
    pub columns: BTreeMap<String, Vec<u8>>,
}

impl RowResult {
    pub fn value(&self, family: &str, qualifier: &str) -> Option<&[u8]> {
        self.columns
            .get(&column(family, qualifier))
            .map(Vec::as_slice)
    }
}

/// Row selection for scans. Unset bounds are open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    pub start_row: Option<String>,
    pub stop_row: Option<String>,
    pub prefix: Option<String>,
    /// Columns (`family:qualifier`) or whole families (`family`) to return; empty means all.
    pub columns: Vec<String>,
}

impl ScanFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }

    pub fn matches_row(&self, row: &str) -> bool {
        if let Some(prefix) = &self.prefix {
            if !row.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(start) = &self.start_row {
            if row < start.as_str() {
                return false;
            }
        }
        if let Some(stop) = &self.stop_row {
            if row >= stop.as_str() {
                return false;
            }
        }
        true
    }
}

/// Whether `column` is selected by a list of column or family specs.
pub(crate) fn column_selected(column: &str, selection: &[String]) -> bool {
    if selection.is_empty() {
        return true;
    }
    selection.iter().any(|selector| {
        if selector.contains(':') {
            selector == column
        } else {
            column
                .split_once(':')
                .map(|(family, _)| family == selector)
                .unwrap_or(false)
        }
    })
}

/// One RPC on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreRequest {
    MutateRow {
        table: String,
        row: String,
        mutations: Vec<Mutation>,
    },
    GetRow {
        table: String,
        row: String,
        columns: Vec<String>,
    },
    DeleteRow {
        table: String,
        row: String,
    },
    Scan {
        table: String,
        filter: ScanFilter,
        limit: usize,
    },
    GetColumnDescriptors {
        table: String,
    },
    CreateTable {
        table: String,
        families: Vec<ColumnFamily>,
    },
}

/// The reply to a [`StoreRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreResponse {
    Done,
    Rows(Vec<RowResult>),
    Descriptors(Vec<ColumnFamily>),
    Error {
        kind: RemoteErrorKind,
        message: String,
    },
}

impl StoreResponse {
    pub(crate) fn into_result(self) -> Result<StoreResponse, StoreError> {
        match self {
            StoreResponse::Error { kind, message } => Err(StoreError::Remote { kind, message }),
            other => Ok(other),
        }
    }
}

/// Table-bound access to the row store.
#[async_trait]
pub trait RowStore: Send + Sync + 'static {
    /// The table every call addresses.
    fn table(&self) -> &str;

    async fn put(&self, row: &str, mutations: Vec<Mutation>) -> Result<(), StoreError>;

    /// Point lookup. Returns no rows when nothing (unexpired) matches.
    async fn get(&self, row: &str, columns: &[String]) -> Result<Vec<RowResult>, StoreError>;

    async fn delete(&self, row: &str) -> Result<(), StoreError>;

    async fn scan(&self, filter: &ScanFilter, limit: usize) -> Result<Vec<RowResult>, StoreError>;

    /// Creates the table if absent. An "already exists" race is not an error.
    async fn ensure_table(&self, families: &[ColumnFamily]) -> Result<(), StoreError>;

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_selection() {
        let selection = vec!["cf:0".to_string(), "price".to_string()];
        assert!(column_selected("cf:0", &selection));
        assert!(!column_selected("cf:1", &selection));
        assert!(column_selected("price:total", &selection));
        assert!(!column_selected("basic:price", &selection));
        assert!(column_selected("anything:else", &[]));
    }

    #[test]
    fn scan_bounds() {
        let filter = ScanFilter {
            start_row: Some("b".into()),
            stop_row: Some("d".into()),
            prefix: None,
            columns: Vec::new(),
        };
        assert!(!filter.matches_row("a"));
        assert!(filter.matches_row("b"));
        assert!(filter.matches_row("c9"));
        assert!(!filter.matches_row("d"));

        let prefixed = ScanFilter {
            prefix: Some("http://".into()),
            ..ScanFilter::all()
        };
        assert!(prefixed.matches_row("http://10.0.0.1:80"));
        assert!(!prefixed.matches_row("socks5://10.0.0.1:80"));
    }

    #[test]
    fn error_reply_becomes_remote_error() {
        let reply = StoreResponse::Error {
            kind: RemoteErrorKind::TableNotFound,
            message: "history".into(),
        };
        assert!(reply.into_result().unwrap_err().is_table_not_found());
        assert_eq!(StoreResponse::Done.into_result().unwrap(), StoreResponse::Done);
    }
}
