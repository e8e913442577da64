//! # Error Module
//!
//! Error types shared by every control-plane component.
//!
//! `StoreError` describes what went wrong while talking to the remote row store;
//! `CrawlError` is the crate-wide error returned by the proxy pool, the dedup guard,
//! pipelines and the builder. Faults that end a run are not returned as errors from
//! request hooks; they are raised through [`AbortSignal`](crate::abort::AbortSignal).

use crate::abort::AbortReason;
use std::time::Duration;
use thiserror::Error;

/// Application-level error kinds reported by the store itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RemoteErrorKind {
    /// The addressed table does not exist.
    TableNotFound,
    /// A table with the same name already exists.
    AlreadyExists,
    /// The store rejected the call for another reason.
    Rejected,
}

/// Errors produced by the remote store client.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection broke or could not be opened.
    #[error("store transport fault: {0}")]
    Transport(#[from] std::io::Error),

    /// A frame could not be encoded or decoded.
    #[error("store codec error: {0}")]
    Codec(String),

    /// The store answered with an error.
    #[error("store rejected {kind:?}: {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    /// The call failed again after the connection was reopened.
    #[error("store unavailable during {operation}: {source}")]
    Unavailable {
        operation: &'static str,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    /// Whether the fault is worth one reconnect-and-retry.
    pub fn is_transport(&self) -> bool {
        matches!(self, StoreError::Transport(_) | StoreError::Codec(_))
    }

    /// Whether the store reported the addressed table as missing.
    pub fn is_table_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::Remote {
                kind: RemoteErrorKind::TableNotFound,
                ..
            }
        )
    }

    /// Whether the store reported that the table already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            StoreError::Remote {
                kind: RemoteErrorKind::AlreadyExists,
                ..
            }
        )
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// The crate-wide error type.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("proxy pool is empty")]
    EmptyProxyPool,

    #[error("no item produced within {window:?}")]
    IdleTimeout { window: Duration },

    #[error("malformed {variant} record: {reason}")]
    MalformedRecord {
        variant: &'static str,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("crawl aborted: {0}")]
    Aborted(AbortReason),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    General(String),
}

impl CrawlError {
    /// Whether a store call failed even after reconnecting.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, CrawlError::Store(StoreError::Unavailable { .. }))
    }
}

impl From<config::ConfigError> for CrawlError {
    fn from(e: config::ConfigError) -> Self {
        CrawlError::Configuration(e.to_string())
    }
}
