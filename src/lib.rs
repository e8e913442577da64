//! # house-core
//!
//! Crawl control plane for real-estate listing spiders.
//!
//! Provides the pieces a crawl engine plugs in around its dispatch loop: a proxy pool
//! with failure-driven eviction, a dedup guard backed by a remote row store, a
//! fault-tolerant store client, an idle watchdog and a live record fan-out server.
//!
//! ## Example
//!
//! ```rust,ignore
//! use house_core::prelude::*;
//!
//! async fn run(engine: &mut MyEngine) -> Result<(), CrawlError> {
//!     house_core::telemetry::init("info");
//!     let control = ControlPlaneBuilder::new(Settings::load(None)?).build().await?;
//!     control.start().await?;
//!
//!     while let Some(request) = engine.next_request() {
//!         if control.abort_signal().is_aborted() {
//!             break;
//!         }
//!         if let MiddlewareAction::Continue(request) = control.process_request(request).await? {
//!             engine.dispatch(request);
//!         }
//!     }
//!
//!     control.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod abort;
pub mod builder;
pub mod crawler;
pub mod dedup;
pub mod error;
pub mod fanout;
pub mod middleware;
pub mod persistence;
pub mod pipeline;
pub mod prelude;
pub mod proxy;
pub mod records;
pub mod request;
pub mod settings;
pub mod stats;
pub mod store;
pub mod telemetry;
pub mod user_agent;
pub mod watchdog;

pub use abort::{AbortReason, AbortSignal};
pub use builder::{ControlPlaneBuilder, StoreFactory};
pub use crawler::ControlPlane;
pub use error::{CrawlError, StoreError};
pub use records::CrawlRecord;
pub use settings::Settings;
pub use stats::StatCollector;

pub use async_trait::async_trait;
pub use http;
pub use tokio;
