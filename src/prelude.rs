//! A "prelude" for users of the `house-core` crate.
//!
//! ```
//! use house_core::prelude::*;
//! ```

pub use crate::{
    async_trait, AbortReason, AbortSignal, ControlPlane, ControlPlaneBuilder, CrawlError,
    CrawlRecord, Settings, StatCollector, StoreError,
};

pub use crate::middleware::{Middleware, MiddlewareAction};
pub use crate::pipeline::Pipeline;
pub use crate::records::{NewHouse, SecondhandHouse, SoldHouse};
pub use crate::request::{Request, Response};
pub use crate::store::{MemoryBackend, RowStore};
