//! Item pipeline contract.
//!
//! Pipelines run in registration order for every record. Returning `Ok(None)` drops the
//! record for the remaining pipelines; an `Err` drops it and is counted as a failure.

use crate::error::CrawlError;
use async_trait::async_trait;

#[async_trait]
pub trait Pipeline<I>: Send + Sync + 'static
where
    I: Send + 'static,
{
    fn name(&self) -> &str;

    /// Called once before the first record, e.g. to create tables.
    async fn open(&self) -> Result<(), CrawlError> {
        Ok(())
    }

    async fn process_item(&self, item: I) -> Result<Option<I>, CrawlError>;

    async fn close(&self) {}
}

#[async_trait]
impl<I, P> Pipeline<I> for std::sync::Arc<P>
where
    I: Send + 'static,
    P: Pipeline<I> + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn open(&self) -> Result<(), CrawlError> {
        (**self).open().await
    }

    async fn process_item(&self, item: I) -> Result<Option<I>, CrawlError> {
        (**self).process_item(item).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
