//! # Middleware Module
//!
//! The hook contract between the crawl engine and the control plane.
//!
//! A request passes every middleware's `process_request` in registration order before
//! it is dispatched; the response passes `process_response` in reverse order. Any
//! middleware may end the chain early by returning `Drop` or `Retry`.

use crate::error::CrawlError;
use crate::request::{Request, Response};
use async_trait::async_trait;
use std::time::Duration;

/// What the engine should do with a request or response after a middleware saw it.
#[derive(Debug)]
pub enum MiddlewareAction<T> {
    /// Hand the (possibly modified) value to the next middleware.
    Continue(T),
    /// Re-schedule this request after the delay instead of continuing.
    Retry(Box<Request>, Duration),
    /// Discard the request or response.
    Drop,
}

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn process_request(
        &self,
        request: Request,
    ) -> Result<MiddlewareAction<Request>, CrawlError> {
        Ok(MiddlewareAction::Continue(request))
    }

    async fn process_response(
        &self,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, CrawlError> {
        Ok(MiddlewareAction::Continue(response))
    }
}

/// Lets one shared component sit in the chain while other parts of the run keep a handle.
#[async_trait]
impl<M> Middleware for std::sync::Arc<M>
where
    M: Middleware + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn process_request(
        &self,
        request: Request,
    ) -> Result<MiddlewareAction<Request>, CrawlError> {
        (**self).process_request(request).await
    }

    async fn process_response(
        &self,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, CrawlError> {
        (**self).process_response(response).await
    }
}
