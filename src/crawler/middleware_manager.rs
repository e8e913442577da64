//! Middleware Manager for concurrent access.
//!
//! Middlewares only take `&self`, so the chain is stored once behind an `Arc` and every
//! in-flight request walks it without locking.

use crate::error::CrawlError;
use crate::middleware::{Middleware, MiddlewareAction};
use crate::request::{Request, Response};
use std::sync::Arc;
use tracing::trace;

/// An ordered, shareable middleware chain.
#[derive(Clone)]
pub struct MiddlewareManager {
    middlewares: Arc<Vec<Box<dyn Middleware>>>,
}

impl MiddlewareManager {
    pub fn new(middlewares: Vec<Box<dyn Middleware>>) -> Self {
        Self {
            middlewares: Arc::new(middlewares),
        }
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    /// Processes a request through all registered middlewares.
    pub async fn process_request(
        &self,
        request: Request,
    ) -> Result<MiddlewareAction<Request>, CrawlError> {
        let mut current_request = request;

        for middleware in self.middlewares.iter() {
            match middleware.process_request(current_request).await? {
                MiddlewareAction::Continue(req) => {
                    current_request = req;
                }
                action => {
                    trace!("Request chain stopped at {}", middleware.name());
                    return Ok(action);
                }
            }
        }

        Ok(MiddlewareAction::Continue(current_request))
    }

    /// Processes a response through all registered middlewares in reverse order.
    pub async fn process_response(
        &self,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, CrawlError> {
        let mut current_response = response;

        for middleware in self.middlewares.iter().rev() {
            match middleware.process_response(current_response).await? {
                MiddlewareAction::Continue(res) => {
                    current_response = res;
                }
                action => {
                    trace!("Response chain stopped at {}", middleware.name());
                    return Ok(action);
                }
            }
        }

        Ok(MiddlewareAction::Continue(current_response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http::StatusCode;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        drop_requests: bool,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn process_request(
            &self,
            request: Request,
        ) -> Result<MiddlewareAction<Request>, CrawlError> {
            self.log.lock().push(format!("req:{}", self.name));
            if self.drop_requests {
                Ok(MiddlewareAction::Drop)
            } else {
                Ok(MiddlewareAction::Continue(request))
            }
        }

        async fn process_response(
            &self,
            response: Response,
        ) -> Result<MiddlewareAction<Response>, CrawlError> {
            self.log.lock().push(format!("resp:{}", self.name));
            if response.status == StatusCode::FOUND && self.name == "b" {
                return Ok(MiddlewareAction::Retry(
                    Box::new(response.request.clone()),
                    Duration::ZERO,
                ));
            }
            Ok(MiddlewareAction::Continue(response))
        }
    }

    fn chain(log: &Arc<Mutex<Vec<String>>>, drop_at: Option<&str>) -> MiddlewareManager {
        let middlewares: Vec<Box<dyn Middleware>> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                Box::new(Recorder {
                    name,
                    log: log.clone(),
                    drop_requests: drop_at == Some(name),
                }) as Box<dyn Middleware>
            })
            .collect();
        MiddlewareManager::new(middlewares)
    }

    #[tokio::test]
    async fn requests_forward_responses_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = chain(&log, None);
        let request = Request::get("https://bj.lianjia.com/").unwrap();

        manager.process_request(request.clone()).await.unwrap();
        manager
            .process_response(Response::new(request, StatusCode::OK))
            .await
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec!["req:a", "req:b", "req:c", "resp:c", "resp:b", "resp:a"]
        );
        assert_eq!(manager.names(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn non_continue_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = chain(&log, Some("b"));
        let request = Request::get("https://bj.lianjia.com/").unwrap();

        let action = manager.process_request(request.clone()).await.unwrap();
        assert!(matches!(action, MiddlewareAction::Drop));

        let action = manager
            .process_response(Response::new(request, StatusCode::FOUND))
            .await
            .unwrap();
        assert!(matches!(action, MiddlewareAction::Retry(_, _)));
        assert_eq!(*log.lock(), vec!["req:a", "req:b", "resp:c", "resp:b"]);
    }
}
