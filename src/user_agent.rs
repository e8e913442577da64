//! Random `User-Agent` assignment.

use crate::error::CrawlError;
use crate::middleware::{Middleware, MiddlewareAction};
use crate::request::Request;
use async_trait::async_trait;
use http::header::USER_AGENT;
use http::HeaderValue;
use rand::seq::SliceRandom;
use tracing::warn;

/// Used when the builder is given no list of its own.
pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/58.0.3029.110 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_12_4) AppleWebKit/603.1.30 (KHTML, like Gecko) Version/10.1 Safari/603.1.30",
    "Mozilla/5.0 (Windows NT 6.1; WOW64; rv:53.0) Gecko/20100101 Firefox/53.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/57.0.2987.133 Safari/537.36",
    "Mozilla/5.0 (compatible; MSIE 10.0; Windows NT 6.1; Trident/6.0)",
];

/// Sets a random `User-Agent` on requests that carry none.
pub struct UserAgentMiddleware {
    user_agents: Vec<HeaderValue>,
}

impl UserAgentMiddleware {
    /// Returns `None` when the list has no usable entry. Entries that are blank or not
    /// valid header values are skipped.
    pub fn new(user_agents: Vec<String>) -> Option<Self> {
        let user_agents: Vec<HeaderValue> = user_agents
            .into_iter()
            .filter(|ua| !ua.trim().is_empty())
            .filter_map(|ua| match HeaderValue::from_str(&ua) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Skipping unusable user agent {:?}", ua);
                    None
                }
            })
            .collect();
        if user_agents.is_empty() {
            None
        } else {
            Some(Self { user_agents })
        }
    }

    pub fn with_defaults() -> Self {
        Self {
            user_agents: DEFAULT_USER_AGENTS
                .iter()
                .copied()
                .map(HeaderValue::from_static)
                .collect(),
        }
    }
}

#[async_trait]
impl Middleware for UserAgentMiddleware {
    fn name(&self) -> &str {
        "UserAgentMiddleware"
    }

    async fn process_request(
        &self,
        mut request: Request,
    ) -> Result<MiddlewareAction<Request>, CrawlError> {
        if let Some(ua) = self.user_agents.choose(&mut rand::thread_rng()) {
            request.headers.entry(USER_AGENT).or_insert_with(|| ua.clone());
        }
        Ok(MiddlewareAction::Continue(request))
    }
}
