//! # Request Module
//!
//! The request and response shapes the crawl engine hands to the control-plane hooks.
//!
//! Only the parts the hooks inspect are modelled: the target URL, method, headers and
//! body, plus [`RequestMeta`], the per-request bookkeeping that travels with a request
//! through retries and redirects (assigned proxy, dedup flags, retry count). Method,
//! headers and status are the `http` crate types the engine's client speaks.

use bytes::Bytes;
use http::header::{HeaderName, LOCATION};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

/// Bookkeeping carried by a request across middlewares, retries and redirects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Proxy endpoint the request was (or will be) sent through.
    pub proxy: Option<String>,
    /// Consult and update the dedup guard for this request.
    pub check_crawled: bool,
    /// Crawl epoch appended to the dedup fingerprint.
    pub suffix: Option<String>,
    /// How many times the engine has re-issued this request after a failure.
    pub retry_times: u32,
    /// City the listing belongs to, forwarded to extracted records.
    pub city: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub meta: RequestMeta,
}

impl Request {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            meta: RequestMeta::default(),
        }
    }

    /// Parses `url` and builds a GET request.
    pub fn get(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(url)?))
    }

    /// Marks the request for dedup within the given crawl epoch.
    pub fn check_crawled(mut self, suffix: Option<&str>) -> Self {
        self.meta.check_crawled = true;
        self.meta.suffix = suffix.map(str::to_string);
        self
    }

    /// The request the engine issues after a timeout or connection failure.
    pub fn retried(&self) -> Self {
        let mut next = self.clone();
        next.meta.retry_times += 1;
        next
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// The request that produced this response.
    pub request: Request,
}

impl Response {
    pub fn new(request: Request, status: StatusCode) -> Self {
        Self {
            url: request.url.clone(),
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            request,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection()
    }

    /// The redirect target, resolved against the response URL.
    pub fn location(&self) -> Option<Url> {
        let raw = self.headers.get(LOCATION)?.to_str().ok()?;
        self.url.join(raw).ok()
    }

    pub fn request_from_response(&self) -> &Request {
        &self.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retried_bumps_counter_and_keeps_meta() {
        let mut request = Request::get("https://bj.lianjia.com/ershoufang/").unwrap();
        request.meta.proxy = Some("http://10.0.0.1:8080".into());

        let retried = request.retried().retried();
        assert_eq!(retried.meta.retry_times, 2);
        assert_eq!(retried.meta.proxy, request.meta.proxy);
        assert_eq!(request.meta.retry_times, 0);
    }

    #[test]
    fn relative_location_is_resolved() {
        let request = Request::get("https://bj.lianjia.com/ershoufang/pg2/").unwrap();
        let response = Response::new(request, StatusCode::FOUND)
            .with_header(LOCATION, HeaderValue::from_static("/captcha?x=1"));
        assert!(response.is_redirect());
        assert_eq!(
            response.location().unwrap().as_str(),
            "https://bj.lianjia.com/captcha?x=1"
        );
    }

    #[test]
    fn unreadable_location_is_ignored() {
        let request = Request::get("https://bj.lianjia.com/").unwrap();
        let response = Response::new(request, StatusCode::MOVED_PERMANENTLY).with_header(
            LOCATION,
            HeaderValue::from_bytes(b"/\xff").unwrap(),
        );
        assert!(response.location().is_none());
    }
}
