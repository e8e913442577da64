//! # Statistics Module
//!
//! Counters describing what the control plane did during one run.
//!
//! ## Overview
//!
//! Every hook bumps an atomic counter on the shared `StatCollector`: requests admitted
//! or dropped, dedup hits, proxy strikes and evictions, captcha hits, record outcomes
//! and fan-out traffic. The collector is logged when the run shuts down and can be
//! exported as JSON or Markdown.
//!
//! ## Example
//!
//! ```rust,ignore
//! use house_core::StatCollector;
//!
//! let stats = StatCollector::new();
//! stats.increment_requests_admitted();
//! println!("{}", stats.to_markdown_string());
//! ```

use crate::error::CrawlError;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

// A snapshot of the current statistics, used for reporting.
struct StatsSnapshot {
    requests_admitted: usize,
    requests_retried: usize,
    requests_dropped: usize,
    responses_received: usize,
    response_status_counts: BTreeMap<u16, usize>,
    dedup_skipped: usize,
    dedup_recorded: usize,
    dedup_errors: usize,
    proxy_strikes: usize,
    proxies_evicted_by_retry: usize,
    proxies_evicted_by_captcha: usize,
    captcha_hits: usize,
    items_received: usize,
    items_persisted: usize,
    items_dropped: usize,
    items_failed: usize,
    malformed_records: usize,
    fanout_lines_sent: usize,
    fanout_subscribers: usize,
    elapsed_duration: Duration,
}

impl StatsSnapshot {
    fn formatted_duration(&self) -> String {
        format!("{:?}", self.elapsed_duration)
    }

    fn rate(&self, count: usize) -> f64 {
        let total_seconds = self.elapsed_duration.as_secs();
        if total_seconds > 0 {
            count as f64 / total_seconds as f64
        } else {
            0.0
        }
    }

    fn status_list(&self, separator: &str, pattern: fn(u16, usize) -> String) -> Option<String> {
        if self.response_status_counts.is_empty() {
            return None;
        }
        Some(
            self.response_status_counts
                .iter()
                .map(|(code, count)| pattern(*code, *count))
                .collect::<Vec<String>>()
                .join(separator),
        )
    }
}

/// Collects statistics about the control plane's decisions.
#[derive(Debug, serde::Serialize)]
pub struct StatCollector {
    #[serde(skip)]
    pub start_time: Instant,

    // Request hooks
    pub requests_admitted: AtomicUsize,
    pub requests_retried: AtomicUsize,
    pub requests_dropped: AtomicUsize,
    pub responses_received: AtomicUsize,
    pub response_status_counts: Arc<dashmap::DashMap<u16, usize>>,

    // Dedup
    pub dedup_skipped: AtomicUsize,
    pub dedup_recorded: AtomicUsize,
    pub dedup_errors: AtomicUsize,

    // Proxies
    pub proxy_strikes: AtomicUsize,
    pub proxies_evicted_by_retry: AtomicUsize,
    pub proxies_evicted_by_captcha: AtomicUsize,
    pub captcha_hits: AtomicUsize,

    // Records
    pub items_received: AtomicUsize,
    pub items_persisted: AtomicUsize,
    pub items_dropped: AtomicUsize,
    pub items_failed: AtomicUsize,
    pub malformed_records: AtomicUsize,

    // Fan-out
    pub fanout_lines_sent: AtomicUsize,
    pub fanout_subscribers: AtomicUsize,
}

impl StatCollector {
    /// Creates a new `StatCollector` with all counters initialized to zero.
    pub fn new() -> Self {
        StatCollector {
            start_time: Instant::now(),
            requests_admitted: AtomicUsize::new(0),
            requests_retried: AtomicUsize::new(0),
            requests_dropped: AtomicUsize::new(0),
            responses_received: AtomicUsize::new(0),
            response_status_counts: Arc::new(dashmap::DashMap::new()),
            dedup_skipped: AtomicUsize::new(0),
            dedup_recorded: AtomicUsize::new(0),
            dedup_errors: AtomicUsize::new(0),
            proxy_strikes: AtomicUsize::new(0),
            proxies_evicted_by_retry: AtomicUsize::new(0),
            proxies_evicted_by_captcha: AtomicUsize::new(0),
            captcha_hits: AtomicUsize::new(0),
            items_received: AtomicUsize::new(0),
            items_persisted: AtomicUsize::new(0),
            items_dropped: AtomicUsize::new(0),
            items_failed: AtomicUsize::new(0),
            malformed_records: AtomicUsize::new(0),
            fanout_lines_sent: AtomicUsize::new(0),
            fanout_subscribers: AtomicUsize::new(0),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        let response_status_counts = self
            .response_status_counts
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        StatsSnapshot {
            requests_admitted: self.requests_admitted.load(Ordering::SeqCst),
            requests_retried: self.requests_retried.load(Ordering::SeqCst),
            requests_dropped: self.requests_dropped.load(Ordering::SeqCst),
            responses_received: self.responses_received.load(Ordering::SeqCst),
            response_status_counts,
            dedup_skipped: self.dedup_skipped.load(Ordering::SeqCst),
            dedup_recorded: self.dedup_recorded.load(Ordering::SeqCst),
            dedup_errors: self.dedup_errors.load(Ordering::SeqCst),
            proxy_strikes: self.proxy_strikes.load(Ordering::SeqCst),
            proxies_evicted_by_retry: self.proxies_evicted_by_retry.load(Ordering::SeqCst),
            proxies_evicted_by_captcha: self.proxies_evicted_by_captcha.load(Ordering::SeqCst),
            captcha_hits: self.captcha_hits.load(Ordering::SeqCst),
            items_received: self.items_received.load(Ordering::SeqCst),
            items_persisted: self.items_persisted.load(Ordering::SeqCst),
            items_dropped: self.items_dropped.load(Ordering::SeqCst),
            items_failed: self.items_failed.load(Ordering::SeqCst),
            malformed_records: self.malformed_records.load(Ordering::SeqCst),
            fanout_lines_sent: self.fanout_lines_sent.load(Ordering::SeqCst),
            fanout_subscribers: self.fanout_subscribers.load(Ordering::SeqCst),
            elapsed_duration: self.start_time.elapsed(),
        }
    }

    pub(crate) fn increment_requests_admitted(&self) {
        self.requests_admitted.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_retried(&self) {
        self.requests_retried.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_dropped(&self) {
        self.requests_dropped.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a response and its status code.
    pub(crate) fn record_response_status(&self, status_code: u16) {
        self.responses_received.fetch_add(1, Ordering::SeqCst);
        *self.response_status_counts.entry(status_code).or_insert(0) += 1;
    }

    pub(crate) fn increment_dedup_skipped(&self) {
        self.dedup_skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_dedup_recorded(&self) {
        self.dedup_recorded.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_dedup_errors(&self) {
        self.dedup_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_proxy_strikes(&self) {
        self.proxy_strikes.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_proxies_evicted_by_retry(&self) {
        self.proxies_evicted_by_retry.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_proxies_evicted_by_captcha(&self) {
        self.proxies_evicted_by_captcha
            .fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_captcha_hits(&self) {
        self.captcha_hits.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_items_received(&self) {
        self.items_received.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_items_persisted(&self) {
        self.items_persisted.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_items_dropped(&self) {
        self.items_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_items_failed(&self) {
        self.items_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_malformed_records(&self) {
        self.malformed_records.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_fanout_lines_sent(&self) {
        self.fanout_lines_sent.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn subscriber_connected(&self) {
        self.fanout_subscribers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn subscriber_disconnected(&self) {
        // Saturating: a disconnect is never counted twice, but stay safe at zero.
        let _ = self
            .fanout_subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn to_json_string(&self) -> Result<String, CrawlError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_string_pretty(&self) -> Result<String, CrawlError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Exports the current statistics to a Markdown formatted string.
    pub fn to_markdown_string(&self) -> String {
        let snapshot = self.snapshot();
        let status_codes_output = snapshot
            .status_list("\n", |code, count| format!("- **{}**: {}", code, count))
            .unwrap_or_else(|| "N/A".to_string());

        format!(
            r#"# Control Plane Report

- **Duration**: {}
- **Average Speed**: {:.2} req/s, {:.2} item/s

## Requests
| Metric     | Count |
|------------|-------|
| Admitted   | {} |
| Retried    | {} |
| Dropped    | {} |
| Responses  | {} |

## Dedup
| Metric     | Count |
|------------|-------|
| Skipped    | {} |
| Recorded   | {} |
| Errors     | {} |

## Proxies
| Metric              | Count |
|---------------------|-------|
| Strikes             | {} |
| Evicted (retry)     | {} |
| Evicted (captcha)   | {} |
| Captcha hits        | {} |

## Items
| Metric     | Count |
|------------|-------|
| Received   | {} |
| Persisted  | {} |
| Dropped    | {} |
| Failed     | {} |
| Malformed  | {} |

## Fan-out
| Metric      | Count |
|-------------|-------|
| Lines sent  | {} |
| Subscribers | {} |

## Status Codes
{}
"#,
            snapshot.formatted_duration(),
            snapshot.rate(snapshot.requests_admitted),
            snapshot.rate(snapshot.items_received),
            snapshot.requests_admitted,
            snapshot.requests_retried,
            snapshot.requests_dropped,
            snapshot.responses_received,
            snapshot.dedup_skipped,
            snapshot.dedup_recorded,
            snapshot.dedup_errors,
            snapshot.proxy_strikes,
            snapshot.proxies_evicted_by_retry,
            snapshot.proxies_evicted_by_captcha,
            snapshot.captcha_hits,
            snapshot.items_received,
            snapshot.items_persisted,
            snapshot.items_dropped,
            snapshot.items_failed,
            snapshot.malformed_records,
            snapshot.fanout_lines_sent,
            snapshot.fanout_subscribers,
            status_codes_output
        )
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();

        writeln!(f, "\nControl Plane Statistics")?;
        writeln!(f, "------------------------")?;
        writeln!(f, "  duration : {}", snapshot.formatted_duration())?;
        writeln!(
            f,
            "  requests : admitted: {}, retried: {}, dropped: {}, responses: {}",
            snapshot.requests_admitted,
            snapshot.requests_retried,
            snapshot.requests_dropped,
            snapshot.responses_received
        )?;
        writeln!(
            f,
            "  dedup    : skipped: {}, recorded: {}, errors: {}",
            snapshot.dedup_skipped, snapshot.dedup_recorded, snapshot.dedup_errors
        )?;
        writeln!(
            f,
            "  proxies  : strikes: {}, evicted(retry): {}, evicted(captcha): {}, captcha: {}",
            snapshot.proxy_strikes,
            snapshot.proxies_evicted_by_retry,
            snapshot.proxies_evicted_by_captcha,
            snapshot.captcha_hits
        )?;
        writeln!(
            f,
            "  items    : received: {}, persisted: {}, dropped: {}, failed: {}, malformed: {}",
            snapshot.items_received,
            snapshot.items_persisted,
            snapshot.items_dropped,
            snapshot.items_failed,
            snapshot.malformed_records
        )?;
        writeln!(
            f,
            "  fanout   : lines: {}, subscribers: {}",
            snapshot.fanout_lines_sent, snapshot.fanout_subscribers
        )?;

        let status_string = snapshot
            .status_list(", ", |code, count| format!("{}: {}", code, count))
            .unwrap_or_else(|| "none".to_string());
        writeln!(f, "  status   : {}\n", status_string)
    }
}
