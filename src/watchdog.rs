//! Idle watchdog.
//!
//! Aborts the run when a whole window passes without a single record being produced.
//! The check piggybacks on request admission: there is no timer task, so a run that
//! stops admitting requests is left to the engine's own idle handling.

use crate::abort::{AbortReason, AbortSignal};
use crate::error::CrawlError;
use crate::middleware::{Middleware, MiddlewareAction};
use crate::pipeline::Pipeline;
use crate::records::CrawlRecord;
use crate::request::Request;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Result of a window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Window still open.
    Pending,
    /// Window elapsed with progress; counter reset.
    Progressed(u64),
    /// Window elapsed with zero items.
    Idle,
}

struct IdleWindow {
    checked: Instant,
    items: u64,
}

pub struct IdleWatchdog {
    window: Duration,
    state: Mutex<IdleWindow>,
    abort: AbortSignal,
}

impl IdleWatchdog {
    pub fn new(window: Duration, abort: AbortSignal) -> Self {
        Self {
            window,
            state: Mutex::new(IdleWindow {
                checked: Instant::now(),
                items: 0,
            }),
            abort,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn on_item_produced(&self) {
        self.state.lock().items += 1;
    }

    /// Checks the window and raises the abort signal when it closed empty.
    pub fn on_request_admitted(&self) -> WatchdogVerdict {
        let verdict = {
            let mut state = self.state.lock();
            let now = Instant::now();
            if now.duration_since(state.checked) < self.window {
                return WatchdogVerdict::Pending;
            }
            state.checked = now;
            if state.items == 0 {
                WatchdogVerdict::Idle
            } else {
                let produced = std::mem::take(&mut state.items);
                WatchdogVerdict::Progressed(produced)
            }
        };

        match verdict {
            WatchdogVerdict::Idle => {
                self.abort.abort(AbortReason::NoItemScraped);
            }
            WatchdogVerdict::Progressed(produced) => {
                info!(
                    "Scraped {} item in last {} seconds.",
                    produced,
                    self.window.as_secs()
                );
            }
            WatchdogVerdict::Pending => {}
        }
        verdict
    }
}

#[async_trait]
impl Middleware for IdleWatchdog {
    fn name(&self) -> &str {
        "IdleWatchdog"
    }

    async fn process_request(
        &self,
        request: Request,
    ) -> Result<MiddlewareAction<Request>, CrawlError> {
        if self.abort.is_aborted() {
            debug!("Run aborted, not admitting <{}>", request.url);
            return Ok(MiddlewareAction::Drop);
        }
        match self.on_request_admitted() {
            WatchdogVerdict::Idle => Ok(MiddlewareAction::Drop),
            _ => Ok(MiddlewareAction::Continue(request)),
        }
    }
}

/// Counts records. Registered as the last pipeline, so only fully processed records
/// count as progress.
#[async_trait]
impl Pipeline<CrawlRecord> for IdleWatchdog {
    fn name(&self) -> &str {
        "IdleWatchdog"
    }

    async fn process_item(&self, item: CrawlRecord) -> Result<Option<CrawlRecord>, CrawlError> {
        self.on_item_produced();
        Ok(Some(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::SecondhandHouse;

    const WINDOW: Duration = Duration::from_secs(90);

    #[tokio::test(start_paused = true)]
    async fn empty_window_aborts() {
        let abort = AbortSignal::new();
        let watchdog = IdleWatchdog::new(WINDOW, abort.clone());

        tokio::time::advance(Duration::from_secs(89)).await;
        assert_eq!(watchdog.on_request_admitted(), WatchdogVerdict::Pending);
        assert!(!abort.is_aborted());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(watchdog.on_request_admitted(), WatchdogVerdict::Idle);
        assert_eq!(abort.reason(), Some(AbortReason::NoItemScraped));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_resets_the_window() {
        let abort = AbortSignal::new();
        let watchdog = IdleWatchdog::new(WINDOW, abort.clone());

        watchdog.on_item_produced();
        tokio::time::advance(WINDOW).await;
        assert_eq!(watchdog.on_request_admitted(), WatchdogVerdict::Progressed(1));
        assert!(!abort.is_aborted());

        // New window starts at the check; nothing produced since.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(watchdog.on_request_admitted(), WatchdogVerdict::Pending);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(watchdog.on_request_admitted(), WatchdogVerdict::Idle);
        assert!(abort.is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn middleware_and_pipeline_hooks() {
        let abort = AbortSignal::new();
        let watchdog = IdleWatchdog::new(WINDOW, abort.clone());
        let request = Request::get("https://bj.lianjia.com/ershoufang/").unwrap();

        let record = CrawlRecord::Secondhand(SecondhandHouse {
            id: Some("101".into()),
            ..Default::default()
        });
        assert!(watchdog.process_item(record).await.unwrap().is_some());

        tokio::time::advance(WINDOW).await;
        assert!(matches!(
            watchdog.process_request(request.clone()).await.unwrap(),
            MiddlewareAction::Continue(_)
        ));

        tokio::time::advance(WINDOW).await;
        assert!(matches!(
            watchdog.process_request(request.clone()).await.unwrap(),
            MiddlewareAction::Drop
        ));

        // Once aborted, nothing is admitted anymore.
        assert!(matches!(
            watchdog.process_request(request).await.unwrap(),
            MiddlewareAction::Drop
        ));
    }
}
