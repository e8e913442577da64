//! # Fan-out Module
//!
//! Live broadcast of saved records to TCP subscribers.
//!
//! ## Overview
//!
//! [`ItemFanout`] listens on the first free port of a configured range and writes one
//! JSON object per line to every connected subscriber:
//!
//! ```text
//! {"type":1,"city":"bj","main":"朝阳"}
//! {"type":2,"city":"bj","main":"朝阳","comm":"望京西园","deal":"2017.05.01","unit":"61234"}
//! ```
//!
//! Records go through a bounded broadcast channel, one receiver per subscriber. Publishing
//! never waits on a subscriber; a subscriber that falls more than the channel capacity
//! behind is disconnected instead of slowing the others down.
//!
//! Stopping closes the listener only. Connected subscribers keep their stream until they
//! hang up or the fan-out itself is dropped. A stopped fan-out can be started again.

use crate::error::CrawlError;
use crate::pipeline::Pipeline;
use crate::records::CrawlRecord;
use crate::settings::FanoutSettings;
use crate::stats::StatCollector;
use async_trait::async_trait;
use futures_util::SinkExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wire projection of a record, one variant per broadcast record kind.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(untagged)]
enum FanoutLine<'a> {
    Secondhand {
        #[serde(rename = "type")]
        kind: u8,
        city: Option<&'a str>,
        main: Option<&'a str>,
    },
    Sold {
        #[serde(rename = "type")]
        kind: u8,
        city: Option<&'a str>,
        main: Option<&'a str>,
        comm: Option<&'a str>,
        deal: Option<&'a str>,
        unit: Option<&'a str>,
    },
}

/// Encodes `record` as a single JSON line (without the newline).
///
/// Returns `None` for kinds subscribers do not receive.
pub fn encode_line(record: &CrawlRecord) -> Option<String> {
    let line = match record {
        CrawlRecord::Secondhand(house) => FanoutLine::Secondhand {
            kind: 1,
            city: house.city.as_deref(),
            main: house.main.as_deref(),
        },
        CrawlRecord::Sold(house) => FanoutLine::Sold {
            kind: 2,
            city: house.city.as_deref(),
            main: house.main.as_deref(),
            comm: house.comm.as_deref(),
            deal: house.deal.as_deref(),
            unit: house.unit.as_deref(),
        },
        CrawlRecord::NewHouse(_) => return None,
    };
    serde_json::to_string(&line).ok()
}

pub struct ItemFanout {
    host: String,
    port_start: u16,
    port_end: u16,
    sender: broadcast::Sender<Arc<str>>,
    stop: Mutex<CancellationToken>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<StatCollector>,
}

impl ItemFanout {
    pub fn new(settings: &FanoutSettings, stats: Arc<StatCollector>) -> Self {
        let (sender, _) = broadcast::channel(settings.subscriber_buffer.max(1));
        Self {
            host: settings.host.clone(),
            port_start: settings.port_start,
            port_end: settings.port_end,
            sender,
            stop: Mutex::new(CancellationToken::new()),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            stats,
        }
    }

    /// Binds the first free port in the range and starts accepting subscribers.
    ///
    /// Calling it again while listening returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, CrawlError> {
        if let Some(addr) = *self.local_addr.lock() {
            return Ok(addr);
        }

        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        let stop = CancellationToken::new();
        *self.stop.lock() = stop.clone();
        *self.local_addr.lock() = Some(addr);
        debug!("listening on {}: {}", addr.ip(), addr.port());

        let task = tokio::spawn(accept_loop(
            listener,
            self.sender.clone(),
            stop,
            self.stats.clone(),
        ));
        *self.accept_task.lock() = Some(task);
        Ok(addr)
    }

    async fn bind(&self) -> Result<TcpListener, CrawlError> {
        let mut last_error = None;
        for port in self.port_start..=self.port_end {
            match TcpListener::bind((self.host.as_str(), port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    debug!("Port {} unavailable: {}", port, e);
                    last_error = Some(e);
                }
            }
        }
        let error = last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable));
        Err(CrawlError::Io(io::Error::new(
            error.kind(),
            format!(
                "no free port in {}..={} on {}: {}",
                self.port_start, self.port_end, self.host, error
            ),
        )))
    }

    /// Stops accepting new subscribers. Existing connections stay open.
    pub async fn stop(&self) {
        self.stop.lock().cancel();
        *self.local_addr.lock() = None;
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Fan-out accept loop ended abnormally: {}", e);
            }
            info!("Fan-out stopped accepting subscribers");
        }
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Queues `record` for every connected subscriber. Returns how many will receive it.
    pub fn publish(&self, record: &CrawlRecord) -> usize {
        let Some(line) = encode_line(record) else {
            return 0;
        };
        // Err means nobody is listening.
        self.sender.send(Arc::from(line)).unwrap_or(0)
    }
}

async fn accept_loop(
    listener: TcpListener,
    sender: broadcast::Sender<Arc<str>>,
    stop: CancellationToken,
    stats: Arc<StatCollector>,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Subscriber connected from {}", peer);
                    let receiver = sender.subscribe();
                    tokio::spawn(serve_subscriber(stream, peer, receiver, stats.clone()));
                }
                Err(e) => warn!("Failed to accept subscriber: {}", e),
            },
        }
    }
}

async fn serve_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    mut receiver: broadcast::Receiver<Arc<str>>,
    stats: Arc<StatCollector>,
) {
    stats.subscriber_connected();
    let (mut reader, writer) = stream.into_split();
    let mut lines = FramedWrite::new(writer, LinesCodec::new());
    let mut scratch = [0u8; 256];

    loop {
        tokio::select! {
            message = receiver.recv() => match message {
                Ok(line) => {
                    if let Err(e) = lines.send(&*line).await {
                        debug!("Subscriber {} write failed: {}", peer, e);
                        break;
                    }
                    stats.increment_fanout_lines_sent();
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Subscriber {} fell {} records behind, disconnecting", peer, missed);
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            // Subscribers never send; a read only tells us they hung up.
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }

    stats.subscriber_disconnected();
    debug!("Subscriber {} disconnected", peer);
}

/// Broadcasts every record that made it through the earlier pipelines.
pub struct FanoutPipeline {
    fanout: Arc<ItemFanout>,
}

impl FanoutPipeline {
    pub fn new(fanout: Arc<ItemFanout>) -> Self {
        Self { fanout }
    }
}

#[async_trait]
impl Pipeline<CrawlRecord> for FanoutPipeline {
    fn name(&self) -> &str {
        "FanoutPipeline"
    }

    async fn process_item(&self, item: CrawlRecord) -> Result<Option<CrawlRecord>, CrawlError> {
        self.fanout.publish(&item);
        Ok(Some(item))
    }
}
