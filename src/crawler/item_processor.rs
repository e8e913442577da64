//! Contains the item processor task of the control plane.
//! Submitted records flow through the configured pipelines concurrently.

use crate::pipeline::Pipeline;
use crate::records::CrawlRecord;
use crate::stats::StatCollector;
use kanal::AsyncReceiver;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

type PipelineTimings = Arc<RwLock<HashMap<String, (Duration, usize)>>>;

async fn record_timing(timings: &PipelineTimings, pipeline: &str, elapsed: Duration) {
    let mut map = timings.write().await;
    let (total_time, count) = map
        .entry(pipeline.to_string())
        .or_insert((Duration::ZERO, 0));
    *total_time += elapsed;
    *count += 1;
}

/// Runs until the sender side of `item_rx` is dropped, then waits for in-flight records.
/// Cancelling `cancel` aborts the records still in flight and ends the task.
pub(crate) fn spawn_item_processor_task(
    item_rx: AsyncReceiver<CrawlRecord>,
    pipelines: Arc<Vec<Box<dyn Pipeline<CrawlRecord>>>>,
    max_concurrent_pipelines: usize,
    stats: Arc<StatCollector>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut tasks = JoinSet::new();
    let semaphore = Arc::new(Semaphore::new(max_concurrent_pipelines.max(1)));
    let timings: PipelineTimings = Arc::new(RwLock::new(HashMap::new()));

    trace!(
        "Starting item processor with max_concurrent_pipelines: {}",
        max_concurrent_pipelines
    );
    tokio::spawn(async move {
        while let Ok(item) = item_rx.recv().await {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                acquired = semaphore.clone().acquire_owned() => match acquired {
                    Ok(p) => p,
                    Err(_) => {
                        warn!("Semaphore closed, shutting down item processor.");
                        break;
                    }
                },
            };

            let pipelines = Arc::clone(&pipelines);
            let stats = Arc::clone(&stats);
            let timings = Arc::clone(&timings);

            tasks.spawn(async move {
                let mut item_to_process = Some(item);
                for pipeline in pipelines.iter() {
                    let Some(current_item) = item_to_process.take() else {
                        break;
                    };
                    let start_time = Instant::now();

                    match pipeline.process_item(current_item).await {
                        Ok(Some(next_item)) => {
                            item_to_process = Some(next_item);
                        }
                        Ok(None) => {
                            debug!("Pipeline '{}' dropped record", pipeline.name());
                            stats.increment_items_dropped();
                        }
                        Err(e) => {
                            error!("Pipeline '{}' error: {}", pipeline.name(), e);
                            stats.increment_items_failed();
                        }
                    }
                    record_timing(&timings, pipeline.name(), start_time.elapsed()).await;
                }

                if item_to_process.is_some() {
                    trace!("Record processed by all pipelines");
                }
                drop(permit);
            });

            // Reap finished tasks so the set does not grow for the whole run.
            while let Some(res) = tasks.try_join_next() {
                if let Err(e) = res {
                    error!("A record processing task failed: {:?}", e);
                }
            }
        }

        trace!("Waiting for active record processing tasks to complete");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Abandoning {} in-flight records", tasks.len());
                    tasks.shutdown().await;
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Err(e)) => error!("A record processing task failed: {:?}", e),
                    Some(Ok(())) => {}
                    None => break,
                },
            }
        }

        for (name, (total, count)) in timings.read().await.iter() {
            if *count > 0 {
                debug!(
                    "Pipeline '{}' handled {} records, avg {:?}",
                    name,
                    count,
                    *total / *count as u32
                );
            }
        }
        trace!("Item processor finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CrawlError;
    use crate::records::{SecondhandHouse, SoldHouse};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Collect {
        seen: Arc<Mutex<Vec<CrawlRecord>>>,
    }

    #[async_trait]
    impl Pipeline<CrawlRecord> for Collect {
        fn name(&self) -> &str {
            "Collect"
        }

        async fn process_item(
            &self,
            item: CrawlRecord,
        ) -> Result<Option<CrawlRecord>, CrawlError> {
            self.seen.lock().push(item.clone());
            Ok(Some(item))
        }
    }

    /// Drops sold records, fails on records without id.
    struct Gate;

    #[async_trait]
    impl Pipeline<CrawlRecord> for Gate {
        fn name(&self) -> &str {
            "Gate"
        }

        async fn process_item(
            &self,
            item: CrawlRecord,
        ) -> Result<Option<CrawlRecord>, CrawlError> {
            if item.id().is_none() {
                return Err(CrawlError::General("no id".into()));
            }
            match item {
                CrawlRecord::Sold(_) => Ok(None),
                other => Ok(Some(other)),
            }
        }
    }

    #[tokio::test]
    async fn drains_and_counts_outcomes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipelines: Vec<Box<dyn Pipeline<CrawlRecord>>> =
            vec![Box::new(Gate), Box::new(Collect { seen: seen.clone() })];
        let stats = Arc::new(StatCollector::new());
        let (tx, rx) = kanal::bounded_async(8);
        let task = spawn_item_processor_task(
            rx,
            Arc::new(pipelines),
            2,
            stats.clone(),
            CancellationToken::new(),
        );

        let kept = CrawlRecord::Secondhand(SecondhandHouse {
            id: Some("1".into()),
            ..Default::default()
        });
        tx.send(kept.clone()).await.unwrap();
        tx.send(CrawlRecord::Sold(SoldHouse {
            id: Some("2".into()),
            ..Default::default()
        }))
        .await
        .unwrap();
        tx.send(CrawlRecord::Secondhand(SecondhandHouse::default()))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(*seen.lock(), vec![kept]);
        assert_eq!(stats.items_dropped.load(Ordering::SeqCst), 1);
        assert_eq!(stats.items_failed.load(Ordering::SeqCst), 1);
    }

    /// Never finishes a record; flags when its work is dropped.
    struct Stuck {
        started: Arc<tokio::sync::Notify>,
        abandoned: Arc<AtomicBool>,
    }

    struct FlagOnDrop(Arc<AtomicBool>);

    impl Drop for FlagOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Pipeline<CrawlRecord> for Stuck {
        fn name(&self) -> &str {
            "Stuck"
        }

        async fn process_item(
            &self,
            _item: CrawlRecord,
        ) -> Result<Option<CrawlRecord>, CrawlError> {
            let _flag = FlagOnDrop(self.abandoned.clone());
            self.started.notify_one();
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn cancel_abandons_stuck_records() {
        let started = Arc::new(tokio::sync::Notify::new());
        let abandoned = Arc::new(AtomicBool::new(false));
        let pipelines: Vec<Box<dyn Pipeline<CrawlRecord>>> = vec![Box::new(Stuck {
            started: started.clone(),
            abandoned: abandoned.clone(),
        })];
        let cancel = CancellationToken::new();
        let (tx, rx) = kanal::bounded_async(8);
        let task = spawn_item_processor_task(
            rx,
            Arc::new(pipelines),
            1,
            Arc::new(StatCollector::new()),
            cancel.clone(),
        );

        tx.send(CrawlRecord::Sold(SoldHouse::default())).await.unwrap();
        drop(tx);
        started.notified().await;
        assert!(!abandoned.load(Ordering::SeqCst));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("processor ignored cancellation")
            .unwrap();
        assert!(abandoned.load(Ordering::SeqCst));
    }
}
