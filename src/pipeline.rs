use crate::ingest::{BatchOutcome, ReadingIngestor};
use crate::model::InboundReading;
use crate::offsets::AckCommand;
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Readings received together from one producer partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub partition: String,
    pub readings: Vec<InboundReading>,
}

#[derive(Debug)]
pub enum BatchCommand {
    Delivery(Delivery),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub workers: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_queue: usize,
}

#[derive(Clone)]
pub struct PipelineHandle {
    workers: Vec<mpsc::Sender<BatchCommand>>,
    stats: Arc<IngestStats>,
}

impl PipelineHandle {
    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queues a delivery on the worker that owns its partition.
    pub async fn enqueue(&self, delivery: Delivery) -> Result<()> {
        let slot = partition_slot(&delivery.partition, self.workers.len());
        let tx = self
            .workers
            .get(slot)
            .ok_or_else(|| anyhow!("pipeline has no workers"))?;
        let len = delivery.readings.len() as u64;
        let queue_depth = self.stats.queue_depth.fetch_add(len, Ordering::Relaxed) + len;
        tracing::trace!(
            queue_depth,
            partition = %delivery.partition,
            worker = slot,
            "queued delivery"
        );
        if let Err(err) = tx.send(BatchCommand::Delivery(delivery)).await {
            self.stats.queue_depth.fetch_sub(len, Ordering::Relaxed);
            return Err(anyhow!("pipeline worker {slot} stopped: {err}"));
        }
        Ok(())
    }

    /// Flushes every worker and waits until each has tried once.
    pub async fn flush(&self) -> Result<()> {
        let mut waiters = Vec::with_capacity(self.workers.len());
        for tx in &self.workers {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(BatchCommand::Flush(done_tx)).await.is_ok() {
                waiters.push(done_rx);
            }
        }
        for waiter in waiters {
            let _ = waiter.await;
        }
        Ok(())
    }

    /// Closes the worker queues and waits for every worker to flush what it
    /// buffered. Workers only see the close once every clone of the handle
    /// is gone.
    pub async fn shutdown(self, workers: Vec<JoinHandle<()>>) {
        drop(self);
        for (index, handle) in workers.into_iter().enumerate() {
            if let Err(err) = handle.await {
                tracing::warn!(worker = index, error = %err, "pipeline worker failed");
            }
        }
    }
}

/// Deliveries of one partition always land on the same worker.
pub fn partition_slot(partition: &str, workers: usize) -> usize {
    if workers <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    partition.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

#[derive(Debug)]
pub struct IngestStats {
    pub received: AtomicU64,
    pub written: AtomicU64,
    pub dropped: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub queue_depth: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub inflight_flushes: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            inflight_flushes: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

/// Starts `options.workers` batching workers, each with its own bounded queue.
pub fn spawn_workers(
    ingestor: ReadingIngestor,
    options: PipelineOptions,
    ack_tx: Option<mpsc::UnboundedSender<AckCommand>>,
) -> (PipelineHandle, Vec<JoinHandle<()>>) {
    let stats = ingestor.stats();
    let workers = options.workers.max(1);
    let queue = (options.max_queue / workers).max(1);
    let mut senders = Vec::with_capacity(workers);
    let mut handles = Vec::with_capacity(workers);
    for index in 0..workers {
        let (tx, rx) = mpsc::channel(queue);
        senders.push(tx);
        handles.push(spawn_worker(
            index,
            ingestor.clone(),
            rx,
            options.batch_size.max(1),
            options.flush_interval,
            ack_tx.clone(),
        ));
    }
    (
        PipelineHandle {
            workers: senders,
            stats,
        },
        handles,
    )
}

struct WorkerBuffer {
    readings: Vec<InboundReading>,
    receipts: HashMap<String, BTreeSet<u64>>,
}

impl WorkerBuffer {
    fn is_empty(&self) -> bool {
        self.readings.is_empty() && self.receipts.is_empty()
    }

    fn push(&mut self, delivery: Delivery) {
        let seqs: BTreeSet<u64> = delivery.readings.iter().filter_map(|r| r.seq).collect();
        if !seqs.is_empty() {
            self.receipts
                .entry(delivery.partition)
                .or_default()
                .extend(seqs);
        }
        self.readings.extend(delivery.readings);
    }
}

struct Worker {
    index: usize,
    ingestor: ReadingIngestor,
    stats: Arc<IngestStats>,
    buffer: WorkerBuffer,
    ack_tx: Option<mpsc::UnboundedSender<AckCommand>>,
}

impl Worker {
    async fn flush_logged(&mut self, trigger: &'static str) {
        let result = flush(
            &self.ingestor,
            &mut self.buffer,
            &self.stats,
            self.ack_tx.as_ref(),
        )
        .await;
        if let Err(err) = result {
            tracing::warn!(worker = self.index, trigger, error = %err, "flush failed");
        }
    }
}

fn spawn_worker(
    index: usize,
    ingestor: ReadingIngestor,
    mut rx: mpsc::Receiver<BatchCommand>,
    batch_size: usize,
    flush_interval: Duration,
    ack_tx: Option<mpsc::UnboundedSender<AckCommand>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut worker = Worker {
            index,
            stats: ingestor.stats(),
            ingestor,
            buffer: WorkerBuffer {
                readings: Vec::with_capacity(batch_size),
                receipts: HashMap::new(),
            },
            ack_tx,
        };
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => worker.flush_logged("interval").await,
                cmd = rx.recv() => match cmd {
                    Some(BatchCommand::Delivery(delivery)) => {
                        let len = delivery.readings.len() as u64;
                        worker.stats.queue_depth.fetch_sub(len, Ordering::Relaxed);
                        worker.buffer.push(delivery);
                        if worker.buffer.readings.len() >= batch_size {
                            worker.flush_logged("batch size").await;
                        }
                    }
                    Some(BatchCommand::Flush(done)) => {
                        worker.flush_logged("on demand").await;
                        let _ = done.send(());
                    }
                    None => {
                        worker.flush_logged("shutdown").await;
                        break;
                    }
                },
            }
        }
    })
}

async fn flush(
    ingestor: &ReadingIngestor,
    buffer: &mut WorkerBuffer,
    stats: &Arc<IngestStats>,
    ack_tx: Option<&mpsc::UnboundedSender<AckCommand>>,
) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }

    let started = Instant::now();
    stats.inflight_flushes.fetch_add(1, Ordering::Relaxed);
    let items = std::mem::take(&mut buffer.readings);
    let len = items.len();
    let result = if items.is_empty() {
        Ok(BatchOutcome::Filtered { dropped: 0 })
    } else {
        ingestor.ingest_batch(&items).await
    };
    stats.inflight_flushes.fetch_sub(1, Ordering::Relaxed);

    match result {
        Ok(outcome) => {
            let receipts = std::mem::take(&mut buffer.receipts);
            if let Some(ack_tx) = ack_tx {
                for (partition, seqs) in receipts {
                    let _ = ack_tx.send(AckCommand::Settled {
                        partition,
                        seqs: seqs.into_iter().collect(),
                    });
                }
            }

            stats.last_batch_len.store(len as u64, Ordering::Relaxed);
            let now = Utc::now().timestamp_millis() as u64;
            stats.last_flush_unix_ms.store(now, Ordering::Relaxed);
            let micros = started.elapsed().as_micros() as u64;
            let prev = stats.average_flush_micros.load(Ordering::Relaxed);
            let avg = if prev == 0 {
                micros
            } else {
                (prev + micros) / 2
            };
            stats.average_flush_micros.store(avg, Ordering::Relaxed);
            match &outcome {
                BatchOutcome::DeadLettered { reason, .. } => stats.record_error(reason.clone()),
                _ => stats.clear_error(),
            }
            tracing::debug!(len, micros, ?outcome, "flushed readings batch");
        }
        Err(err) => {
            stats.record_error(err.to_string());
            tracing::error!(
                error = %err,
                len,
                "readings batch was neither written nor dead-lettered"
            );
            buffer.readings.extend(items);
            return Err(err.into());
        }
    }

    Ok(())
}
