//! C9: accumulates individual job outputs into size+time bounded batches
//! for the uploader (C8).

use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// A single extracted alert, produced by a worker's postprocess step.
#[derive(Debug, Clone, Serialize)]
pub struct Output {
    pub tenant: String,
    pub datafeed_id: String,
    pub job_id: String,
    pub alert: Value,
}

/// `{items[], first_enq_at}`. `items` never exceeds `max_size`; age never
/// exceeds `flush_interval` by more than the dispatcher's poll interval.
#[derive(Debug, Clone)]
pub struct OutputBatch {
    pub items: Vec<Output>,
    pub first_enq_at: Instant,
}

impl OutputBatch {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            first_enq_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn age(&self) -> Duration {
        self.first_enq_at.elapsed()
    }
}

pub struct OutputDispatcherConfig {
    pub max_size: usize,
    pub flush_interval: Duration,
}

impl Default for OutputDispatcherConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Single-consumer batcher: one task owns the buffer, receiving from
/// `input_rx` and sending completed batches to `batch_tx`.
pub struct OutputDispatcher {
    config: OutputDispatcherConfig,
    input_rx: mpsc::Receiver<Output>,
    batch_tx: mpsc::Sender<OutputBatch>,
}

impl OutputDispatcher {
    pub fn new(
        config: OutputDispatcherConfig,
        input_rx: mpsc::Receiver<Output>,
        batch_tx: mpsc::Sender<OutputBatch>,
    ) -> Self {
        Self {
            config,
            input_rx,
            batch_tx,
        }
    }

    /// Run until the input channel closes or `shutdown` fires, flushing
    /// whatever remains buffered before returning.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut buffer = OutputBatch::new();
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_item = self.input_rx.recv() => {
                    match maybe_item {
                        Some(item) => {
                            if buffer.is_empty() {
                                buffer.first_enq_at = Instant::now();
                            }
                            buffer.items.push(item);
                            if buffer.len() >= self.config.max_size {
                                self.flush(&mut buffer).await;
                            }
                        }
                        None => {
                            self.flush(&mut buffer).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.drain_remaining(&mut buffer).await;
                        break;
                    }
                }
            }
        }
    }

    async fn flush(&self, buffer: &mut OutputBatch) {
        let batch = std::mem::replace(buffer, OutputBatch::new());
        debug!(batch_size = batch.len(), "flushing output batch");
        if self.batch_tx.send(batch).await.is_err() {
            debug!("batch receiver dropped, output batch lost");
        }
    }

    async fn drain_remaining(&mut self, buffer: &mut OutputBatch) {
        while let Ok(item) = self.input_rx.try_recv() {
            if buffer.is_empty() {
                buffer.first_enq_at = Instant::now();
            }
            buffer.items.push(item);
            if buffer.len() >= self.config.max_size {
                self.flush(buffer).await;
            }
        }
        if !buffer.is_empty() {
            self.flush(buffer).await;
        }
    }
}
