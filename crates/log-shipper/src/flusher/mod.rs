use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{Config, ConfigError};
use crate::queue::EvictingQueue;
use crate::sender::{Sender, batch_payload};

/// Why a batch was drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Enough records queued to fill a request.
    BatchSize,
    /// Records have waited `max_flush_interval` since the last flush.
    MaxInterval,
    /// Final flush while stopping.
    Shutdown,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushReason::BatchSize => write!(f, "batch-size"),
            FlushReason::MaxInterval => write!(f, "max-interval"),
            FlushReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Size-or-age flush decision, evaluated once per poll tick.
pub struct FlushPolicy {
    batch_size: usize,
    max_flush_interval: Duration,
    last_flush: Instant,
}

impl FlushPolicy {
    pub fn new(batch_size: usize, max_flush_interval: Duration) -> Self {
        Self {
            batch_size,
            max_flush_interval,
            last_flush: Instant::now(),
        }
    }

    pub fn decide(&self, queued: usize) -> Option<FlushReason> {
        if queued == 0 {
            None
        } else if queued >= self.batch_size {
            Some(FlushReason::BatchSize)
        } else if self.last_flush.elapsed() >= self.max_flush_interval {
            Some(FlushReason::MaxInterval)
        } else {
            None
        }
    }

    /// Restart the interval clock. Called after every attempt, failed or not.
    pub fn record_flush(&mut self) {
        self.last_flush = Instant::now();
    }
}

/// Everything the background task needs, moved into it on `start`.
struct FlushLoop<S> {
    queue: EvictingQueue<String>,
    sender: Arc<S>,
    source_name: String,
    batch_size: usize,
    poll_interval: Duration,
    max_flush_interval: Duration,
}

impl<S: Sender> FlushLoop<S> {
    async fn run(self, cancel: CancellationToken) {
        let mut policy = FlushPolicy::new(self.batch_size, self.max_flush_interval);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Only the wait is cancellable; a send in progress runs to
            // completion or to its own timeout.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick(&mut policy).await;
        }

        self.final_flush().await;
    }

    async fn tick(&self, policy: &mut FlushPolicy) {
        let Some(reason) = policy.decide(self.queue.len()) else {
            return;
        };
        if let Some(remaining) = self.sender.backoff_remaining() {
            debug!(%reason, ?remaining, "sender backing off, deferring flush");
            return;
        }

        let batch = self.queue.drain(self.batch_size);
        policy.record_flush();
        if batch.is_empty() {
            return;
        }

        let records = batch.len();
        debug!(%reason, records, "flushing batch");
        if let Err(e) = self.sender.send(batch_payload(&batch), &self.source_name).await {
            warn!(error = %e, records, "dropping batch after failed delivery");
        }
    }

    /// Drain what is left, one request per batch, with one attempt even if
    /// the sender is backing off. Stops at the first failure.
    async fn final_flush(&self) {
        loop {
            let batch = self.queue.drain(self.batch_size);
            if batch.is_empty() {
                return;
            }
            let records = batch.len();
            debug!(reason = %FlushReason::Shutdown, records, "flushing batch");
            if let Err(e) = self.sender.send_final(batch_payload(&batch), &self.source_name).await {
                let abandoned = records + self.queue.len();
                error!(error = %e, abandoned, "final flush failed");
                return;
            }
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the single background task that drains the queue into the sender.
pub struct BatchFlusher<S: Sender> {
    queue: EvictingQueue<String>,
    sender: Arc<S>,
    source_name: String,
    batch_size: usize,
    poll_interval: Duration,
    max_flush_interval: Duration,
    running: Option<Running>,
}

impl<S: Sender> BatchFlusher<S> {
    /// Fails if `config` does not validate; the task cannot run on a zero
    /// poll interval or batch size.
    pub fn new(
        config: &Config,
        queue: EvictingQueue<String>,
        sender: Arc<S>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            queue,
            sender,
            source_name: config.source_name.clone(),
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            max_flush_interval: config.max_flush_interval,
            running: None,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn the flush task on the current Tokio runtime. No-op if running.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let flush_loop = FlushLoop {
            queue: self.queue.clone(),
            sender: Arc::clone(&self.sender),
            source_name: self.source_name.clone(),
            batch_size: self.batch_size,
            poll_interval: self.poll_interval,
            max_flush_interval: self.max_flush_interval,
        };
        let task = tokio::spawn(flush_loop.run(cancel.clone()));
        debug!(
            batch_size = self.batch_size,
            poll_interval = ?self.poll_interval,
            max_flush_interval = ?self.max_flush_interval,
            "flusher started"
        );
        self.running = Some(Running { cancel, task });
    }

    /// Signal the task, wait for any in-flight send and the final flush,
    /// then return. No-op if stopped.
    pub async fn stop(&mut self) {
        let Some(Running { cancel, task }) = self.running.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = task.await {
            error!(error = %e, "flush task panicked");
        }
        debug!("flusher stopped");
    }
}

impl<S: Sender> Drop for BatchFlusher<S> {
    /// Without `stop`, the task still runs its final flush but nobody waits for it.
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}
