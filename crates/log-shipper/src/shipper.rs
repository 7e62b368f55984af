use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::config::{Config, ConfigError};
use crate::flusher::BatchFlusher;
use crate::queue::{EvictingQueue, QueueStats, WeakQueue};
use crate::sender::{HttpSender, SendError, Sender};

#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to initialize sender: {0}")]
    Sender(#[from] SendError),
}

/// The whole pipeline: queue, background flusher and sender.
///
/// Producers call [`Shipper::log`] or log through a [`LogHandle`]; neither
/// ever waits on delivery.
pub struct Shipper<S: Sender = HttpSender> {
    queue: EvictingQueue<String>,
    sender: Arc<S>,
    flusher: BatchFlusher<S>,
}

impl Shipper<HttpSender> {
    /// Validate `config`, open the HTTP sender and start flushing.
    /// Must be called from within a Tokio runtime.
    pub fn start(config: Config) -> Result<Self, InitError> {
        config.validate()?;
        let sender = HttpSender::new(&config);
        sender.init()?;
        Self::with_sender(&config, sender)
    }
}

impl<S: Sender> Shipper<S> {
    /// Start a pipeline that delivers through `sender`. Fails if `config`
    /// does not validate.
    pub fn with_sender(config: &Config, sender: S) -> Result<Self, InitError> {
        let queue = EvictingQueue::new(config.max_queue_bytes);
        let sender = Arc::new(sender);
        let mut flusher = BatchFlusher::new(config, queue.clone(), Arc::clone(&sender))?;
        flusher.start();
        debug!(url = %config.url, source_name = %config.source_name, "shipper started");
        Ok(Self {
            queue,
            sender,
            flusher,
        })
    }

    pub fn log(&self, line: impl Into<String>) {
        self.queue.enqueue(line.into());
    }

    /// A cheap, cloneable producer handle that does not keep the pipeline alive.
    pub fn handle(&self) -> LogHandle {
        LogHandle {
            queue: self.queue.downgrade(),
        }
    }

    pub fn set_max_queue_bytes(&self, max_queue_bytes: usize) {
        self.queue.set_capacity(max_queue_bytes);
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    /// Stop the flusher (delivering what is still queued), then close the
    /// sender. Always completes; failures are only logged.
    ///
    /// Dropping a `Shipper` instead still triggers the final flush in the
    /// background, but does not wait for it or close the sender.
    pub async fn shutdown(mut self) {
        self.flusher.stop().await;
        self.sender.close();
        debug!(stats = ?self.queue.stats(), "shipper shut down");
    }
}

/// Producer-side handle for a [`Shipper`].
#[derive(Clone)]
pub struct LogHandle {
    queue: WeakQueue<String>,
}

impl LogHandle {
    /// Queue a record. Dropped silently once the shipper has shut down.
    pub fn log(&self, line: impl Into<String>) {
        match self.queue.upgrade() {
            Some(queue) => {
                queue.enqueue(line.into());
            }
            None => debug!("shipper is gone, dropping record"),
        }
    }
}
