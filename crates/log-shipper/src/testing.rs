use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;

use crate::config::Config;
use crate::sender::{SendError, Sender};

/// A payload as seen by a mock sender.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub body: String,
    pub source_name: String,
}

impl Delivery {
    pub fn lines(&self) -> Vec<&str> {
        self.body.lines().collect()
    }
}

/// Records every payload and succeeds.
#[derive(Default)]
pub struct MockSender {
    pub deliveries: Mutex<Vec<Delivery>>,
    pub closed: AtomicU32,
}

impl MockSender {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

impl Sender for MockSender {
    async fn send(&self, payload: Bytes, source_name: &str) -> Result<(), SendError> {
        self.deliveries.lock().unwrap().push(Delivery {
            body: String::from_utf8(payload.to_vec()).unwrap(),
            source_name: source_name.to_owned(),
        });
        Ok(())
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fails every attempt, counting them.
#[derive(Default)]
pub struct FailingSender {
    pub attempts: AtomicU32,
}

impl Sender for FailingSender {
    async fn send(&self, _payload: Bytes, _source_name: &str) -> Result<(), SendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SendError::Rejected {
            status: StatusCode::SERVICE_UNAVAILABLE,
        })
    }
}

/// Blocks inside `send` until released, like an endpoint stuck at its timeout.
/// Once released, every send succeeds immediately.
pub struct StalledSender {
    pub entered: Notify,
    pub attempts: AtomicU32,
    gate: Semaphore,
}

impl Default for StalledSender {
    fn default() -> Self {
        Self {
            entered: Notify::new(),
            attempts: AtomicU32::new(0),
            gate: Semaphore::new(0),
        }
    }
}

impl StalledSender {
    pub fn release(&self) {
        self.gate.close();
    }
}

impl Sender for StalledSender {
    async fn send(&self, _payload: Bytes, _source_name: &str) -> Result<(), SendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        // Never granted a permit; returns once the gate is closed.
        let _ = self.gate.acquire().await;
        Ok(())
    }
}

/// Backs off until `until` the way `HttpSender` does: `send` fails fast,
/// `send_final` still delivers.
pub struct BackoffSender {
    pub until: Instant,
    pub inner: MockSender,
}

impl BackoffSender {
    pub fn for_duration(window: Duration) -> Self {
        Self {
            until: Instant::now() + window,
            inner: MockSender::default(),
        }
    }
}

impl Sender for BackoffSender {
    async fn send(&self, payload: Bytes, source_name: &str) -> Result<(), SendError> {
        if let Some(remaining) = self.backoff_remaining() {
            return Err(SendError::BackingOff { remaining });
        }
        self.inner.send(payload, source_name).await
    }

    async fn send_final(&self, payload: Bytes, source_name: &str) -> Result<(), SendError> {
        self.inner.send(payload, source_name).await
    }

    fn backoff_remaining(&self) -> Option<Duration> {
        let remaining = self.until.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }
}

pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

pub fn dummy_config() -> Config {
    install_crypto_provider();
    let mut config = Config::new(url::Url::parse("http://127.0.0.1:9/receiver").unwrap());
    config.source_name = "test-source".to_owned();
    config.connection_timeout = Duration::from_millis(200);
    config.socket_timeout = Duration::from_millis(500);
    config.retry_interval = Duration::from_millis(1000);
    config.poll_interval = Duration::from_millis(10);
    config.max_flush_interval = Duration::from_millis(500);
    config.batch_size = 10;
    config.max_queue_bytes = 1000;
    config
}
