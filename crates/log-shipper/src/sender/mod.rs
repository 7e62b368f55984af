use std::future::Future;
use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use flate2::write::GzEncoder;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Proxy, StatusCode};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::config::{Compression, Config, ProxyAuth, ProxySettings};

/// Header carrying the source name on every delivery.
pub const SOURCE_NAME_HEADER: &str = "X-Sumo-Name";

#[derive(Debug, Error)]
pub enum SendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint rejected payload: {status}")]
    Rejected { status: StatusCode },

    #[error("gzip compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("sender used before init")]
    NotInitialized,

    #[error("sender is closed")]
    Closed,

    #[error("holding off after a failed delivery, {remaining:?} left")]
    BackingOff { remaining: Duration },

    #[error("proxy auth scheme {0} is not supported by the HTTP transport")]
    UnsupportedProxyAuth(String),

    #[error("invalid extra header {0:?}")]
    InvalidHeader(String),
}

/// Delivers one payload to the ingestion endpoint.
pub trait Sender: Send + Sync + 'static {
    fn send(
        &self,
        payload: Bytes,
        source_name: &str,
    ) -> impl Future<Output = Result<(), SendError>> + Send;

    /// Last delivery before shutdown. Makes one attempt even while backing
    /// off; senders without a backoff just `send`.
    fn send_final(
        &self,
        payload: Bytes,
        source_name: &str,
    ) -> impl Future<Output = Result<(), SendError>> + Send {
        self.send(payload, source_name)
    }

    /// Time left before the sender will attempt delivery again, if it is
    /// holding off after a failure.
    fn backoff_remaining(&self) -> Option<Duration> {
        None
    }

    /// Release transport resources. Later sends fail fast.
    fn close(&self) {}
}

/// Join records into one request body, FIFO, one record per line.
pub fn batch_payload<S: AsRef<str>>(records: &[S]) -> Bytes {
    let len = records.iter().map(|r| r.as_ref().len() + 1).sum();
    let mut body = String::with_capacity(len);
    for record in records {
        let record = record.as_ref();
        body.push_str(record);
        if !record.ends_with('\n') {
            body.push('\n');
        }
    }
    Bytes::from(body)
}

enum SenderState {
    Idle,
    Ready(Client),
    Closed,
}

/// [`Sender`] that POSTs payloads with `reqwest`.
///
/// After a failed attempt, sends fail fast with [`SendError::BackingOff`]
/// until `retry_interval` has passed. This limits attempts against a failing
/// endpoint; it does not make delivery any more certain.
pub struct HttpSender {
    url: Url,
    connection_timeout: Duration,
    socket_timeout: Duration,
    retry_interval: Duration,
    proxy: Option<ProxySettings>,
    compression: Compression,
    extra_headers: Vec<(String, String)>,
    state: Mutex<SenderState>,
    failed_at: Mutex<Option<Instant>>,
}

impl HttpSender {
    pub fn new(config: &Config) -> Self {
        Self {
            url: config.url.clone(),
            connection_timeout: config.connection_timeout,
            socket_timeout: config.socket_timeout,
            retry_interval: config.retry_interval,
            proxy: config.proxy.clone(),
            compression: config.compression,
            extra_headers: config.headers.clone(),
            state: Mutex::new(SenderState::Idle),
            failed_at: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, SenderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failed_at(&self) -> MutexGuard<'_, Option<Instant>> {
        self.failed_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the HTTP client. Calling it again while initialized is a no-op;
    /// calling it after `close` opens a fresh client.
    pub fn init(&self) -> Result<(), SendError> {
        let mut state = self.state();
        if matches!(*state, SenderState::Ready(_)) {
            return Ok(());
        }
        *state = SenderState::Ready(self.build_client()?);
        *self.failed_at() = None;
        debug!(url = %self.url, "HTTP sender initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        matches!(*self.state(), SenderState::Ready(_))
    }

    fn build_client(&self) -> Result<Client, SendError> {
        let mut builder = Client::builder()
            .default_headers(self.default_headers()?)
            .connect_timeout(self.connection_timeout)
            .read_timeout(self.socket_timeout)
            .timeout(self.connection_timeout + self.socket_timeout);

        if let Some(settings) = &self.proxy {
            builder = builder.proxy(build_proxy(settings)?);
        }

        Ok(builder.build()?)
    }

    /// Headers identical on every request, checked once when the client is built.
    fn default_headers(&self) -> Result<HeaderMap, SendError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if self.compression == Compression::Gzip {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        for (name, value) in &self.extra_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| SendError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| SendError::InvalidHeader(name.as_str().to_owned()))?;
            headers.append(name, value);
        }
        Ok(headers)
    }

    async fn post(&self, client: Client, payload: Bytes, source_name: &str) -> Result<(), SendError> {
        let body = match self.compression {
            Compression::Gzip => gzip(&payload)?,
            Compression::None => payload,
        };

        let resp = client
            .post(self.url.clone())
            .header(SOURCE_NAME_HEADER, source_name)
            .body(body)
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SendError::Rejected {
                status: resp.status(),
            })
        }
    }

    async fn attempt(
        &self,
        payload: Bytes,
        source_name: &str,
        respect_backoff: bool,
    ) -> Result<(), SendError> {
        let client = match &*self.state() {
            SenderState::Ready(client) => client.clone(),
            SenderState::Idle => return Err(SendError::NotInitialized),
            SenderState::Closed => return Err(SendError::Closed),
        };
        if respect_backoff {
            if let Some(remaining) = self.backoff_remaining() {
                return Err(SendError::BackingOff { remaining });
            }
        }

        let bytes = payload.len();
        match self.post(client, payload, source_name).await {
            Ok(()) => {
                *self.failed_at() = None;
                debug!(bytes, "delivered payload");
                Ok(())
            }
            Err(e) => {
                *self.failed_at() = Some(Instant::now());
                Err(e)
            }
        }
    }
}

impl Sender for HttpSender {
    async fn send(&self, payload: Bytes, source_name: &str) -> Result<(), SendError> {
        self.attempt(payload, source_name, true).await
    }

    async fn send_final(&self, payload: Bytes, source_name: &str) -> Result<(), SendError> {
        self.attempt(payload, source_name, false).await
    }

    fn backoff_remaining(&self) -> Option<Duration> {
        let failed_at = (*self.failed_at())?;
        self.retry_interval
            .checked_sub(failed_at.elapsed())
            .filter(|d| !d.is_zero())
    }

    fn close(&self) {
        let previous = std::mem::replace(&mut *self.state(), SenderState::Closed);
        if matches!(previous, SenderState::Ready(_)) {
            debug!("HTTP sender closed");
        }
    }
}

fn build_proxy(settings: &ProxySettings) -> Result<Proxy, SendError> {
    let proxy = Proxy::all(proxy_url(&settings.host, settings.port))?;
    match &settings.auth {
        ProxyAuth::None => Ok(proxy),
        ProxyAuth::Basic { user, password } => Ok(proxy.basic_auth(user, password)),
        ProxyAuth::Ntlm { .. } => {
            warn!(host = %settings.host, "NTLM proxy auth requested");
            Err(SendError::UnsupportedProxyAuth("ntlm".to_owned()))
        }
    }
}

fn proxy_url(host: &str, port: u16) -> String {
    // Bare IPv6 literals need brackets before the port.
    if host.contains(':') && !host.starts_with('[') {
        format!("http://[{host}]:{port}")
    } else {
        format!("http://{host}:{port}")
    }
}

fn gzip(payload: &[u8]) -> Result<Bytes, std::io::Error> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(payload.len() / 4),
        flate2::Compression::default(),
    );
    encoder.write_all(payload)?;
    encoder.finish().map(Bytes::from)
}
