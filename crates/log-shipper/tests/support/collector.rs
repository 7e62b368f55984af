use std::collections::HashMap;
use std::convert::Infallible;
use std::io::Read;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use flate2::read::GzDecoder;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;

/// One request as received by the mock collector.
#[derive(Debug, Clone)]
pub struct Collected {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl Collected {
    pub fn lines(&self) -> Vec<&str> {
        self.body.lines().collect()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Mock ingestion endpoint. Answers every request with `status`.
pub struct Collector {
    pub port: u16,
    store: Arc<Mutex<Vec<Collected>>>,
    status: Arc<AtomicU16>,
}

impl Collector {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind collector listener");
        let port = listener.local_addr().unwrap().port();
        let store: Arc<Mutex<Vec<Collected>>> = Arc::default();
        let status = Arc::new(AtomicU16::new(200));

        let (store_clone, status_clone) = (store.clone(), status.clone());
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener
                    .accept()
                    .await
                    .expect("failed to accept connection");
                let (store, status) = (store_clone.clone(), status_clone.clone());
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, store.clone(), status.clone()));
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            port,
            store,
            status,
        }
    }

    pub fn respond_with(&self, status: StatusCode) {
        self.status.store(status.as_u16(), Ordering::SeqCst);
    }

    pub fn collected(&self) -> Vec<Collected> {
        self.store.lock().unwrap().clone()
    }

    /// Every delivered line, in arrival order.
    pub fn all_lines(&self) -> Vec<String> {
        self.collected()
            .iter()
            .flat_map(|c| c.lines().into_iter().map(str::to_owned).collect::<Vec<_>>())
            .collect()
    }

    /// Poll until at least `min_expected` requests arrived or `timeout_ms` passed.
    pub async fn wait_for(&self, min_expected: usize, timeout_ms: u64) -> Vec<Collected> {
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_millis(timeout_ms);
        loop {
            if self.store.lock().unwrap().len() >= min_expected
                || tokio::time::Instant::now() >= deadline
            {
                return self.collected();
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
    }
}

async fn handle(
    req: Request<Incoming>,
    store: Arc<Mutex<Vec<Collected>>>,
    status: Arc<AtomicU16>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let path = req.uri().path().to_owned();
    let headers: HashMap<String, String> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_owned(), v.to_str().ok()?.to_owned())))
        .collect();

    let raw = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();
    let body = if headers.get("content-encoding").map(String::as_str) == Some("gzip") {
        let mut decoded = String::new();
        GzDecoder::new(&raw[..])
            .read_to_string(&mut decoded)
            .expect("invalid gzip body");
        decoded
    } else {
        String::from_utf8_lossy(&raw).into_owned()
    };

    store.lock().unwrap().push(Collected {
        method,
        path,
        headers,
        body,
    });

    let status = StatusCode::from_u16(status.load(Ordering::SeqCst)).unwrap();
    Ok(Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap())
}
