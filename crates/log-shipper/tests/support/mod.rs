#![allow(dead_code)]

pub mod collector;

use std::time::Duration;

use log_shipper::Config;
use url::Url;

pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Fast-cadence config pointed at `port`.
pub fn config_for(port: u16) -> Config {
    install_crypto_provider();
    let mut config =
        Config::new(Url::parse(&format!("http://127.0.0.1:{port}/receiver/v1/http/token")).unwrap());
    config.source_name = "integration".to_owned();
    config.connection_timeout = Duration::from_millis(500);
    config.socket_timeout = Duration::from_millis(1000);
    config.retry_interval = Duration::from_millis(200);
    config.poll_interval = Duration::from_millis(20);
    config.max_flush_interval = Duration::from_millis(200);
    config.batch_size = 10;
    config.max_queue_bytes = 10_000;
    config
}
