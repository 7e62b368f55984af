use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use thiserror::Error;
use url::Url;

const PREFIX: &str = "LOG_SHIPPER_";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Compression {
    Gzip,
    None,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("LOG_SHIPPER_URL is required but not set")]
    UrlMissing,

    #[error("LOG_SHIPPER_URL is not a valid URL: {0}")]
    UrlInvalid(String),

    #[error("destination URL must use http or https, got {0}")]
    UrlUnsupportedScheme(String),

    #[error("{0} has invalid value: {1}")]
    InvalidNumeric(String, String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("source name must not be empty")]
    EmptySourceName,

    #[error("LOG_SHIPPER_PROXY_PORT is required when LOG_SHIPPER_PROXY_HOST is set")]
    ProxyPortMissing,

    #[error("LOG_SHIPPER_PROXY_AUTH has invalid value: {0} (expected \"basic\" or \"ntlm\")")]
    InvalidProxyAuth(String),

    #[error("proxy auth {0} requires LOG_SHIPPER_PROXY_USER and LOG_SHIPPER_PROXY_PASSWORD")]
    ProxyCredentialsMissing(&'static str),

    #[error("LOG_SHIPPER_COMPRESSION has invalid value: {0} (expected \"gzip\" or \"none\")")]
    InvalidCompression(String),

    #[error("invalid HTTP header {0:?}: {1}")]
    InvalidHeader(String, &'static str),
}

/// Credentials presented to the proxy. Passed through to the HTTP client.
#[derive(Clone, PartialEq)]
pub enum ProxyAuth {
    None,
    Basic {
        user: String,
        password: String,
    },
    Ntlm {
        user: String,
        password: String,
        domain: Option<String>,
    },
}

impl fmt::Debug for ProxyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyAuth::None => f.write_str("None"),
            ProxyAuth::Basic { user, .. } => f
                .debug_struct("Basic")
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
            ProxyAuth::Ntlm { user, domain, .. } => f
                .debug_struct("Ntlm")
                .field("user", user)
                .field("password", &"<redacted>")
                .field("domain", domain)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    pub auth: ProxyAuth,
}

/// Immutable pipeline configuration, handed to each component at construction.
#[derive(Debug, Clone)]
pub struct Config {
    pub url: Url,
    /// Stamped on every delivery so the receiver can tell sources apart.
    pub source_name: String,
    pub connection_timeout: Duration,
    pub socket_timeout: Duration,
    /// How long the sender holds off after a failed delivery.
    pub retry_interval: Duration,
    /// How often the flusher looks at the queue.
    pub poll_interval: Duration,
    pub max_flush_interval: Duration,
    /// Records per request; reaching it triggers a flush.
    pub batch_size: usize,
    pub max_queue_bytes: usize,
    pub proxy: Option<ProxySettings>,
    pub compression: Compression,
    pub headers: Vec<(String, String)>,
}

impl Config {
    /// Configuration for `url` with every other setting at its default.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            source_name: "log-shipper".to_owned(),
            connection_timeout: Duration::from_millis(1000),
            socket_timeout: Duration::from_millis(60_000),
            retry_interval: Duration::from_millis(10_000),
            poll_interval: Duration::from_millis(250),
            max_flush_interval: Duration::from_millis(10_000),
            batch_size: 100,
            max_queue_bytes: 1_000_000,
            proxy: None,
            compression: Compression::None,
            headers: Vec::new(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with(PREFIX))
            .collect();
        Self::parse(&vars)
    }

    fn parse(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::new(parse_url(vars)?);

        let config = Self {
            source_name: vars
                .get("LOG_SHIPPER_SOURCE_NAME")
                .cloned()
                .unwrap_or(defaults.source_name),
            connection_timeout: parse_duration_ms(
                vars,
                "LOG_SHIPPER_CONNECTION_TIMEOUT_MS",
                defaults.connection_timeout,
            )?,
            socket_timeout: parse_duration_ms(
                vars,
                "LOG_SHIPPER_SOCKET_TIMEOUT_MS",
                defaults.socket_timeout,
            )?,
            retry_interval: parse_duration_ms(
                vars,
                "LOG_SHIPPER_RETRY_INTERVAL_MS",
                defaults.retry_interval,
            )?,
            poll_interval: parse_duration_ms(
                vars,
                "LOG_SHIPPER_FLUSHING_ACCURACY_MS",
                defaults.poll_interval,
            )?,
            max_flush_interval: parse_duration_ms(
                vars,
                "LOG_SHIPPER_MAX_FLUSH_INTERVAL_MS",
                defaults.max_flush_interval,
            )?,
            batch_size: parse_number(vars, "LOG_SHIPPER_MESSAGES_PER_REQUEST", defaults.batch_size)?,
            max_queue_bytes: parse_number(
                vars,
                "LOG_SHIPPER_MAX_QUEUE_BYTES",
                defaults.max_queue_bytes,
            )?,
            proxy: parse_proxy(vars)?,
            compression: parse_compression(vars)?,
            headers: parse_headers(vars)?,
            url: defaults.url,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.url.scheme() {
            "http" | "https" => {}
            other => return Err(ConfigError::UrlUnsupportedScheme(other.to_owned())),
        }
        if self.source_name.is_empty() {
            return Err(ConfigError::EmptySourceName);
        }
        // Sent as a header on every request.
        if HeaderValue::from_str(&self.source_name).is_err() {
            return Err(ConfigError::InvalidHeader(
                self.source_name.clone(),
                "source name is not a valid header value",
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("batch size"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero("flushing accuracy"));
        }
        if self.max_queue_bytes == 0 {
            return Err(ConfigError::Zero("max queue bytes"));
        }
        for (name, value) in &self.headers {
            check_header(name, value)?;
        }
        Ok(())
    }
}

fn parse_url(vars: &HashMap<String, String>) -> Result<Url, ConfigError> {
    let raw = vars
        .get("LOG_SHIPPER_URL")
        .filter(|s| !s.is_empty())
        .ok_or(ConfigError::UrlMissing)?;

    Url::parse(raw).map_err(|_| ConfigError::UrlInvalid(raw.clone()))
}

fn parse_number<N: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: N,
) -> Result<N, ConfigError> {
    match vars.get(name) {
        Some(val) => val
            .parse()
            .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone())),
        None => Ok(default),
    }
}

fn parse_duration_ms(
    vars: &HashMap<String, String>,
    name: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match vars.get(name) {
        Some(_) => parse_number(vars, name, 0u64).map(Duration::from_millis),
        None => Ok(default),
    }
}

fn non_empty<'a>(vars: &'a HashMap<String, String>, name: &str) -> Option<&'a String> {
    vars.get(name).filter(|s| !s.is_empty())
}

fn parse_proxy(vars: &HashMap<String, String>) -> Result<Option<ProxySettings>, ConfigError> {
    let Some(host) = non_empty(vars, "LOG_SHIPPER_PROXY_HOST") else {
        return Ok(None);
    };
    let port = match non_empty(vars, "LOG_SHIPPER_PROXY_PORT") {
        Some(_) => parse_number(vars, "LOG_SHIPPER_PROXY_PORT", 0u16)?,
        None => return Err(ConfigError::ProxyPortMissing),
    };

    let credentials = |scheme: &'static str| {
        match (
            non_empty(vars, "LOG_SHIPPER_PROXY_USER"),
            non_empty(vars, "LOG_SHIPPER_PROXY_PASSWORD"),
        ) {
            (Some(user), Some(password)) => Ok((user.clone(), password.clone())),
            _ => Err(ConfigError::ProxyCredentialsMissing(scheme)),
        }
    };

    let auth = match non_empty(vars, "LOG_SHIPPER_PROXY_AUTH").map(|s| s.to_ascii_lowercase()) {
        None => ProxyAuth::None,
        Some(scheme) if scheme == "basic" => {
            let (user, password) = credentials("basic")?;
            ProxyAuth::Basic { user, password }
        }
        Some(scheme) if scheme == "ntlm" => {
            let (user, password) = credentials("ntlm")?;
            ProxyAuth::Ntlm {
                user,
                password,
                domain: non_empty(vars, "LOG_SHIPPER_PROXY_DOMAIN").cloned(),
            }
        }
        Some(other) => return Err(ConfigError::InvalidProxyAuth(other)),
    };

    Ok(Some(ProxySettings {
        host: host.clone(),
        port,
        auth,
    }))
}

fn parse_compression(vars: &HashMap<String, String>) -> Result<Compression, ConfigError> {
    match vars.get("LOG_SHIPPER_COMPRESSION").map(|s| s.as_str()) {
        Some("none") | Some("") | None => Ok(Compression::None),
        Some("gzip") => Ok(Compression::Gzip),
        Some(other) => Err(ConfigError::InvalidCompression(other.to_owned())),
    }
}

/// `LOG_SHIPPER_HEADERS=name=value,name2=value2`. Blank entries are skipped;
/// an entry without `=` or an empty name is an error.
fn parse_headers(vars: &HashMap<String, String>) -> Result<Vec<(String, String)>, ConfigError> {
    let Some(raw) = non_empty(vars, "LOG_SHIPPER_HEADERS") else {
        return Ok(Vec::new());
    };

    let mut headers = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                headers.push((name.trim().to_owned(), value.trim().to_owned()));
            }
            _ => return Err(ConfigError::InvalidHeader(entry.to_owned(), "expected name=value")),
        }
    }
    Ok(headers)
}

fn check_header(name: &str, value: &str) -> Result<(), ConfigError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| ConfigError::InvalidHeader(name.to_owned(), "invalid header name"))?;
    HeaderValue::from_str(value)
        .map_err(|_| ConfigError::InvalidHeader(name.to_owned(), "invalid header value"))?;
    Ok(())
}
