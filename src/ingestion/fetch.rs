use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::RETRY_AFTER;
use reqwest::Client as HttpClient;
use tracing::debug;

use super::parse::{parse_records, MalformedBody};
use super::types::{FetchWindow, RawRecord};
use crate::config::{ApiConfig, DatasetSpec};
use crate::error::{Classify, ErrorKind};
use crate::util::rate::RateLimiter;
use crate::util::retry::retry;

// Longest error body kept in a FetchError message.
const ERROR_BODY_PREVIEW: usize = 200;

/// Status, Retry-After hint and raw body of one GET.
#[derive(Clone, Debug)]
pub struct HttpReply {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    Timeout,
    Connect(String),
    Other(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Connect(msg) => write!(f, "connect failed: {msg}"),
            TransportError::Other(msg) => write!(f, "http error: {msg}"),
        }
    }
}

impl TransportError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

/// The HTTP seam: one GET with query pairs.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<HttpReply, TransportError>;
}

pub struct ReqwestTransport {
    http: HttpClient,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = HttpClient::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

fn parse_retry_after(v: &str) -> Option<Duration> {
    v.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<HttpReply, TransportError> {
        let response = self.http.get(url).query(query).send().await.map_err(TransportError::from_reqwest)?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.bytes().await.map_err(TransportError::from_reqwest)?;
        Ok(HttpReply { status, retry_after, body })
    }
}

#[derive(Debug)]
pub enum FetchError {
    RateLimited { retry_after: Option<Duration> },
    Server { status: u16 },
    Network(TransportError),
    Client { status: u16, body: String },
    Malformed(MalformedBody),
    /// Retry budget used up; `last` is the final attempt's error.
    Exhausted { attempts: u32, last: Box<FetchError> },
}

impl FetchError {
    fn from_status(reply: &HttpReply) -> Self {
        match reply.status {
            429 => FetchError::RateLimited { retry_after: reply.retry_after },
            s if s >= 500 => FetchError::Server { status: s },
            s => {
                let text = String::from_utf8_lossy(&reply.body);
                let body: String = text.chars().take(ERROR_BODY_PREVIEW).collect();
                FetchError::Client { status: s, body }
            }
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::RateLimited { retry_after: Some(d) } => write!(f, "rate limited (retry after {}s)", d.as_secs()),
            FetchError::RateLimited { retry_after: None } => write!(f, "rate limited"),
            FetchError::Server { status } => write!(f, "server error {status}"),
            FetchError::Network(e) => write!(f, "{e}"),
            FetchError::Client { status, body } => write!(f, "api error {status}: {body}"),
            FetchError::Malformed(e) => write!(f, "malformed response: {e}"),
            FetchError::Exhausted { attempts, last } => write!(f, "gave up after {attempts} attempts: {last}"),
        }
    }
}

impl std::error::Error for FetchError {}

impl Classify for FetchError {
    fn kind(&self) -> ErrorKind {
        match self {
            FetchError::RateLimited { .. } => ErrorKind::RateLimited,
            FetchError::Server { .. } | FetchError::Network(_) => ErrorKind::Transient,
            FetchError::Client { .. } | FetchError::Malformed(_) => ErrorKind::Permanent,
            FetchError::Exhausted { last, .. } => last.kind(),
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. } | FetchError::Server { .. } | FetchError::Network(_))
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Rate-limited, retrying reader of one dataset window.
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    api_key: Option<String>,
    global: RateLimiter,
    per_dataset: HashMap<String, RateLimiter>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, api: &ApiConfig, specs: &[DatasetSpec]) -> Self {
        let per_dataset = specs
            .iter()
            .filter(|s| s.min_interval_ms > 0)
            .map(|s| (s.code.clone(), RateLimiter::new(Duration::from_millis(s.min_interval_ms))))
            .collect();
        Self {
            transport,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            api_key: api.api_key.clone(),
            global: RateLimiter::new(api.min_interval()),
            per_dataset,
        }
    }

    pub fn url_for(&self, spec: &DatasetSpec) -> String {
        format!("{}{}", self.base_url, spec.endpoint_path())
    }

    fn query_for(&self, spec: &DatasetSpec, window: &FetchWindow) -> Vec<(String, String)> {
        let mut q = spec.query_for(window);
        if let Some(key) = &self.api_key { q.push(("apiKey".into(), key.clone())); }
        q
    }

    /// All records of `spec` in `window`. A 404 is an empty window, not an error.
    pub async fn fetch(&self, spec: &DatasetSpec, window: &FetchWindow) -> Result<Vec<RawRecord>, FetchError> {
        let label = format!("fetch {} {}", spec.code, window);
        retry(&spec.retry, &label, |_| self.fetch_once(spec, window)).await.map_err(|e| {
            if e.exhausted { FetchError::Exhausted { attempts: e.attempts, last: Box::new(e.last) } } else { e.last }
        })
    }

    async fn fetch_once(&self, spec: &DatasetSpec, window: &FetchWindow) -> Result<Vec<RawRecord>, FetchError> {
        self.global.acquire().await;
        if let Some(limiter) = self.per_dataset.get(&spec.code) { limiter.acquire().await; }

        let url = self.url_for(spec);
        let reply = self.transport.get(&url, &self.query_for(spec, window)).await.map_err(FetchError::Network)?;
        match reply.status {
            200..=299 => parse_records(&spec.code, spec.response_shape, &reply.body).map_err(FetchError::Malformed),
            404 => {
                debug!(dataset = %spec.code, window = %window, "404, no data for window");
                Ok(Vec::new())
            }
            _ => Err(FetchError::from_status(&reply)),
        }
    }
}
