//! Scripted in-memory server used by the engine tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::driver::{Connection, DriverError, DriverRequest, TransferDriver};

pub struct MockDriver {
    body: Mutex<Bytes>,
    etag: Mutex<Option<String>>,
    last_modified: Option<String>,
    accept_ranges: bool,
    chunked: bool,
    status_override: Option<u16>,
    fail_connects: AtomicBool,
    chunk_size: usize,
    chunk_delay_ms: AtomicU64,
    connects: AtomicUsize,
    served: Arc<AtomicU64>,
    open: Arc<AtomicUsize>,
    max_open: Arc<AtomicUsize>,
    requests: Mutex<Vec<DriverRequest>>,
}

impl MockDriver {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Mutex::new(Bytes::from(body)),
            etag: Mutex::new(Some("\"v1\"".to_string())),
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
            accept_ranges: true,
            chunked: false,
            status_override: None,
            fail_connects: AtomicBool::new(false),
            chunk_size: 1024,
            chunk_delay_ms: AtomicU64::new(0),
            connects: AtomicUsize::new(0),
            served: Arc::new(AtomicU64::new(0)),
            open: Arc::new(AtomicUsize::new(0)),
            max_open: Arc::new(AtomicUsize::new(0)),
            requests: Mutex::new(vec![]),
        }
    }

    pub fn without_validators(self) -> Self {
        *self.etag.lock() = None;
        Self { last_modified: None, ..self }
    }

    pub fn without_ranges(self) -> Self {
        Self { accept_ranges: false, ..self }
    }

    pub fn chunked(self) -> Self {
        Self { chunked: true, ..self }
    }

    pub fn with_status(self, status: u16) -> Self {
        Self { status_override: Some(status), ..self }
    }

    pub fn with_chunk_size(self, chunk_size: usize) -> Self {
        Self { chunk_size, ..self }
    }

    pub fn with_chunk_delay(self, delay: Duration) -> Self {
        self.set_chunk_delay(delay);
        self
    }

    pub fn failing(self) -> Self {
        self.set_failing(true);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_connects.store(failing, Ordering::SeqCst);
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        self.chunk_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Swaps the served entity, as if the file changed on the server.
    pub fn replace_body(&self, body: Vec<u8>, etag: &str) {
        *self.body.lock() = Bytes::from(body);
        *self.etag.lock() = Some(etag.to_string());
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    pub fn reset_served(&self) {
        self.served.store(0, Ordering::SeqCst);
    }

    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<DriverRequest> {
        self.requests.lock().clone()
    }

    fn validator_matches(&self, value: &str) -> bool {
        self.etag.lock().as_deref() == Some(value) || self.last_modified.as_deref() == Some(value)
    }

    fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
        let spec = value.strip_prefix("bytes=")?;
        let (a, b) = spec.split_once('-')?;
        let start: u64 = a.parse().ok()?;
        let end = if b.is_empty() { len.saturating_sub(1) } else { b.parse::<u64>().ok()?.min(len.saturating_sub(1)) };
        Some((start, end))
    }

    fn response(&self, status: u16, headers: Vec<(String, String)>, data: Bytes) -> Box<dyn Connection> {
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now, Ordering::SeqCst);
        Box::new(MockConnection {
            status,
            headers,
            data,
            pos: 0,
            chunk_size: self.chunk_size.max(1),
            delay: Duration::from_millis(self.chunk_delay_ms.load(Ordering::SeqCst)),
            served: self.served.clone(),
            open: self.open.clone(),
        })
    }
}

#[async_trait]
impl TransferDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock-driver"
    }

    async fn connect(&self, req: &DriverRequest) -> Result<Box<dyn Connection>, DriverError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(req.clone());
        tokio::task::yield_now().await;

        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(DriverError::Io("connection refused".to_string()));
        }
        if let Some(status) = self.status_override {
            return Ok(self.response(status, vec![], Bytes::new()));
        }

        let body = self.body.lock().clone();
        let len = body.len() as u64;
        let mut headers = vec![];
        if let Some(etag) = self.etag.lock().clone() {
            headers.push(("ETag".to_string(), etag));
        }
        if let Some(lm) = &self.last_modified {
            headers.push(("Last-Modified".to_string(), lm.clone()));
        }
        if self.accept_ranges {
            headers.push(("Accept-Ranges".to_string(), "bytes".to_string()));
        }

        let not_modified = req.get_header("If-None-Match").map(|v| self.validator_matches(v)).unwrap_or(false)
            || req.get_header("If-Modified-Since").map(|v| self.validator_matches(v)).unwrap_or(false);
        if not_modified {
            return Ok(self.response(304, headers, Bytes::new()));
        }

        let range = req
            .get_header("Range")
            .filter(|_| self.accept_ranges)
            .filter(|_| req.get_header("If-Range").map(|v| self.validator_matches(v)).unwrap_or(true))
            .and_then(|v| Self::parse_range(v, len));

        match range {
            Some((start, _)) if start >= len => Ok(self.response(416, headers, Bytes::new())),
            Some((start, end)) => {
                headers.push(("Content-Range".to_string(), format!("bytes {start}-{end}/{len}")));
                headers.push(("Content-Length".to_string(), (end + 1 - start).to_string()));
                let slice = body.slice(start as usize..=end as usize);
                Ok(self.response(206, headers, slice))
            }
            None => {
                if self.chunked {
                    headers.push(("Transfer-Encoding".to_string(), "chunked".to_string()));
                } else {
                    headers.push(("Content-Length".to_string(), len.to_string()));
                }
                Ok(self.response(200, headers, body))
            }
        }
    }
}

struct MockConnection {
    status: u16,
    headers: Vec<(String, String)>,
    data: Bytes,
    pos: usize,
    chunk_size: usize,
    delay: Duration,
    served: Arc<AtomicU64>,
    open: Arc<AtomicUsize>,
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn status(&self) -> u16 {
        self.status
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>, DriverError> {
        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let end = (self.pos + self.chunk_size).min(self.data.len());
        let chunk = self.data.slice(self.pos..end);
        self.pos = end;
        self.served.fetch_add(chunk.len() as u64, Ordering::SeqCst);
        Ok(Some(chunk))
    }
}

/// Deterministic, non-repeating-looking payload.
pub fn sample_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
