pub mod http;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("canceled")]
    Canceled,

    #[error("transport error: {0}")]
    Io(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

#[derive(Debug, Clone)]
pub struct DriverRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl DriverRequest {
    pub fn new(url: &str) -> Self {
        Self { url: url.to_string(), headers: vec![] }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An open response: status line, headers and a body read chunk by chunk.
/// Dropping it closes the underlying connection.
#[async_trait]
pub trait Connection: Send {
    fn status(&self) -> u16;
    fn header(&self, name: &str) -> Option<String>;

    /// Next body chunk, `None` at end of body.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, DriverError>;
}

#[async_trait]
pub trait TransferDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self, req: &DriverRequest) -> Result<Box<dyn Connection>, DriverError>;
}

pub async fn connect_cancelable(
    driver: &dyn TransferDriver,
    req: &DriverRequest,
    cancel: &CancellationToken,
) -> Result<Box<dyn Connection>, DriverError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DriverError::Canceled),
        r = driver.connect(req) => r,
    }
}

pub async fn read_cancelable(
    conn: &mut dyn Connection,
    cancel: &CancellationToken,
) -> Result<Option<Bytes>, DriverError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DriverError::Canceled),
        r = conn.read_chunk() => r,
    }
}
