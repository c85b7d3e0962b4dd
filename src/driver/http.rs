use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

use crate::config::DownloadConfig;
use crate::driver::{Connection, DriverError, DriverRequest, TransferDriver};

pub struct HttpDriver {
    client: reqwest::Client,
}

impl HttpDriver {
    pub fn new(cfg: &DownloadConfig) -> anyhow::Result<Self> {
        // No decompression features: Content-Length must match the bytes on the wire.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .build()?;
        Ok(Self { client })
    }

    fn build_headers(req: &DriverRequest) -> Result<HeaderMap, DriverError> {
        let mut h = HeaderMap::new();
        for (k, v) in &req.headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|_| DriverError::InvalidHeader(k.clone()))?;
            let value = HeaderValue::from_str(v)
                .map_err(|_| DriverError::InvalidHeader(format!("{k}: {v}")))?;
            h.insert(name, value);
        }
        Ok(h)
    }
}

struct HttpConnection {
    resp: reqwest::Response,
}

#[async_trait]
impl Connection for HttpConnection {
    fn status(&self) -> u16 {
        self.resp.status().as_u16()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.resp
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>, DriverError> {
        self.resp.chunk().await.map_err(|e| DriverError::Io(e.to_string()))
    }
}

#[async_trait]
impl TransferDriver for HttpDriver {
    fn name(&self) -> &'static str {
        "http-driver"
    }

    async fn connect(&self, req: &DriverRequest) -> Result<Box<dyn Connection>, DriverError> {
        let headers = Self::build_headers(req)?;
        let resp = self
            .client
            .get(&req.url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| DriverError::Io(e.to_string()))?;
        Ok(Box::new(HttpConnection { resp }))
    }
}
