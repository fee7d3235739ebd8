use std::time::Duration;

use anyhow::Error;
use axum::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use url::Url;

/// Status and raw body of one upstream call.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub body: String,
}

/// Sends a GET to the upstream. An `Err` means no response was received.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn get(&self, url: Url) -> Result<UpstreamReply, Error>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, Error> {
        // default headers
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        // wikimedia rejects clients without a descriptive user agent
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(120))
            .timeout(timeout)
            .build()?;

        Ok(HttpTransport { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: Url) -> Result<UpstreamReply, Error> {
        tracing::debug!("requesting pageviews, url: {}", url);
        let response = self.client.get(url).send().await?;

        let status = response.status();
        let body = response.text().await?;

        Ok(UpstreamReply { status, body })
    }
}
