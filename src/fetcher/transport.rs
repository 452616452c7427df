use anyhow::Result;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::time::Duration;
use tokio::time::timeout;
use wreq::{Client, Proxy};
use wreq_util::Emulation;

use crate::error::{PipelineError, PipelineResult};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.4; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:136.0) Gecko/20100101 Firefox/136.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:136.0) Gecko/20100101 Firefox/136.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36 Edg/123.0.0.0",
];

/// Picks a fresh user-agent string for one attempt.
pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Status and body of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// One request/response round trip. Implementations must not retry.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        proxy: Option<&str>,
        user_agent: &str,
        limit: Duration,
    ) -> PipelineResult<HttpReply>;

    async fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: String,
        limit: Duration,
    ) -> PipelineResult<HttpReply>;
}

/// Transport backed by a browser-emulating `wreq` client.
pub struct WreqTransport {
    direct: Client,
}

impl WreqTransport {
    pub fn new() -> Result<Self> {
        let direct = Client::builder()
            .emulation(Emulation::Firefox136)
            .build()?;

        Ok(WreqTransport { direct })
    }

    fn proxied_client(&self, proxy_url: &str) -> PipelineResult<Client> {
        let proxy = Proxy::all(proxy_url)
            .map_err(|e| PipelineError::transport(proxy_url, format!("invalid proxy: {}", e)))?;

        Client::builder()
            .emulation(Emulation::Firefox136)
            .proxy(proxy)
            .build()
            .map_err(|e| PipelineError::transport(proxy_url, format!("client build failed: {}", e)))
    }
}

#[async_trait]
impl HttpTransport for WreqTransport {
    async fn get(
        &self,
        url: &str,
        proxy: Option<&str>,
        user_agent: &str,
        limit: Duration,
    ) -> PipelineResult<HttpReply> {
        let client = match proxy {
            Some(proxy_url) => self.proxied_client(proxy_url)?,
            None => self.direct.clone(),
        };

        let exchange = async {
            let response = client
                .get(url)
                .header("User-Agent", user_agent)
                .send()
                .await
                .map_err(|e| PipelineError::transport(url, format!("network error: {}", e)))?;

            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| PipelineError::transport(url, format!("failed to read body: {}", e)))?;

            Ok::<_, PipelineError>(HttpReply { status, body })
        };

        timeout(limit, exchange)
            .await
            .map_err(|_| PipelineError::transport(url, format!("timed out after {:?}", limit)))?
    }

    async fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: String,
        limit: Duration,
    ) -> PipelineResult<HttpReply> {
        let mut request = self.direct.post(url);
        for (key, value) in headers {
            request = request.header(*key, *value);
        }

        let exchange = async {
            let response = request
                .body(body)
                .send()
                .await
                .map_err(|e| PipelineError::transport(url, format!("network error: {}", e)))?;

            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| PipelineError::transport(url, format!("failed to read body: {}", e)))?;

            Ok::<_, PipelineError>(HttpReply { status, body })
        };

        timeout(limit, exchange)
            .await
            .map_err(|_| PipelineError::transport(url, format!("timed out after {:?}", limit)))?
    }
}
