use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::transport::{HttpTransport, random_user_agent};
use crate::config::{FetchConfig, OriginConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::models::RawPage;

/// Progress of one `fetch` call.
///
/// The proxy list is captured once on leaving `Direct`, so `TryingProxy(i)`
/// walks a fixed slice and the call makes at most `1 + proxies.len()` attempts.
#[derive(Debug)]
pub enum FetchState {
    Direct,
    TryingProxy(usize),
    Exhausted,
    Succeeded(RawPage),
}

/// Fetches origin pages directly, falling back to a single pass over a fresh proxy list.
pub struct PageFetcher {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    proxy_list_url: Option<String>,
    config: FetchConfig,
}

impl PageFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, origin: &OriginConfig, config: FetchConfig) -> Self {
        PageFetcher {
            transport,
            base_url: origin.base_url.trim_end_matches('/').to_string(),
            proxy_list_url: origin.proxy_list_url.clone(),
            config,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for an origin path. Absolute inputs pass through unchanged.
    pub fn page_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Fetch one page. A terminal failure is returned to the caller, who decides when to retry.
    pub async fn fetch(&self, path: &str) -> PipelineResult<RawPage> {
        let url = self.page_url(path);
        let mut proxies: Vec<String> = Vec::new();
        let mut attempts = 0usize;
        let mut state = FetchState::Direct;

        loop {
            state = match state {
                FetchState::Direct => {
                    attempts += 1;
                    match self.attempt(&url, None).await {
                        Ok(body) => FetchState::Succeeded(self.raw_page(path, &url, body, None)),
                        Err(e) => {
                            info!("{} direct fetch failed: {}. Getting proxies", url, e);
                            proxies = self.proxy_list().await;
                            if proxies.is_empty() {
                                FetchState::Exhausted
                            } else {
                                FetchState::TryingProxy(0)
                            }
                        }
                    }
                }
                FetchState::TryingProxy(index) => {
                    attempts += 1;
                    let proxy = &proxies[index];
                    info!("Checking proxy {} ({}/{})", proxy, index + 1, proxies.len());
                    match self.attempt(&url, Some(proxy)).await {
                        Ok(body) => FetchState::Succeeded(self.raw_page(
                            path,
                            &url,
                            body,
                            Some(proxy.clone()),
                        )),
                        Err(e) => {
                            info!("{} through {} failed: {}", path, proxy, e);
                            if index + 1 < proxies.len() {
                                FetchState::TryingProxy(index + 1)
                            } else {
                                FetchState::Exhausted
                            }
                        }
                    }
                }
                FetchState::Succeeded(page) => {
                    info!(
                        "Successfully fetched {} characters from {} after {} attempt(s)",
                        page.body.len(),
                        url,
                        attempts
                    );
                    return Ok(page);
                }
                FetchState::Exhausted => {
                    error!("❌ Fetching {} failed with all options ({} attempts)", url, attempts);
                    return Err(PipelineError::transport(
                        &url,
                        format!("all {} attempts failed", attempts),
                    ));
                }
            };
        }
    }

    async fn attempt(&self, url: &str, proxy: Option<&str>) -> PipelineResult<String> {
        let limit = match proxy {
            Some(_) => self.config.proxy_timeout(),
            None => self.config.direct_timeout(),
        };

        let reply = self
            .transport
            .get(url, proxy, random_user_agent(), limit)
            .await?;

        if !reply.is_ok() {
            return Err(PipelineError::transport(url, format!("HTTP status {}", reply.status)));
        }

        Ok(reply.body)
    }

    /// Fresh proxy candidates. Any failure yields an empty list, which ends the fallback path.
    pub async fn proxy_list(&self) -> Vec<String> {
        let Some(list_url) = self.proxy_list_url.as_deref() else {
            warn!("No proxy list configured");
            return Vec::new();
        };

        match self
            .transport
            .get(list_url, None, random_user_agent(), self.config.proxy_list_timeout())
            .await
        {
            Ok(reply) if reply.is_ok() => {
                let proxies = parse_proxy_list(&reply.body);
                info!("Found {} proxies", proxies.len());
                proxies
            }
            Ok(reply) => {
                error!("Proxies url returned status code: {}", reply.status);
                Vec::new()
            }
            Err(e) => {
                error!("Failed while getting proxies: {}", e);
                Vec::new()
            }
        }
    }

    fn raw_page(&self, path: &str, url: &str, body: String, via_proxy: Option<String>) -> RawPage {
        RawPage {
            path: path.to_string(),
            url: url.to_string(),
            body,
            via_proxy,
        }
    }
}

/// Lines starting with `http` are candidates; duplicates keep their first position.
pub fn parse_proxy_list(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .filter(|line| line.starts_with("http"))
        .map(str::trim_end)
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect()
}
