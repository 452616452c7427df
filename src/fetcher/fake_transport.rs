use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::transport::{HttpReply, HttpTransport};
use crate::error::{PipelineError, PipelineResult};

/// In-process transport answering from canned replies and recording every call.
#[derive(Default)]
pub struct ScriptedTransport {
    direct: HashMap<String, HttpReply>,
    proxied: HashMap<(String, String), HttpReply>,
    posts: HashMap<String, HttpReply>,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, status: u16, body: &str) -> Self {
        self.direct.insert(
            url.to_string(),
            HttpReply { status, body: body.to_string() },
        );
        self
    }

    pub fn with_proxied_page(mut self, proxy: &str, url: &str, body: &str) -> Self {
        self.proxied.insert(
            (proxy.to_string(), url.to_string()),
            HttpReply { status: 200, body: body.to_string() },
        );
        self
    }

    pub fn with_post(mut self, url: &str, status: u16, body: &str) -> Self {
        self.posts.insert(
            url.to_string(),
            HttpReply { status, body: body.to_string() },
        );
        self
    }

    /// GET calls made for `url`, direct and proxied.
    pub fn calls_for(&self, url: &str) -> Vec<Option<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(called, _)| called == url)
            .map(|(_, proxy)| proxy.clone())
            .collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(
        &self,
        url: &str,
        proxy: Option<&str>,
        _user_agent: &str,
        _limit: Duration,
    ) -> PipelineResult<HttpReply> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), proxy.map(str::to_string)));

        let reply = match proxy {
            Some(proxy_url) => self
                .proxied
                .get(&(proxy_url.to_string(), url.to_string()))
                .cloned(),
            None => self.direct.get(url).cloned(),
        };

        reply.ok_or_else(|| PipelineError::transport(url, "connection refused"))
    }

    async fn post(
        &self,
        url: &str,
        _headers: &[(&str, &str)],
        _body: String,
        _limit: Duration,
    ) -> PipelineResult<HttpReply> {
        self.posts
            .get(url)
            .cloned()
            .ok_or_else(|| PipelineError::transport(url, "connection refused"))
    }
}
