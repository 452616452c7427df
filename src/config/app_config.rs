use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Application configuration loaded from TOML with `SCENT__` environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub origin: OriginConfig,
    pub fetch: FetchConfig,
    pub discovery: DiscoveryConfig,
    pub training: TrainingConfig,
}

/// The third-party site pages are read from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    pub base_url: String,
    pub proxy_list_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub direct_timeout_seconds: u64,
    pub proxy_list_timeout_seconds: u64,
    pub proxy_timeout_seconds: u64,
    /// Item pages fetched concurrently during one ingestion batch.
    pub concurrency: usize,
    pub refresh_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub index_name: String,
    pub hits_per_page: u32,
    pub max_candidates: usize,
    /// Environment variable holding the search endpoint key.
    pub key_variable: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub depth_grid: Vec<u16>,
    pub n_trees: u16,
    /// Every n-th row is held out for scoring a grid candidate.
    pub holdout_every: usize,
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("SCENT").separator("__"))
            .build()
            .with_context(|| format!("Failed to read application config: {}", path))?;

        let app_config: AppConfig = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse application config: {}", path))?;

        app_config.validate()?;
        Ok(app_config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let app_config: AppConfig = toml::from_str(content)?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.origin.base_url.is_empty() {
            return Err(anyhow::anyhow!("Origin base_url cannot be empty"));
        }
        if self.fetch.concurrency == 0 {
            return Err(anyhow::anyhow!("Fetch concurrency must be at least 1"));
        }
        if self.discovery.max_candidates == 0 {
            return Err(anyhow::anyhow!("Discovery max_candidates must be at least 1"));
        }
        if self.training.depth_grid.is_empty() {
            return Err(anyhow::anyhow!("Training depth_grid cannot be empty"));
        }
        Ok(())
    }
}

impl FetchConfig {
    pub fn direct_timeout(&self) -> Duration {
        Duration::from_secs(self.direct_timeout_seconds)
    }

    pub fn proxy_list_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_list_timeout_seconds)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout_seconds)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            direct_timeout_seconds: 10,
            proxy_list_timeout_seconds: 5,
            proxy_timeout_seconds: 3,
            concurrency: 4,
            refresh_batch_size: 20,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            index_name: "fragrantica_perfumes".to_string(),
            hits_per_page: 80,
            max_candidates: 3,
            key_variable: "SEARCH_INDEX_KEY".to_string(),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            depth_grid: vec![10, 20, 30, 35],
            n_trees: 100,
            holdout_every: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[origin]
base_url = "https://www.example-scents.com"
proxy_list_url = "https://proxies.example.com/list.txt"

[fetch]
direct_timeout_seconds = 10
proxy_list_timeout_seconds = 5
proxy_timeout_seconds = 3
concurrency = 2
refresh_batch_size = 10

[discovery]
index_name = "perfumes"
hits_per_page = 80
max_candidates = 3
key_variable = "SEARCH_INDEX_KEY"

[training]
depth_grid = [10, 20]
n_trees = 50
holdout_every = 3
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.origin.base_url, "https://www.example-scents.com");
        assert_eq!(config.fetch.proxy_timeout(), Duration::from_secs(3));
        assert_eq!(config.fetch.proxy_list_timeout(), Duration::from_secs(5));
        assert_eq!(config.discovery.max_candidates, 3);
        assert_eq!(config.training.depth_grid, vec![10, 20]);
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let broken = SAMPLE.replace("concurrency = 2", "concurrency = 0");
        assert!(AppConfig::from_toml_str(&broken).is_err());
    }

    #[test]
    fn test_default_fetch_timeouts() {
        let fetch = FetchConfig::default();
        assert_eq!(fetch.proxy_list_timeout_seconds, 5);
        assert_eq!(fetch.proxy_timeout_seconds, 3);
    }
}
