use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize)]
struct MinioFile {
    minio: MinioConfig,
}

/// Artifact bucket settings from the `[minio]` section.
///
/// Credentials never live in the file: it only names the environment
/// variables holding them.
#[derive(Debug, Clone, Deserialize)]
pub struct MinioConfig {
    pub endpoint: String,
    pub bucket_name: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_path_style")]
    pub path_style: bool,
    #[serde(default = "default_access_key_var")]
    pub access_key_var: String,
    #[serde(default = "default_secret_key_var")]
    pub secret_key_var: String,
    #[serde(skip)]
    credentials: Option<MinioCredentials>,
}

#[derive(Debug, Clone)]
pub struct MinioCredentials {
    pub access_key: String,
    pub secret_key: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_path_style() -> bool {
    true
}

fn default_access_key_var() -> String {
    "MINIO_ACCESS_KEY".to_string()
}

fn default_secret_key_var() -> String {
    "MINIO_SECRET_KEY".to_string()
}

impl MinioConfig {
    /// Parses the file and resolves credentials. Either step failing means "no MinIO".
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read MinIO config file: {}", path))?;
        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse MinIO config file: {}", path))?;

        config.load_credentials()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: MinioFile = toml::from_str(content)?;
        Ok(file.minio)
    }

    pub fn load_credentials(&mut self) -> Result<()> {
        let access_key = env::var(&self.access_key_var)
            .with_context(|| format!("Missing environment variable: {}", self.access_key_var))?;
        let secret_key = env::var(&self.secret_key_var)
            .with_context(|| format!("Missing environment variable: {}", self.secret_key_var))?;

        self.credentials = Some(MinioCredentials { access_key, secret_key });
        Ok(())
    }

    pub fn credentials(&self) -> Result<&MinioCredentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| anyhow!("MinIO credentials not loaded from {} / {}", self.access_key_var, self.secret_key_var))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(anyhow!("MinIO endpoint needs an http(s) scheme: {}", self.endpoint));
        }

        // S3 naming rules: 3 to 63 of lowercase letters, digits, '-' and '.'
        let name = &self.bucket_name;
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
        if !(3..=63).contains(&name.len()) || !valid_chars || name.starts_with('-') || name.ends_with('-') {
            return Err(anyhow!("Invalid MinIO bucket name: '{}'", name));
        }

        self.credentials()?;
        Ok(())
    }
}

impl Default for MinioConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_string(),
            bucket_name: "scent-recommender".to_string(),
            region: default_region(),
            path_style: default_path_style(),
            access_key_var: default_access_key_var(),
            secret_key_var: default_secret_key_var(),
            credentials: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_defaults() {
        let config = MinioConfig::from_toml_str(
            r#"
[minio]
endpoint = "http://localhost:9000"
bucket_name = "scent-recommender"
"#,
        )
        .unwrap();
        assert_eq!(config.region, "us-east-1");
        assert!(config.path_style);
        assert_eq!(config.access_key_var, "MINIO_ACCESS_KEY");
        assert!(config.credentials().is_err());
    }

    #[test]
    fn test_bucket_and_endpoint_are_validated() {
        let mut config = MinioConfig::default();
        config.credentials = Some(MinioCredentials {
            access_key: "a".to_string(),
            secret_key: "s".to_string(),
        });
        assert!(config.validate().is_ok());

        config.bucket_name = "Scent_Artifacts".to_string();
        assert!(config.validate().is_err());
        config.bucket_name = "ab".to_string();
        assert!(config.validate().is_err());
        config.bucket_name = "scent-artifacts".to_string();

        config.endpoint = "localhost:9000".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_loading() {
        unsafe {
            env::set_var("SCENT_TEST_MINIO_ACCESS_KEY", "test_access");
            env::set_var("SCENT_TEST_MINIO_SECRET_KEY", "test_secret");
        }

        let mut config = MinioConfig::default();
        config.access_key_var = "SCENT_TEST_MINIO_ACCESS_KEY".to_string();
        config.secret_key_var = "SCENT_TEST_MINIO_SECRET_KEY".to_string();

        config.load_credentials().unwrap();
        let credentials = config.credentials().unwrap();
        assert_eq!(credentials.access_key, "test_access");
        assert_eq!(credentials.secret_key, "test_secret");

        config.secret_key_var = "SCENT_TEST_MINIO_UNSET".to_string();
        assert!(config.load_credentials().is_err());

        unsafe {
            env::remove_var("SCENT_TEST_MINIO_ACCESS_KEY");
            env::remove_var("SCENT_TEST_MINIO_SECRET_KEY");
        }
    }
}
