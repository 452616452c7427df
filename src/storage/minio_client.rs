use anyhow::{Result, anyhow};
use async_trait::async_trait;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use tracing::{error, info};

use super::artifact_store::{ArtifactStore, snapshot_key};
use crate::config::MinioConfig;
use crate::error::{PipelineError, PipelineResult};

/// Artifact store on a MinIO (S3-compatible) bucket.
///
/// Layout: `artifacts/models/<name>.bin`, `artifacts/lists/<name>.json`,
/// `clean/<table>/<date>-<time>.parquet`.
pub struct MinioArtifactStore {
    bucket: Bucket,
}

impl MinioArtifactStore {
    pub fn new(endpoint: &str, access_key: &str, secret_key: &str, bucket_name: &str) -> Result<Self> {
        let region = Region::Custom {
            region: "us-east-1".to_owned(),
            endpoint: endpoint.to_owned(),
        };
        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)?;
        let bucket = Bucket::new(bucket_name, region, credentials)?;

        // MinIO needs path-style addressing
        Ok(MinioArtifactStore {
            bucket: *bucket.with_path_style(),
        })
    }

    pub fn from_config(config: &MinioConfig) -> Result<Self> {
        config.validate()?;

        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
        };
        let keys = config.credentials()?;
        let credentials = Credentials::new(
            Some(keys.access_key.as_str()),
            Some(keys.secret_key.as_str()),
            None,
            None,
            None,
        )?;
        let bucket = Bucket::new(&config.bucket_name, region, credentials)?;

        let bucket = if config.path_style {
            *bucket.with_path_style()
        } else {
            *bucket
        };

        Ok(MinioArtifactStore { bucket })
    }

    pub async fn ensure_bucket(&self) -> Result<()> {
        match self.bucket.exists().await {
            Ok(true) => {
                info!("Bucket '{}' already exists", self.bucket.name);
            }
            Ok(false) => {
                let config = s3::BucketConfiguration::default();
                s3::Bucket::create(
                    &self.bucket.name,
                    self.bucket.region.clone(),
                    self.bucket.credentials().await?,
                    config,
                )
                .await
                .map_err(|e| anyhow!("Failed to create bucket: {}", e))?;
                info!("Created bucket: {}", self.bucket.name);
            }
            Err(e) => {
                return Err(anyhow!("Failed to check bucket existence: {}", e));
            }
        }
        Ok(())
    }

    pub fn get_bucket_name(&self) -> &str {
        &self.bucket.name
    }

    pub fn model_key(name: &str) -> String {
        format!("artifacts/models/{}.bin", name)
    }

    pub fn list_key(name: &str) -> String {
        format!("artifacts/lists/{}.json", name)
    }

    async fn put(&self, key: &str, data: &[u8]) -> PipelineResult<()> {
        let response = self
            .bucket
            .put_object(key, data)
            .await
            .map_err(|e| PipelineError::Artifact(format!("Failed to store {}: {}", key, e)))?;

        if response.status_code() == 200 {
            info!("Stored object: {}", key);
            Ok(())
        } else {
            error!("Failed to store {}: HTTP {}", key, response.status_code());
            Err(PipelineError::Artifact(format!(
                "Failed to store {}: HTTP {}",
                key,
                response.status_code()
            )))
        }
    }

    async fn get(&self, key: &str) -> PipelineResult<Vec<u8>> {
        let response = self.bucket.get_object(key).await.map_err(|e| match e {
            S3Error::HttpFailWithBody(404, _) => {
                PipelineError::PrecursorMissing(format!("no object at {}", key))
            }
            other => PipelineError::Artifact(format!("Failed to get {}: {}", key, other)),
        })?;

        match response.status_code() {
            200 => Ok(response.bytes().to_vec()),
            404 => Err(PipelineError::PrecursorMissing(format!("no object at {}", key))),
            status => Err(PipelineError::Artifact(format!("Failed to get {}: HTTP {}", key, status))),
        }
    }
}

#[async_trait]
impl ArtifactStore for MinioArtifactStore {
    async fn put_model(&self, name: &str, bytes: Vec<u8>) -> PipelineResult<()> {
        self.put(&Self::model_key(name), &bytes).await
    }

    async fn get_model(&self, name: &str) -> PipelineResult<Vec<u8>> {
        self.get(&Self::model_key(name)).await
    }

    async fn put_named_list(&self, name: &str, list: Vec<String>) -> PipelineResult<()> {
        let body = serde_json::to_vec(&list)?;
        self.put(&Self::list_key(name), &body).await
    }

    async fn get_named_list(&self, name: &str) -> PipelineResult<Vec<String>> {
        let body = self.get(&Self::list_key(name)).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn put_snapshot(&self, table: &str, parquet: Vec<u8>) -> PipelineResult<String> {
        let key = snapshot_key(table);
        self.put(&key, &parquet).await?;
        info!("Stored Parquet file: {}", key);
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minio_store_creation() {
        let store = MinioArtifactStore::new(
            "http://localhost:9000",
            "test_access_key",
            "test_secret_key",
            "scent-test",
        )
        .unwrap();
        assert_eq!(store.get_bucket_name(), "scent-test");
    }

    #[test]
    fn test_object_keys() {
        assert_eq!(MinioArtifactStore::model_key("scent_v3"), "artifacts/models/scent_v3.bin");
        assert_eq!(MinioArtifactStore::list_key("scent_current"), "artifacts/lists/scent_current.json");
    }

    #[test]
    fn test_store_from_config() {
        let mut config = MinioConfig::default();
        assert!(MinioArtifactStore::from_config(&config).is_err());

        unsafe {
            std::env::set_var("SCENT_TEST_STORE_ACCESS_KEY", "test_access");
            std::env::set_var("SCENT_TEST_STORE_SECRET_KEY", "test_secret");
        }
        config.access_key_var = "SCENT_TEST_STORE_ACCESS_KEY".to_string();
        config.secret_key_var = "SCENT_TEST_STORE_SECRET_KEY".to_string();
        config.load_credentials().unwrap();

        let store = MinioArtifactStore::from_config(&config).unwrap();
        assert_eq!(store.get_bucket_name(), "scent-recommender");
    }

    #[tokio::test]
    #[ignore = "needs a running MinIO at localhost:9000"]
    async fn test_artifact_round_trip_against_minio() {
        let store = MinioArtifactStore::new("http://localhost:9000", "minioadmin", "minioadmin", "scent-test")
            .unwrap();
        store.ensure_bucket().await.unwrap();

        store
            .put_named_list("scent_train_v1", vec!["rose".to_string(), "oud".to_string()])
            .await
            .unwrap();
        let list = store.get_named_list("scent_train_v1").await.unwrap();
        assert_eq!(list, vec!["rose", "oud"]);

        let missing = store.get_model("never_written").await.unwrap_err();
        assert!(missing.is_precursor_missing());
    }
}
