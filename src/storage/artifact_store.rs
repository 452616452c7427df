use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::models::FeatureVocabulary;

/// Pointer list naming the artifact set readers should use.
pub const CURRENT_POINTER: &str = "scent_current";

/// Named list holding `[owner, expires_at]` of the process that has the tables open.
pub const TABLES_LEASE: &str = "scent_tables_lease";

/// A holder that stops renewing is presumed gone after this long.
pub const LEASE_TTL_SECONDS: i64 = 600;

/// Blob storage for models, named lists and table snapshots.
///
/// Every `put_*` replaces the prior artifact of the same name wholesale. A
/// missing artifact is reported as `PipelineError::PrecursorMissing`.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put_model(&self, name: &str, bytes: Vec<u8>) -> PipelineResult<()>;
    async fn get_model(&self, name: &str) -> PipelineResult<Vec<u8>>;
    async fn put_named_list(&self, name: &str, list: Vec<String>) -> PipelineResult<()>;
    async fn get_named_list(&self, name: &str) -> PipelineResult<Vec<String>>;
    /// Stores parquet bytes for a table and returns the object key.
    async fn put_snapshot(&self, table: &str, parquet: Vec<u8>) -> PipelineResult<String>;
}

pub fn model_name(version: u64) -> String {
    format!("scent_v{}", version)
}

pub fn vocabulary_name(version: u64) -> String {
    format!("scent_train_v{}", version)
}

/// `clean/<table>/<yyyymmdd>-<hhmmss>.parquet`
pub fn snapshot_key(table: &str) -> String {
    let now = Utc::now();
    format!(
        "clean/{}/{}-{}.parquet",
        table,
        now.format("%Y%m%d"),
        now.format("%H%M%S")
    )
}

/// A model and the vocabulary it was fitted on, from one training run.
#[derive(Debug, Clone)]
pub struct ArtifactSet {
    pub version: u64,
    pub model: Vec<u8>,
    pub vocabulary: FeatureVocabulary,
}

pub async fn current_version(store: &dyn ArtifactStore) -> PipelineResult<Option<u64>> {
    let pointer = match store.get_named_list(CURRENT_POINTER).await {
        Ok(pointer) => pointer,
        Err(e) if e.is_precursor_missing() => return Ok(None),
        Err(e) => return Err(e),
    };

    let version = pointer
        .first()
        .ok_or_else(|| PipelineError::Artifact(format!("{} is empty", CURRENT_POINTER)))?;
    version
        .parse::<u64>()
        .map(Some)
        .map_err(|_| PipelineError::Artifact(format!("{} holds '{}', not a version", CURRENT_POINTER, version)))
}

/// Writes model and vocabulary under a fresh version, then moves the pointer.
///
/// The pointer is written last, so until it moves readers keep resolving the
/// previous complete set.
pub async fn publish_artifact_set(
    store: &dyn ArtifactStore,
    model: Vec<u8>,
    vocabulary: &FeatureVocabulary,
) -> PipelineResult<u64> {
    let version = current_version(store).await?.map_or(1, |v| v + 1);

    store.put_model(&model_name(version), model).await?;
    store
        .put_named_list(&vocabulary_name(version), vocabulary.columns().to_vec())
        .await?;
    store
        .put_named_list(CURRENT_POINTER, vec![version.to_string()])
        .await?;

    info!("Training features have been saved as version {}", version);
    Ok(version)
}

/// The set the pointer names. `PrecursorMissing` until a first training run succeeds.
pub async fn load_current_artifact_set(store: &dyn ArtifactStore) -> PipelineResult<ArtifactSet> {
    let version = current_version(store)
        .await?
        .ok_or_else(|| PipelineError::PrecursorMissing("no trained model has been published".to_string()))?;

    let model = store.get_model(&model_name(version)).await?;
    let vocabulary = FeatureVocabulary::new(store.get_named_list(&vocabulary_name(version)).await?);

    Ok(ArtifactSet {
        version,
        model,
        vocabulary,
    })
}

/// Exclusive claim on the persisted tables.
///
/// Only one process may hold it. The holder renews it on every persisted write
/// and releases it on close; a lease past its expiry can be taken over.
#[derive(Debug, Clone)]
pub struct StoreLease {
    owner: String,
}

impl StoreLease {
    pub async fn acquire(store: &dyn ArtifactStore) -> PipelineResult<Self> {
        let lease = StoreLease {
            owner: Uuid::new_v4().to_string(),
        };

        if let Some((holder, expires_at)) = read_lease(store).await? {
            if expires_at > Utc::now() {
                return Err(lease_conflict(format!(
                    "tables are held by {} until {}",
                    holder,
                    expires_at.to_rfc3339()
                )));
            }
            warn!("⚠️ Taking over lease of {} that expired at {}", holder, expires_at.to_rfc3339());
        }

        lease.write(store).await?;
        // a concurrent acquirer may have written after us
        match read_lease(store).await? {
            Some((holder, _)) if holder == lease.owner => {
                info!("🔒 Storage lease {} acquired", lease.owner);
                Ok(lease)
            }
            Some((holder, _)) => Err(lease_conflict(format!("lease taken by {} while acquiring", holder))),
            None => Err(lease_conflict("lease vanished while acquiring".to_string())),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Extends the expiry. Fails with `Conflict` once another process holds the lease.
    pub async fn renew(&self, store: &dyn ArtifactStore) -> PipelineResult<()> {
        match read_lease(store).await? {
            Some((holder, _)) if holder == self.owner => self.write(store).await,
            Some((holder, _)) => Err(lease_conflict(format!("lease lost to {}", holder))),
            None => Err(lease_conflict("lease was released".to_string())),
        }
    }

    pub async fn release(&self, store: &dyn ArtifactStore) -> PipelineResult<()> {
        match read_lease(store).await? {
            Some((holder, _)) if holder == self.owner => {
                store.put_named_list(TABLES_LEASE, Vec::new()).await?;
                info!("🔓 Storage lease {} released", self.owner);
                Ok(())
            }
            _ => {
                warn!("⚠️ Lease {} was no longer held at release", self.owner);
                Ok(())
            }
        }
    }

    async fn write(&self, store: &dyn ArtifactStore) -> PipelineResult<()> {
        let expires_at = Utc::now() + Duration::seconds(LEASE_TTL_SECONDS);
        store
            .put_named_list(TABLES_LEASE, vec![self.owner.clone(), expires_at.to_rfc3339()])
            .await
    }
}

/// Current holder and expiry. A missing, empty or unreadable lease is free.
async fn read_lease(store: &dyn ArtifactStore) -> PipelineResult<Option<(String, DateTime<Utc>)>> {
    let list = match store.get_named_list(TABLES_LEASE).await {
        Ok(list) => list,
        Err(e) if e.is_precursor_missing() => return Ok(None),
        Err(e) => return Err(e),
    };

    let [holder, expires_at] = list.as_slice() else {
        return Ok(None);
    };
    match DateTime::parse_from_rfc3339(expires_at) {
        Ok(expires_at) => Ok(Some((holder.clone(), expires_at.with_timezone(&Utc)))),
        Err(e) => {
            warn!("⚠️ Ignoring unreadable lease expiry '{}': {}", expires_at, e);
            Ok(None)
        }
    }
}

fn lease_conflict(reason: String) -> PipelineError {
    PipelineError::Conflict {
        table: TABLES_LEASE.to_string(),
        reason,
    }
}

#[derive(Default)]
pub struct MemoryArtifactStore {
    models: RwLock<HashMap<String, Vec<u8>>>,
    lists: RwLock<HashMap<String, Vec<String>>>,
    snapshots: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.snapshots.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn missing(kind: &str, name: &str) -> PipelineError {
    PipelineError::PrecursorMissing(format!("no {} named '{}'", kind, name))
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put_model(&self, name: &str, bytes: Vec<u8>) -> PipelineResult<()> {
        self.models.write().await.insert(name.to_string(), bytes);
        Ok(())
    }

    async fn get_model(&self, name: &str) -> PipelineResult<Vec<u8>> {
        self.models
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| missing("model", name))
    }

    async fn put_named_list(&self, name: &str, list: Vec<String>) -> PipelineResult<()> {
        self.lists.write().await.insert(name.to_string(), list);
        Ok(())
    }

    async fn get_named_list(&self, name: &str) -> PipelineResult<Vec<String>> {
        self.lists
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| missing("list", name))
    }

    async fn put_snapshot(&self, table: &str, parquet: Vec<u8>) -> PipelineResult<String> {
        let key = snapshot_key(table);
        self.snapshots.write().await.insert(key.clone(), parquet);
        Ok(key)
    }
}
