pub mod artifact_store;
pub mod minio_client;
pub mod table_store;

pub use artifact_store::{ArtifactSet, ArtifactStore, MemoryArtifactStore};
pub use minio_client::MinioArtifactStore;
pub use table_store::{MemoryTableStore, Row, Storage, TableWrite, UpsertSummary, rows_of};
