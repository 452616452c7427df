pub mod discovery;
pub mod merger;

#[cfg(test)]
pub mod fixtures;

pub use discovery::{CatalogDiscovery, EnvKeyStore, KeyStore};
pub use merger::{CatalogMerger, IngestReport, ItemFailure};
