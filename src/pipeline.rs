use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::catalog::{CatalogDiscovery, CatalogMerger, IngestReport, KeyStore};
use crate::config::AppConfig;
use crate::error::PipelineResult;
use crate::fetcher::{HttpTransport, PageFetcher};
use crate::models::{CatalogEntry, ItemId, VoteRecord};
use crate::processor::{FeatureAligner, PageExtractor};
use crate::storage::table_store::{CATALOG_FULL, catalog_entry_at, rows_named};
use crate::storage::{ArtifactStore, Storage, rows_of};
use crate::training::{
    Assessment, PredictionService, SupervisorStatus, Trainer, TrainingSupervisor, TriggerOutcome,
};

#[derive(Debug)]
pub enum AddOutcome {
    /// Brand catalogs merged and their new items fetched.
    Added { brands: usize, items: usize },
    /// Discovery found no brand for the name.
    NotFound,
    /// Some listing or item pages could not be fetched. Everything else was committed.
    RetryLater(String),
}

#[derive(Debug)]
pub struct NameOutcome {
    pub name: String,
    pub outcome: AddOutcome,
}

impl NameOutcome {
    pub fn message(&self) -> String {
        match &self.outcome {
            AddOutcome::Added { .. } => format!("{} has been added", self.name),
            AddOutcome::NotFound => format!("Can't find {}", self.name),
            AddOutcome::RetryLater(_) => {
                format!("{} cannot be added. Please try again in a few minutes", self.name)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct VoteReport {
    pub recorded: Vec<ItemId>,
    pub unknown: Vec<String>,
    pub training: Option<TriggerOutcome>,
}

#[derive(Debug, Default)]
pub struct RefreshReport {
    /// Catalog items that had no attributes when the refresh started.
    pub pending: usize,
    pub committed: Vec<ItemId>,
    pub stopped_at: Option<ItemId>,
}

/// The acquisition and recommendation flows over one storage handle.
pub struct ScentPipeline {
    discovery: CatalogDiscovery,
    merger: Arc<CatalogMerger>,
    storage: Arc<dyn Storage>,
    supervisor: TrainingSupervisor,
    prediction: PredictionService,
    refresh_batch_size: usize,
}

impl ScentPipeline {
    pub fn new(
        config: &AppConfig,
        transport: Arc<dyn HttpTransport>,
        keys: Arc<dyn KeyStore>,
        storage: Arc<dyn Storage>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> PipelineResult<Self> {
        let fetcher = Arc::new(PageFetcher::new(transport.clone(), &config.origin, config.fetch.clone()));
        let extractor = Arc::new(PageExtractor::new(&config.origin.base_url)?);
        let aligner = Arc::new(FeatureAligner::new()?);

        let merger = Arc::new(CatalogMerger::new(
            fetcher,
            extractor,
            storage.clone(),
            config.fetch.concurrency,
        ));
        let discovery = CatalogDiscovery::new(
            transport,
            keys,
            config.discovery.clone(),
            config.fetch.direct_timeout(),
        );
        let trainer = Arc::new(Trainer::new(aligner.clone(), config.training.clone()));
        let supervisor = TrainingSupervisor::new(trainer, storage.clone(), artifacts.clone());
        let prediction = PredictionService::new(storage.clone(), artifacts, aligner, merger.clone());

        Ok(ScentPipeline {
            discovery,
            merger,
            storage,
            supervisor,
            prediction,
            refresh_batch_size: config.fetch.refresh_batch_size.max(1),
        })
    }

    /// Adds every comma-separated name. One name failing does not stop the others.
    pub async fn add_names(&self, names: &str) -> Vec<NameOutcome> {
        info!("Adding new data to catalog");
        let mut outcomes = Vec::new();
        for name in names.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            let outcome = self.add_name(name).await;
            match &outcome {
                AddOutcome::Added { brands, items } => {
                    info!("✅ {} added ({} brand(s), {} item(s))", name, brands, items)
                }
                AddOutcome::NotFound => warn!("Can't find {}", name),
                AddOutcome::RetryLater(reason) => error!("❌ {} cannot be added: {}", name, reason),
            }
            outcomes.push(NameOutcome {
                name: name.to_string(),
                outcome,
            });
        }
        outcomes
    }

    async fn add_name(&self, name: &str) -> AddOutcome {
        let candidates = match self.discovery.discover(name).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("No candidates for {}: {}", name, e);
                return AddOutcome::NotFound;
            }
        };
        if candidates.is_empty() {
            return AddOutcome::NotFound;
        }

        let mut items = 0;
        let mut problems = Vec::new();
        for candidate in &candidates {
            let entries = match self.merger.merge_brand_catalog(candidate).await {
                Ok(entries) => entries,
                Err(e) => {
                    problems.push(format!("{}: {}", candidate.designer, e));
                    continue;
                }
            };

            let missing = match self.without_attributes(entries).await {
                Ok(missing) => missing,
                Err(e) => return AddOutcome::RetryLater(e.to_string()),
            };
            match self.merger.ingest_each(&missing).await {
                Ok(report) => {
                    items += report.committed.len();
                    problems.extend(
                        report
                            .failures
                            .iter()
                            .map(|failure| format!("{}: {}", failure.source_path, failure.error)),
                    );
                }
                Err(e) => return AddOutcome::RetryLater(e.to_string()),
            }
        }

        if !problems.is_empty() {
            return AddOutcome::RetryLater(problems.join("; "));
        }
        AddOutcome::Added {
            brands: candidates.len(),
            items,
        }
    }

    /// Runs every catalog item without attributes through ingestion, batch by batch.
    pub async fn refresh_catalog(&self) -> PipelineResult<RefreshReport> {
        let catalog = self.storage.query("perfumes_catalog").await?;
        let entries = (0..catalog.height())
            .map(|row| catalog_entry_at(&catalog, row))
            .collect::<PipelineResult<Vec<_>>>()?;
        let pending = self.without_attributes(entries).await?;
        info!("{} catalog item(s) have no attributes yet", pending.len());

        let mut report = RefreshReport {
            pending: pending.len(),
            ..RefreshReport::default()
        };
        for batch in pending.chunks(self.refresh_batch_size) {
            let IngestReport { committed, failures } = self.merger.ingest_items(batch).await?;
            report.committed.extend(committed);
            if let Some(failure) = failures.first() {
                report.stopped_at = Some(failure.item_id);
                break;
            }
        }
        Ok(report)
    }

    /// Records the same vote for every named item, then schedules a training run.
    pub async fn submit_votes(&self, full_names: &[String], liked: bool) -> PipelineResult<VoteReport> {
        let mut report = VoteReport::default();
        let mut seen = HashSet::new();
        let mut votes = Vec::new();

        for full_name in full_names {
            let found = rows_named(self.storage.as_ref(), CATALOG_FULL, full_name).await?;
            if found.height() == 0 {
                warn!("No results found for {}", full_name);
                report.unknown.push(full_name.clone());
                continue;
            }
            let entry = catalog_entry_at(&found, 0)?;
            if seen.insert(entry.id) {
                votes.push(VoteRecord {
                    item_id: entry.id,
                    liked,
                });
            }
        }

        if votes.is_empty() {
            return Ok(report);
        }
        self.storage.upsert("my_votes", rows_of(&votes)?).await?;
        report.recorded = votes.iter().map(|vote| vote.item_id).collect();
        info!("Your vote for {} item(s) is added", report.recorded.len());

        report.training = Some(self.supervisor.trigger().await);
        Ok(report)
    }

    pub async fn assess(&self, full_name: &str) -> PipelineResult<Assessment> {
        self.prediction.assess(full_name).await
    }

    /// Runs training now and waits for it and any queued follow-up.
    pub async fn train_and_wait(&self) -> SupervisorStatus {
        self.supervisor.trigger().await;
        self.supervisor.wait_idle().await;
        self.supervisor.status().await
    }

    pub async fn wait_for_training(&self) {
        self.supervisor.wait_idle().await;
    }

    async fn without_attributes(&self, entries: Vec<CatalogEntry>) -> PipelineResult<Vec<CatalogEntry>> {
        let attributes = self.storage.query("perfumes_data").await?;
        let known: HashSet<ItemId> = attributes
            .column("perfume_id")?
            .i64()?
            .into_iter()
            .flatten()
            .collect();
        Ok(entries
            .into_iter()
            .filter(|entry| !known.contains(&entry.id))
            .collect())
    }
}
