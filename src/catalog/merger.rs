use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{error, info};

use crate::error::{PipelineError, PipelineResult};
use crate::fetcher::PageFetcher;
use crate::models::{BrandCandidate, CatalogEntry, ExtractedItem, ItemId};
use crate::processor::PageExtractor;
use crate::processor::listing_parser::{brand_slug_from_listing, parse_brand_listing};
use crate::storage::{Storage, TableWrite, rows_of};

/// An item whose page could not be fetched or extracted.
#[derive(Debug)]
pub struct ItemFailure {
    pub item_id: ItemId,
    pub source_path: String,
    pub error: PipelineError,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    /// Items whose rows were written, in submission order.
    pub committed: Vec<ItemId>,
    /// At most one entry for a fail-fast batch.
    pub failures: Vec<ItemFailure>,
}

impl IngestReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Writes discovered catalogs and fetched item pages into storage.
pub struct CatalogMerger {
    fetcher: Arc<PageFetcher>,
    extractor: Arc<PageExtractor>,
    storage: Arc<dyn Storage>,
    concurrency: usize,
}

impl CatalogMerger {
    pub fn new(
        fetcher: Arc<PageFetcher>,
        extractor: Arc<PageExtractor>,
        storage: Arc<dyn Storage>,
        concurrency: usize,
    ) -> Self {
        CatalogMerger {
            fetcher,
            extractor,
            storage,
            concurrency: concurrency.max(1),
        }
    }

    /// Fetches the brand listing and inserts the brand and its items, ignoring known ids.
    ///
    /// A listing fetch failure writes nothing.
    pub async fn merge_brand_catalog(&self, candidate: &BrandCandidate) -> PipelineResult<Vec<CatalogEntry>> {
        info!("Getting catalog for {}", candidate.designer);
        let page = self.fetcher.fetch(&candidate.listing_path).await.map_err(|e| {
            error!("❌ Can not get catalog for {}: {}", candidate.designer, e);
            e
        })?;

        let slug = brand_slug_from_listing(&candidate.listing_path).unwrap_or_else(|| candidate.slug.clone());
        let entries = parse_brand_listing(&page.body, &slug)?;

        let summaries = self
            .storage
            .upsert_batch(vec![
                TableWrite::new("brands", rows_of(&[candidate.brand()])?),
                TableWrite::new("perfumes_catalog", rows_of(&entries)?),
            ])
            .await?;
        let inserted = summaries.last().map_or(0, |summary| summary.inserted);

        info!(
            "✅ {} has been added to catalog ({} new of {} listed)",
            candidate.designer,
            inserted,
            entries.len()
        );
        Ok(entries)
    }

    /// Overwrites the item's attributes and inserts reviews and reviewers not seen before.
    ///
    /// All three tables are written in one batch: a rejected review leaves the
    /// attributes untouched too.
    pub async fn merge_item(&self, item: &ExtractedItem) -> PipelineResult<()> {
        let item_id = item.attributes.item_id;
        let mut writes = vec![TableWrite::new(
            "perfumes_data",
            rows_of(std::slice::from_ref(&item.attributes))?,
        )];
        if !item.reviews.is_empty() {
            writes.push(TableWrite::new("reviews_data", rows_of(&item.reviews)?));
            writes.push(TableWrite::new("reviewers", rows_of(&item.reviewers)?));
        }
        self.storage.upsert_batch(writes).await?;

        if item.reviews.is_empty() {
            info!("No reviews in {}", item_id);
        } else {
            info!("{} reviews of {} added", item.reviews.len(), item_id);
        }
        Ok(())
    }

    /// Fetches and extracts one item page without writing anything.
    pub async fn fetch_item(&self, entry: &CatalogEntry) -> PipelineResult<ExtractedItem> {
        let page = self.fetcher.fetch(&entry.source_path).await?;
        self.extractor.extract(&page, entry.id)
    }

    /// Fetches up to `concurrency` pages at once and commits them in submission order.
    ///
    /// The first fetch or extraction failure stops the batch: items before it stay
    /// committed, nothing after it is written. Storage errors are returned as `Err`.
    pub async fn ingest_items(&self, entries: &[CatalogEntry]) -> PipelineResult<IngestReport> {
        self.ingest(entries, true).await
    }

    /// Like `ingest_items`, but a failed item is recorded and the rest are still committed.
    pub async fn ingest_each(&self, entries: &[CatalogEntry]) -> PipelineResult<IngestReport> {
        self.ingest(entries, false).await
    }

    async fn ingest(&self, entries: &[CatalogEntry], stop_at_failure: bool) -> PipelineResult<IngestReport> {
        info!("Updating perfumes_data, reviews_data, reviewers for {} item(s)", entries.len());
        let mut report = IngestReport::default();

        let mut pages = stream::iter(entries.iter())
            .map(|entry| async move { (entry, self.fetch_item(entry).await) })
            .buffered(self.concurrency);

        while let Some((entry, outcome)) = pages.next().await {
            match outcome {
                Ok(item) => {
                    self.merge_item(&item).await?;
                    info!("{} added to perfumes_data", entry.source_path);
                    report.committed.push(entry.id);
                }
                Err(e) => {
                    error!("❌ Can not parse {} ({}): {}", entry.display_name, entry.source_path, e);
                    report.failures.push(ItemFailure {
                        item_id: entry.id,
                        source_path: entry.source_path.clone(),
                        error: e,
                    });
                    if stop_at_failure {
                        info!("Stopping batch at {}", entry.source_path);
                        break;
                    }
                }
            }
        }

        if report.is_complete() && !report.committed.is_empty() {
            info!("Dataset has been updated");
        }
        Ok(report)
    }
}
