use std::sync::Arc;
use tracing::info;

use super::trainer::ScentEnsemble;
use crate::catalog::CatalogMerger;
use crate::error::{PipelineError, PipelineResult};
use crate::processor::FeatureAligner;
use crate::storage::artifact_store::load_current_artifact_set;
use crate::storage::table_store::{
    CATALOG_FULL, PREDICTION_SOURCE, VOTES_FULL, catalog_entry_at, rows_named,
};
use crate::storage::{ArtifactStore, Storage};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Assessment {
    PreviouslyVoted(bool),
    NotEnoughData,
    Like,
    Dislike,
    Undecided,
}

impl Assessment {
    /// 0 is dislike, 1 is like, the midpoint is a split ensemble.
    pub fn from_score(score: f64) -> Self {
        if score > 0.5 {
            Assessment::Like
        } else if score < 0.5 {
            Assessment::Dislike
        } else {
            Assessment::Undecided
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Assessment::PreviouslyVoted(true) => "You already voted: you like it",
            Assessment::PreviouslyVoted(false) => "You already voted: you don't like it",
            Assessment::NotEnoughData => "Not enough data to predict yet, vote for a few more perfumes",
            Assessment::Like => "You will probably like it",
            Assessment::Dislike => "You will probably not like it",
            Assessment::Undecided => "Can't tell, the models disagree",
        }
    }
}

pub struct PredictionService {
    storage: Arc<dyn Storage>,
    artifacts: Arc<dyn ArtifactStore>,
    aligner: Arc<FeatureAligner>,
    merger: Arc<CatalogMerger>,
}

impl PredictionService {
    pub fn new(
        storage: Arc<dyn Storage>,
        artifacts: Arc<dyn ArtifactStore>,
        aligner: Arc<FeatureAligner>,
        merger: Arc<CatalogMerger>,
    ) -> Self {
        PredictionService {
            storage,
            artifacts,
            aligner,
            merger,
        }
    }

    pub async fn assess(&self, full_name: &str) -> PipelineResult<Assessment> {
        info!("Getting prediction for {}", full_name);

        let voted = rows_named(self.storage.as_ref(), VOTES_FULL, full_name).await?;
        if voted.height() > 0 {
            let liked = voted
                .column("vote")?
                .bool()?
                .get(0)
                .ok_or_else(|| PipelineError::Schema(format!("vote is null for {}", full_name)))?;
            return Ok(Assessment::PreviouslyVoted(liked));
        }

        let set = match load_current_artifact_set(self.artifacts.as_ref()).await {
            Ok(set) => set,
            Err(e) if e.is_precursor_missing() => return Ok(Assessment::NotEnoughData),
            Err(e) => return Err(e),
        };

        let mut source = rows_named(self.storage.as_ref(), PREDICTION_SOURCE, full_name).await?;
        if source.height() == 0 {
            self.ingest_on_demand(full_name).await?;
            source = rows_named(self.storage.as_ref(), PREDICTION_SOURCE, full_name).await?;
        }

        let alignment = match self.aligner.align(&source, Some(&set.vocabulary)) {
            Ok(alignment) => alignment,
            Err(e) if e.is_precursor_missing() => return Ok(Assessment::NotEnoughData),
            Err(e) => return Err(e),
        };

        let ensemble = ScentEnsemble::from_bytes(&set.model)?;
        let scores = ensemble.predict(&alignment.matrix.rows())?;
        let score = scores
            .first()
            .copied()
            .ok_or_else(|| PipelineError::Schema(format!("no attributes for {}", full_name)))?;

        info!("Prediction for {}: {} (model version {})", full_name, score, set.version);
        Ok(Assessment::from_score(score))
    }

    /// Fetches attributes for a catalog item that has none yet.
    async fn ingest_on_demand(&self, full_name: &str) -> PipelineResult<()> {
        let found = rows_named(self.storage.as_ref(), CATALOG_FULL, full_name).await?;
        if found.height() == 0 {
            return Err(PipelineError::Schema(format!("No results found for {}", full_name)));
        }
        let entry = catalog_entry_at(&found, 0)?;

        let report = self.merger.ingest_items(std::slice::from_ref(&entry)).await?;
        match report.failures.into_iter().next() {
            Some(failure) => Err(failure.error),
            None => Ok(()),
        }
    }
}
