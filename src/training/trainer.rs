use serde::{Deserialize, Serialize};
use smartcore::ensemble::random_forest_classifier::{
    RandomForestClassifier, RandomForestClassifierParameters,
};
use smartcore::linalg::basic::matrix::DenseMatrix;
use std::sync::Arc;
use tracing::info;

use crate::config::TrainingConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::processor::FeatureAligner;
use crate::storage::artifact_store::publish_artifact_set;
use crate::storage::table_store::TRAINING_DATASET;
use crate::storage::{ArtifactStore, Storage};

type Forest = RandomForestClassifier<f64, i32, DenseMatrix<f64>, Vec<i32>>;

/// The best forests of one grid search. Prediction is their mean vote.
#[derive(Serialize, Deserialize)]
pub struct ScentEnsemble {
    depths: Vec<u16>,
    forests: Vec<Forest>,
}

impl ScentEnsemble {
    pub fn depths(&self) -> &[u16] {
        &self.depths
    }

    /// Mean of the members' 0/1 predictions for each row.
    pub fn predict(&self, rows: &[Vec<f64>]) -> PipelineResult<Vec<f64>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let matrix = DenseMatrix::from_2d_vec(&rows.to_vec());
        let mut sums = vec![0.0; rows.len()];

        for forest in &self.forests {
            let predictions = forest
                .predict(&matrix)
                .map_err(|e| PipelineError::Training(format!("prediction failed: {}", e)))?;
            for (sum, prediction) in sums.iter_mut().zip(predictions) {
                *sum += prediction as f64;
            }
        }

        let members = self.forests.len().max(1) as f64;
        Ok(sums.into_iter().map(|sum| sum / members).collect())
    }

    pub fn to_bytes(&self) -> PipelineResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> PipelineResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub version: u64,
    pub rows: usize,
    pub columns: usize,
    /// Hold-out accuracy per grid depth, in grid order.
    pub scores: Vec<(u16, f64)>,
    pub kept_depths: Vec<u16>,
}

const ENSEMBLE_SIZE: usize = 2;

pub struct Trainer {
    aligner: Arc<FeatureAligner>,
    config: TrainingConfig,
}

impl Trainer {
    pub fn new(aligner: Arc<FeatureAligner>, config: TrainingConfig) -> Self {
        Trainer { aligner, config }
    }

    /// Reads every voted item, fits the ensemble and publishes it with its vocabulary.
    pub async fn train(
        &self,
        storage: &dyn Storage,
        artifacts: &dyn ArtifactStore,
    ) -> PipelineResult<TrainingOutcome> {
        let dataset = storage.query(TRAINING_DATASET).await?;
        if dataset.height() == 0 {
            return Err(PipelineError::PrecursorMissing("no voted items with attributes".to_string()));
        }

        let alignment = self.aligner.align(&dataset, None)?;
        let vocabulary = alignment
            .vocabulary
            .ok_or_else(|| PipelineError::Training("training alignment produced no vocabulary".to_string()))?;
        let matrix = alignment.matrix;
        let labels: Vec<i32> = matrix
            .labels
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|liked| i32::from(*liked))
            .collect();

        if !labels.contains(&0) || !labels.contains(&1) {
            return Err(PipelineError::PrecursorMissing(
                "both liked and disliked items are needed to train".to_string(),
            ));
        }

        let rows = matrix.rows();
        let (n_rows, n_columns) = (matrix.n_rows(), matrix.n_columns());
        let config = self.config.clone();
        info!("RF model training started on {} rows x {} columns", n_rows, n_columns);

        let (ensemble, scores) = tokio::task::spawn_blocking(move || fit_ensemble(&rows, &labels, &config))
            .await
            .map_err(|e| PipelineError::Training(format!("training task failed: {}", e)))??;

        let kept_depths = ensemble.depths().to_vec();
        let version = publish_artifact_set(artifacts, ensemble.to_bytes()?, &vocabulary).await?;
        info!("✅ RF ensemble (depths {:?}) saved as version {}", kept_depths, version);

        Ok(TrainingOutcome {
            version,
            rows: n_rows,
            columns: n_columns,
            scores,
            kept_depths,
        })
    }
}

/// Hold-out split: every `every`-th row is scored, the rest are fitted.
fn split(n_rows: usize, every: usize) -> (Vec<usize>, Vec<usize>) {
    if every < 2 {
        return ((0..n_rows).collect(), Vec::new());
    }
    (0..n_rows).partition(|i| i % every != every - 1)
}

fn pick(rows: &[Vec<f64>], labels: &[i32], indices: &[usize]) -> (Vec<Vec<f64>>, Vec<i32>) {
    indices
        .iter()
        .map(|&i| (rows[i].clone(), labels[i]))
        .unzip()
}

fn fit_forest(rows: &[Vec<f64>], labels: &[i32], depth: u16, n_trees: u16) -> PipelineResult<Forest> {
    let params = RandomForestClassifierParameters::default()
        .with_n_trees(n_trees)
        .with_max_depth(depth);
    let matrix = DenseMatrix::from_2d_vec(&rows.to_vec());
    RandomForestClassifier::fit(&matrix, &labels.to_vec(), params)
        .map_err(|e| PipelineError::Training(format!("fit with max_depth {} failed: {}", depth, e)))
}

fn accuracy(forest: &Forest, rows: &[Vec<f64>], labels: &[i32]) -> PipelineResult<f64> {
    let predictions = forest
        .predict(&DenseMatrix::from_2d_vec(&rows.to_vec()))
        .map_err(|e| PipelineError::Training(format!("scoring failed: {}", e)))?;
    let hits = predictions.iter().zip(labels).filter(|(p, l)| p == l).count();
    Ok(hits as f64 / labels.len() as f64)
}

/// Scores each grid depth, then refits the best two on every row.
pub fn fit_ensemble(
    rows: &[Vec<f64>],
    labels: &[i32],
    config: &TrainingConfig,
) -> PipelineResult<(ScentEnsemble, Vec<(u16, f64)>)> {
    let (train_idx, holdout_idx) = split(rows.len(), config.holdout_every);
    let (train_rows, train_labels) = pick(rows, labels, &train_idx);
    let (score_rows, score_labels) = if holdout_idx.is_empty() {
        (train_rows.clone(), train_labels.clone())
    } else {
        pick(rows, labels, &holdout_idx)
    };

    let mut scores = Vec::with_capacity(config.depth_grid.len());
    for &depth in &config.depth_grid {
        let forest = fit_forest(&train_rows, &train_labels, depth, config.n_trees)?;
        let score = accuracy(&forest, &score_rows, &score_labels)?;
        info!("max_depth {} scored {:.3}", depth, score);
        scores.push((depth, score));
    }

    let mut ranked = scores.clone();
    // stable sort keeps grid order among ties
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    let depths: Vec<u16> = ranked.iter().take(ENSEMBLE_SIZE).map(|(depth, _)| *depth).collect();
    info!("Best RandomForest depths: {:?}", depths);

    let forests = depths
        .iter()
        .map(|&depth| fit_forest(rows, labels, depth, config.n_trees))
        .collect::<PipelineResult<Vec<_>>>()?;

    Ok((ScentEnsemble { depths, forests }, scores))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::artifact_store::load_current_artifact_set;
    use crate::storage::{MemoryArtifactStore, MemoryTableStore, rows_of};
    use crate::models::{AttributeRecord, Brand, CatalogEntry, VoteRecord};

    fn small_config() -> TrainingConfig {
        TrainingConfig {
            depth_grid: vec![2, 3, 4],
            n_trees: 15,
            holdout_every: 3,
        }
    }

    /// Liked items share every token of one profile, disliked items the other.
    async fn seeded_store(items: i64, liked_only: bool) -> MemoryTableStore {
        let store = MemoryTableStore::new();
        let brands = vec![
            Brand { id: "Acme".into(), name: "Acme".into(), source_path: "/designers/Acme.html".into() },
            Brand { id: "Zeta".into(), name: "Zeta".into(), source_path: "/designers/Zeta.html".into() },
        ];
        store.upsert("brands", rows_of(&brands).unwrap()).await.unwrap();

        let mut entries = Vec::new();
        let mut attributes = Vec::new();
        let mut votes = Vec::new();
        for id in 1..=items {
            let liked = liked_only || id % 2 == 0;
            let brand = if liked { "Acme" } else { "Zeta" };
            entries.push(CatalogEntry {
                id,
                nickname: format!("Item-{}", id),
                display_name: format!("Item {}", id),
                source_path: format!("/perfume/{}/Item-{}.html", brand, id),
                brand_id: brand.to_string(),
            });
            attributes.push(AttributeRecord {
                item_id: id,
                perfumer: if liked { "nose a" } else { "nose b" }.to_string(),
                accords: if liked { "fresh" } else { "smoky" }.to_string(),
                notes: if liked { "rose,bergamot" } else { "oud,tar" }.to_string(),
                rating: 4.0,
                vote_count: 100,
            });
            votes.push(VoteRecord { item_id: id, liked });
        }
        store.upsert("perfumes_catalog", rows_of(&entries).unwrap()).await.unwrap();
        store.upsert("perfumes_data", rows_of(&attributes).unwrap()).await.unwrap();
        store.upsert("my_votes", rows_of(&votes).unwrap()).await.unwrap();
        store
    }

    #[test]
    fn test_split_holds_out_every_nth_row() {
        let (train, holdout) = split(7, 3);
        assert_eq!(holdout, vec![2, 5]);
        assert_eq!(train, vec![0, 1, 3, 4, 6]);

        let (train, holdout) = split(4, 1);
        assert_eq!(train.len(), 4);
        assert!(holdout.is_empty());
    }

    #[tokio::test]
    async fn test_train_publishes_model_and_vocabulary_together() {
        let storage = seeded_store(12, false).await;
        let artifacts = MemoryArtifactStore::new();
        let trainer = Trainer::new(Arc::new(FeatureAligner::new().unwrap()), small_config());

        let outcome = trainer.train(&storage, &artifacts).await.unwrap();
        assert_eq!(outcome.version, 1);
        assert_eq!(outcome.rows, 12);
        assert_eq!(outcome.scores.len(), 3);
        assert_eq!(outcome.kept_depths.len(), 2);

        let set = load_current_artifact_set(&artifacts).await.unwrap();
        assert_eq!(set.version, 1);
        assert_eq!(set.vocabulary.len(), outcome.columns);
        assert!(set.vocabulary.columns().contains(&"rose".to_string()));

        let ensemble = ScentEnsemble::from_bytes(&set.model).unwrap();
        assert_eq!(ensemble.depths(), outcome.kept_depths.as_slice());
    }

    #[tokio::test]
    async fn test_ensemble_separates_clean_profiles() {
        let storage = seeded_store(12, false).await;
        let aligner = FeatureAligner::new().unwrap();
        let dataset = storage.query(TRAINING_DATASET).await.unwrap();
        let matrix = aligner.align(&dataset, None).unwrap().matrix;
        let labels: Vec<i32> = matrix.labels.clone().unwrap().into_iter().map(i32::from).collect();

        let (ensemble, _) = fit_ensemble(&matrix.rows(), &labels, &small_config()).unwrap();
        let predictions = ensemble.predict(&matrix.rows()).unwrap();
        for (prediction, label) in predictions.iter().zip(&labels) {
            assert_eq!(*prediction, *label as f64);
        }
    }

    #[tokio::test]
    async fn test_single_class_is_precursor_missing() {
        let storage = seeded_store(6, true).await;
        let trainer = Trainer::new(Arc::new(FeatureAligner::new().unwrap()), small_config());
        let result = trainer.train(&storage, &MemoryArtifactStore::new()).await;
        assert!(result.unwrap_err().is_precursor_missing());
    }

    #[tokio::test]
    async fn test_empty_dataset_is_precursor_missing() {
        let trainer = Trainer::new(Arc::new(FeatureAligner::new().unwrap()), small_config());
        let result = trainer
            .train(&MemoryTableStore::new(), &MemoryArtifactStore::new())
            .await;
        assert!(result.unwrap_err().is_precursor_missing());
    }
}
