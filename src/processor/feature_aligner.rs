use ndarray::Array2;
use polars::prelude::*;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{FeatureVocabulary, ItemId};

/// Descriptive columns every input frame must carry.
pub const REQUIRED_COLUMNS: [&str; 5] = ["perfume_id", "perfumer", "brand_name", "notes", "accords"];
pub const LABEL_COLUMN: &str = "vote";

/// Rows grouped per item (and label when training), columns in vocabulary order.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub item_ids: Vec<ItemId>,
    pub labels: Option<Vec<bool>>,
    pub columns: Vec<String>,
    pub values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_columns(&self) -> usize {
        self.values.ncols()
    }

    pub fn rows(&self) -> Vec<Vec<f64>> {
        self.values.outer_iter().map(|row| row.to_vec()).collect()
    }

    /// Value at `row` for the named column, if that column exists.
    pub fn value(&self, row: usize, column: &str) -> Option<f64> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.values.get((row, index)).copied()
    }

    pub fn to_dataframe(&self) -> PipelineResult<DataFrame> {
        let mut series_vec: Vec<Column> = Vec::with_capacity(self.columns.len() + 2);
        series_vec.push(Series::new("perfume_id".into(), self.item_ids.clone()).into());
        if let Some(labels) = &self.labels {
            series_vec.push(Series::new(LABEL_COLUMN.into(), labels.clone()).into());
        }
        for (index, name) in self.columns.iter().enumerate() {
            let values: Vec<f64> = self.values.column(index).to_vec();
            series_vec.push(Series::new(name.as_str().into(), values).into());
        }
        Ok(DataFrame::new(series_vec)?)
    }
}

#[derive(Debug, Clone)]
pub struct Alignment {
    pub matrix: FeatureMatrix,
    /// Present only in training mode: the column set the matrix was built with.
    pub vocabulary: Option<FeatureVocabulary>,
}

/// Turns descriptive attributes into count-encoded tag columns.
///
/// The same tokenization runs at training and inference time; inference then
/// reindexes to the stored vocabulary so a model only ever sees the columns it
/// was fitted on, in the stored order.
pub struct FeatureAligner {
    separators: Regex,
}

type GroupKey = (ItemId, Option<bool>);

impl FeatureAligner {
    pub fn new() -> PipelineResult<Self> {
        let separators = Regex::new(r"[()\-]")
            .map_err(|e| PipelineError::Schema(format!("invalid token pattern: {}", e)))?;
        Ok(FeatureAligner { separators })
    }

    /// Lower-cased tags for one item: perfumer, brand, notes then accords.
    pub fn tokenize(&self, perfumer: &str, brand: &str, notes: &str, accords: &str) -> Vec<String> {
        let joined = format!("{},{},{},{}", perfumer, brand, notes, accords).to_lowercase();
        self.separators
            .replace_all(&joined, " ")
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Training mode when `vocabulary` is `None`, inference mode otherwise.
    pub fn align(
        &self,
        frame: &DataFrame,
        vocabulary: Option<&FeatureVocabulary>,
    ) -> PipelineResult<Alignment> {
        match vocabulary {
            None => self.align_training(frame),
            Some(vocabulary) if vocabulary.is_empty() => Err(PipelineError::PrecursorMissing(
                "feature vocabulary is empty, no trained model available yet".to_string(),
            )),
            Some(vocabulary) => self.align_inference(frame, vocabulary),
        }
    }

    fn align_training(&self, frame: &DataFrame) -> PipelineResult<Alignment> {
        info!("Preparing data for model training");
        let groups = self.count_tokens(frame, true)?;

        let universe: BTreeSet<&String> = groups.values().flat_map(|counts| counts.keys()).collect();
        let candidate_columns: Vec<String> = universe.into_iter().cloned().collect();
        let matrix = Self::build_matrix(&groups, &candidate_columns, true);

        let keep: Vec<usize> = (0..matrix.n_columns())
            .filter(|&index| matrix.values.column(index).iter().any(|v| *v != 0.0))
            .collect();
        let matrix = if keep.len() == matrix.n_columns() {
            matrix
        } else {
            let columns: Vec<String> = keep.iter().map(|&i| matrix.columns[i].clone()).collect();
            Self::build_matrix(&groups, &columns, true)
        };

        info!(
            "Training matrix ready: {} rows x {} feature columns",
            matrix.n_rows(),
            matrix.n_columns()
        );

        let vocabulary = FeatureVocabulary::new(matrix.columns.clone());
        Ok(Alignment {
            matrix,
            vocabulary: Some(vocabulary),
        })
    }

    fn align_inference(
        &self,
        frame: &DataFrame,
        vocabulary: &FeatureVocabulary,
    ) -> PipelineResult<Alignment> {
        info!("Preparing data for prediction");
        let groups = self.count_tokens(frame, false)?;
        let matrix = Self::build_matrix(&groups, vocabulary.columns(), false);
        info!("Data for prediction is ready ({} columns)", matrix.n_columns());

        Ok(Alignment {
            matrix,
            vocabulary: None,
        })
    }

    fn count_tokens(
        &self,
        frame: &DataFrame,
        with_labels: bool,
    ) -> PipelineResult<BTreeMap<GroupKey, BTreeMap<String, f64>>> {
        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|name| frame.column(name).is_err())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::Schema(format!(
                "input frame must contain {:?}, missing {:?}",
                REQUIRED_COLUMNS, missing
            )));
        }

        let ids = integer_column(frame, "perfume_id")?;
        let perfumers = text_column(frame, "perfumer")?;
        let brands = text_column(frame, "brand_name")?;
        let notes = text_column(frame, "notes")?;
        let accords = text_column(frame, "accords")?;
        let labels = if with_labels {
            let column = frame.column(LABEL_COLUMN).map_err(|_| {
                PipelineError::Schema(format!("training frame must contain '{}'", LABEL_COLUMN))
            })?;
            Some(
                column
                    .bool()
                    .map_err(|_| PipelineError::Schema(format!("'{}' must be boolean", LABEL_COLUMN)))?,
            )
        } else {
            None
        };

        let mut groups: BTreeMap<GroupKey, BTreeMap<String, f64>> = BTreeMap::new();
        for row in 0..frame.height() {
            let item_id = ids
                .get(row)
                .ok_or_else(|| PipelineError::Schema(format!("perfume_id is null in row {}", row)))?;
            let label = match labels {
                Some(labels) => Some(labels.get(row).ok_or_else(|| {
                    PipelineError::Schema(format!("{} is null in row {}", LABEL_COLUMN, row))
                })?),
                None => None,
            };

            let tokens = self.tokenize(
                perfumers.get(row).unwrap_or(""),
                brands.get(row).unwrap_or(""),
                notes.get(row).unwrap_or(""),
                accords.get(row).unwrap_or(""),
            );

            let counts = groups.entry((item_id, label)).or_default();
            for token in tokens {
                *counts.entry(token).or_insert(0.0) += 1.0;
            }
        }

        Ok(groups)
    }

    fn build_matrix(
        groups: &BTreeMap<GroupKey, BTreeMap<String, f64>>,
        columns: &[String],
        with_labels: bool,
    ) -> FeatureMatrix {
        let mut values = Array2::<f64>::zeros((groups.len(), columns.len()));
        let mut item_ids = Vec::with_capacity(groups.len());
        let mut labels = Vec::with_capacity(groups.len());

        for (row, ((item_id, label), counts)) in groups.iter().enumerate() {
            item_ids.push(*item_id);
            labels.push(label.unwrap_or(false));
            for (index, column) in columns.iter().enumerate() {
                if let Some(count) = counts.get(column) {
                    values[[row, index]] = *count;
                }
            }
        }

        FeatureMatrix {
            item_ids,
            labels: with_labels.then_some(labels),
            columns: columns.to_vec(),
            values,
        }
    }
}

fn integer_column<'a>(frame: &'a DataFrame, name: &str) -> PipelineResult<&'a Int64Chunked> {
    frame
        .column(name)
        .map_err(|_| PipelineError::Schema(format!("missing column '{}'", name)))?
        .i64()
        .map_err(|_| PipelineError::Schema(format!("column '{}' must be a 64-bit integer", name)))
}

fn text_column<'a>(frame: &'a DataFrame, name: &str) -> PipelineResult<&'a StringChunked> {
    frame
        .column(name)
        .map_err(|_| PipelineError::Schema(format!("missing column '{}'", name)))?
        .str()
        .map_err(|_| PipelineError::Schema(format!("column '{}' must be text", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(rows: &[(i64, &str, &str, &str, &str)], votes: Option<Vec<bool>>) -> DataFrame {
        let mut columns: Vec<Column> = vec![
            Series::new("perfume_id".into(), rows.iter().map(|r| r.0).collect::<Vec<_>>()).into(),
            Series::new("perfumer".into(), rows.iter().map(|r| r.1).collect::<Vec<_>>()).into(),
            Series::new("brand_name".into(), rows.iter().map(|r| r.2).collect::<Vec<_>>()).into(),
            Series::new("notes".into(), rows.iter().map(|r| r.3).collect::<Vec<_>>()).into(),
            Series::new("accords".into(), rows.iter().map(|r| r.4).collect::<Vec<_>>()).into(),
        ];
        if let Some(votes) = votes {
            columns.push(Series::new("vote".into(), votes).into());
        }
        DataFrame::new(columns).unwrap()
    }

    #[test]
    fn test_tokenize_normalizes_punctuation_and_case() {
        let aligner = FeatureAligner::new().unwrap();
        let tokens = aligner.tokenize("Jean-Claude Ellena", "Hermès", "Rose (Damask),Oud", "Woody");
        assert_eq!(tokens, vec!["jean claude ellena", "hermès", "rose  damask", "oud", "woody"]);
    }

    #[test]
    fn test_training_builds_sorted_vocabulary() {
        let aligner = FeatureAligner::new().unwrap();
        let df = frame(
            &[
                (1, "unknown", "Dior", "rose,pepper", "woody"),
                (2, "A. Morillas", "Chanel", "rose", "citrus,woody"),
            ],
            Some(vec![true, false]),
        );

        let alignment = aligner.align(&df, None).unwrap();
        let vocabulary = alignment.vocabulary.unwrap();
        assert_eq!(
            vocabulary.columns(),
            &["a. morillas", "chanel", "citrus", "dior", "pepper", "rose", "unknown", "woody"]
        );

        let matrix = alignment.matrix;
        assert_eq!(matrix.item_ids, vec![1, 2]);
        assert_eq!(matrix.labels, Some(vec![true, false]));
        assert_eq!(matrix.value(0, "rose"), Some(1.0));
        assert_eq!(matrix.value(0, "chanel"), Some(0.0));
        assert_eq!(matrix.value(1, "citrus"), Some(1.0));
    }

    #[test]
    fn test_duplicate_rows_are_summed_per_item() {
        let aligner = FeatureAligner::new().unwrap();
        let df = frame(
            &[
                (5, "unknown", "Dior", "rose,rose", "woody"),
                (5, "unknown", "Dior", "rose", "woody"),
            ],
            Some(vec![true, true]),
        );

        let matrix = aligner.align(&df, None).unwrap().matrix;
        assert_eq!(matrix.n_rows(), 1);
        assert_eq!(matrix.value(0, "rose"), Some(3.0));
        assert_eq!(matrix.value(0, "dior"), Some(2.0));
    }

    #[test]
    fn test_inference_reindexes_to_vocabulary() {
        let aligner = FeatureAligner::new().unwrap();
        let vocabulary = FeatureVocabulary::new(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        // produces tokens {b, d} only
        let df = frame(&[(9, "b", "d", "", "")], None);

        let alignment = aligner.align(&df, Some(&vocabulary)).unwrap();
        assert!(alignment.vocabulary.is_none());

        let matrix = alignment.matrix;
        assert_eq!(matrix.columns, vec!["a", "b", "c"]);
        assert_eq!(matrix.rows(), vec![vec![0.0, 1.0, 0.0]]);
        assert_eq!(matrix.labels, None);
    }

    #[test]
    fn test_inference_keeps_stored_order() {
        let aligner = FeatureAligner::new().unwrap();
        let vocabulary = FeatureVocabulary::new(vec!["woody".to_string(), "dior".to_string()]);
        let df = frame(&[(3, "unknown", "Dior", "rose", "woody")], None);

        let matrix = aligner.align(&df, Some(&vocabulary)).unwrap().matrix;
        assert_eq!(matrix.columns, vec!["woody", "dior"]);
        assert_eq!(matrix.rows(), vec![vec![1.0, 1.0]]);
    }

    #[test]
    fn test_empty_vocabulary_is_precursor_missing() {
        let aligner = FeatureAligner::new().unwrap();
        let df = frame(&[(3, "unknown", "Dior", "rose", "woody")], None);
        let result = aligner.align(&df, Some(&FeatureVocabulary::default()));
        assert!(matches!(result, Err(PipelineError::PrecursorMissing(_))));
    }

    #[test]
    fn test_missing_columns_are_schema_errors() {
        let aligner = FeatureAligner::new().unwrap();
        let df = DataFrame::new(vec![
            Series::new("perfume_id".into(), vec![1i64]).into(),
            Series::new("notes".into(), vec!["rose"]).into(),
        ])
        .unwrap();
        assert!(matches!(aligner.align(&df, None), Err(PipelineError::Schema(_))));

        let unlabeled = frame(&[(3, "unknown", "Dior", "rose", "woody")], None);
        assert!(matches!(aligner.align(&unlabeled, None), Err(PipelineError::Schema(_))));
    }

    #[test]
    fn test_matrix_to_dataframe() {
        let aligner = FeatureAligner::new().unwrap();
        let df = frame(&[(1, "unknown", "Dior", "rose", "woody")], Some(vec![true]));
        let out = aligner.align(&df, None).unwrap().matrix.to_dataframe().unwrap();
        assert_eq!(out.width(), 2 + 4);
        assert_eq!(out.height(), 1);
    }
}
