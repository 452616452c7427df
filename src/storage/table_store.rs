use async_trait::async_trait;
use polars::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use super::artifact_store::{ArtifactStore, StoreLease};
use crate::error::{PipelineError, PipelineResult};
use crate::models::CatalogEntry;

/// One storage row, keyed by column name.
pub type Row = Map<String, Value>;

/// Artifact name the serialized table state is kept under between runs.
pub const TABLES_ARTIFACT: &str = "scent_tables";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Float,
    Text,
    Bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnType,
    pub nullable: bool,
}

const fn column(name: &'static str, kind: ColumnType) -> ColumnSpec {
    ColumnSpec { name, kind, nullable: false }
}

const fn nullable(name: &'static str, kind: ColumnType) -> ColumnSpec {
    ColumnSpec { name, kind, nullable: true }
}

/// What happens when an incoming row's key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Keep the first-written row.
    InsertIgnore { key: &'static str },
    /// Replace the listed fields of the stored row.
    UpsertOverwrite {
        key: &'static str,
        fields: &'static [&'static str],
    },
}

impl ConflictPolicy {
    pub fn key(&self) -> &'static str {
        match self {
            ConflictPolicy::InsertIgnore { key } => key,
            ConflictPolicy::UpsertOverwrite { key, .. } => key,
        }
    }
}

#[derive(Debug)]
pub struct TableDescriptor {
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
    pub policy: ConflictPolicy,
}

use ColumnType::{Bool, Float, Int, Text};

pub const PERFUMES_CATALOG: TableDescriptor = TableDescriptor {
    name: "perfumes_catalog",
    columns: &[
        column("perfume_id", Int),
        column("perfume_nickname", Text),
        column("perfume_name", Text),
        column("perfume_url", Text),
        column("brand_id", Text),
    ],
    policy: ConflictPolicy::InsertIgnore { key: "perfume_id" },
};

pub const PERFUMES_DATA: TableDescriptor = TableDescriptor {
    name: "perfumes_data",
    columns: &[
        column("perfume_id", Int),
        column("perfumer", Text),
        column("accords", Text),
        column("notes", Text),
        column("rating", Float),
        column("votes_number", Int),
    ],
    policy: ConflictPolicy::UpsertOverwrite {
        key: "perfume_id",
        fields: &["perfumer", "accords", "notes", "rating", "votes_number"],
    },
};

pub const BRANDS: TableDescriptor = TableDescriptor {
    name: "brands",
    columns: &[
        column("brand_id", Text),
        column("brand_name", Text),
        column("brand_url", Text),
    ],
    policy: ConflictPolicy::InsertIgnore { key: "brand_id" },
};

pub const REVIEWS_DATA: TableDescriptor = TableDescriptor {
    name: "reviews_data",
    columns: &[
        column("review_id", Text),
        column("perfume_id", Int),
        column("reviewer_id", Text),
        column("review", Text),
        nullable("tone", Bool),
    ],
    policy: ConflictPolicy::InsertIgnore { key: "review_id" },
};

pub const REVIEWERS: TableDescriptor = TableDescriptor {
    name: "reviewers",
    columns: &[column("reviewer_id", Text), column("reviewer_name", Text)],
    policy: ConflictPolicy::InsertIgnore { key: "reviewer_id" },
};

pub const MY_VOTES: TableDescriptor = TableDescriptor {
    name: "my_votes",
    columns: &[column("perfume_id", Int), column("vote", Bool)],
    policy: ConflictPolicy::UpsertOverwrite {
        key: "perfume_id",
        fields: &["vote"],
    },
};

pub const TABLES: [&TableDescriptor; 6] = [
    &PERFUMES_CATALOG,
    &PERFUMES_DATA,
    &BRANDS,
    &REVIEWS_DATA,
    &REVIEWERS,
    &MY_VOTES,
];

pub const CATALOG_FULL: &str = "catalog_full";
pub const VOTES_FULL: &str = "votes_full";
pub const TRAINING_DATASET: &str = "training_dataset";
pub const PREDICTION_SOURCE: &str = "prediction_source";

const CATALOG_FULL_COLUMNS: &[ColumnSpec] = &[
    column("perfume_id", Int),
    column("perfume_nickname", Text),
    column("perfume_name", Text),
    column("perfume_url", Text),
    column("brand_id", Text),
    nullable("brand_name", Text),
    column("full_name", Text),
];

const VOTES_FULL_COLUMNS: &[ColumnSpec] = &[
    column("perfume_id", Int),
    column("perfume_nickname", Text),
    column("perfume_name", Text),
    column("perfume_url", Text),
    column("brand_id", Text),
    column("vote", Bool),
    column("full_name", Text),
];

const TRAINING_DATASET_COLUMNS: &[ColumnSpec] = &[
    column("perfume_id", Int),
    column("perfume_name", Text),
    column("perfumer", Text),
    column("accords", Text),
    column("notes", Text),
    column("rating", Float),
    column("votes_number", Int),
    column("brand_name", Text),
    column("vote", Bool),
];

const PREDICTION_SOURCE_COLUMNS: &[ColumnSpec] = &[
    column("perfume_id", Int),
    column("perfume_name", Text),
    column("perfumer", Text),
    column("accords", Text),
    column("notes", Text),
    column("rating", Float),
    column("votes_number", Int),
    column("brand_name", Text),
    column("full_name", Text),
];

pub fn descriptor(table: &str) -> PipelineResult<&'static TableDescriptor> {
    TABLES
        .iter()
        .copied()
        .find(|descriptor| descriptor.name == table)
        .ok_or_else(|| PipelineError::Schema(format!("unknown table '{}'", table)))
}

/// Rows for any record type whose serde field names match a table's columns.
pub fn rows_of<T: Serialize>(records: &[T]) -> PipelineResult<Vec<Row>> {
    records
        .iter()
        .map(|record| match serde_json::to_value(record)? {
            Value::Object(row) => Ok(row),
            other => Err(PipelineError::Schema(format!("record is not a row: {}", other))),
        })
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub ignored: usize,
}

/// Rows bound for one table inside a multi-table batch.
#[derive(Debug, Clone)]
pub struct TableWrite {
    pub table: String,
    pub rows: Vec<Row>,
}

impl TableWrite {
    pub fn new(table: &str, rows: Vec<Row>) -> Self {
        TableWrite {
            table: table.to_string(),
            rows,
        }
    }
}

/// The persistent tables behind the pipeline.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Applies `rows` under the table's conflict policy. The batch is all-or-nothing.
    async fn upsert(&self, table: &str, rows: Vec<Row>) -> PipelineResult<UpsertSummary> {
        let mut summaries = self.upsert_batch(vec![TableWrite::new(table, rows)]).await?;
        summaries
            .pop()
            .ok_or_else(|| PipelineError::Schema(format!("no summary for {}", table)))
    }

    /// Applies writes to several tables as one unit. Every write is checked
    /// before any is applied; summaries come back in input order.
    async fn upsert_batch(&self, writes: Vec<TableWrite>) -> PipelineResult<Vec<UpsertSummary>>;

    /// A table or one of the derived views.
    async fn query(&self, name: &str) -> PipelineResult<DataFrame>;
}

#[derive(Debug, Default)]
struct TableData {
    rows: Vec<Row>,
    index: HashMap<String, usize>,
}

impl TableData {
    fn get(&self, key: &str) -> Option<&Row> {
        self.index.get(key).map(|&position| &self.rows[position])
    }
}

/// Table store held in memory, one lock per table.
///
/// Writers to different tables never contend; writers to the same table are
/// serialized, which keeps insert-or-ignore and overwrite semantics exact
/// under concurrent ingestion. Multi-table batches take their locks in
/// `TABLES` order.
///
/// A store built by `open` holds the storage lease and saves the full state
/// after every applied batch.
pub struct MemoryTableStore {
    tables: HashMap<&'static str, RwLock<TableData>>,
    backing: Option<Backing>,
}

struct Backing {
    artifacts: Arc<dyn ArtifactStore>,
    lease: StoreLease,
    /// Saves run one at a time so the last write always carries the newest state.
    saving: Mutex<()>,
}

impl Default for MemoryTableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTableStore {
    pub fn new() -> Self {
        let tables = TABLES
            .iter()
            .map(|descriptor| (descriptor.name, RwLock::new(TableData::default())))
            .collect();
        MemoryTableStore { tables, backing: None }
    }

    /// Takes the storage lease, then restores the saved state or starts empty.
    ///
    /// Fails with `Conflict` while another process holds the lease.
    pub async fn open(artifacts: Arc<dyn ArtifactStore>) -> PipelineResult<Self> {
        let lease = StoreLease::acquire(artifacts.as_ref()).await?;
        let mut store = Self::new();
        if let Err(e) = store.restore(artifacts.as_ref()).await {
            error!("❌ Failed to restore storage state: {}", e);
            lease.release(artifacts.as_ref()).await?;
            return Err(e);
        }

        store.backing = Some(Backing {
            artifacts,
            lease,
            saving: Mutex::new(()),
        });
        Ok(store)
    }

    /// Saves the state a final time and gives up the lease.
    pub async fn close(&self) -> PipelineResult<()> {
        let Some(backing) = &self.backing else {
            return Ok(());
        };
        self.save().await?;
        backing.lease.release(backing.artifacts.as_ref()).await?;
        info!("💾 Storage closed");
        Ok(())
    }

    async fn restore(&self, artifacts: &dyn ArtifactStore) -> PipelineResult<()> {
        match artifacts.get_model(TABLES_ARTIFACT).await {
            Ok(bytes) => {
                let state: HashMap<String, Vec<Row>> = serde_json::from_slice(&bytes)?;
                self.import_state(state).await?;
                info!("📂 Storage opened from saved state");
                Ok(())
            }
            Err(e) if e.is_precursor_missing() => {
                info!("📂 No saved storage state, starting empty");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Writes the full table state to the artifact store, renewing the lease first.
    async fn save(&self) -> PipelineResult<()> {
        let Some(backing) = &self.backing else {
            return Ok(());
        };
        let _saving = backing.saving.lock().await;
        backing.lease.renew(backing.artifacts.as_ref()).await?;

        let state = self.export_state().await;
        let bytes = serde_json::to_vec(&state)?;
        backing.artifacts.put_model(TABLES_ARTIFACT, bytes).await?;
        debug!("Storage state saved ({} tables)", state.len());
        Ok(())
    }

    pub async fn export_state(&self) -> HashMap<String, Vec<Row>> {
        let mut state = HashMap::new();
        for descriptor in TABLES {
            let rows = self.read_rows(descriptor).await;
            state.insert(descriptor.name.to_string(), rows);
        }
        state
    }

    pub async fn import_state(&self, state: HashMap<String, Vec<Row>>) -> PipelineResult<()> {
        for (table, rows) in state {
            let summary = self.upsert(&table, rows).await?;
            info!("Restored {} rows into {}", summary.inserted, table);
        }
        Ok(())
    }

    /// Parquet bytes for a table or view.
    pub async fn to_parquet(&self, name: &str) -> PipelineResult<Vec<u8>> {
        let mut df = self.query(name).await?;
        let mut buf = Vec::new();
        {
            let writer = ParquetWriter::new(&mut buf);
            writer.finish(&mut df)?;
        }
        Ok(buf)
    }

    pub async fn row_count(&self, table: &str) -> PipelineResult<usize> {
        let descriptor = descriptor(table)?;
        let data = self.table(descriptor)?.read().await;
        Ok(data.rows.len())
    }

    fn table(&self, descriptor: &TableDescriptor) -> PipelineResult<&RwLock<TableData>> {
        self.tables
            .get(descriptor.name)
            .ok_or_else(|| PipelineError::Schema(format!("table '{}' is not created", descriptor.name)))
    }

    async fn read_rows(&self, descriptor: &TableDescriptor) -> Vec<Row> {
        match self.tables.get(descriptor.name) {
            Some(lock) => lock.read().await.rows.clone(),
            None => Vec::new(),
        }
    }

    fn catalog_full(catalog: &[Row], brands: &TableData) -> Vec<Row> {
        let mut rows: Vec<Row> = catalog
            .iter()
            .map(|entry| {
                let brand_name = brand_name_for(entry, brands);
                let mut row = entry.clone();
                row.insert("full_name".to_string(), Value::String(full_name(entry, brand_name.as_deref())));
                row.insert(
                    "brand_name".to_string(),
                    brand_name.map(Value::String).unwrap_or(Value::Null),
                );
                row
            })
            .collect();

        rows.sort_by(|a, b| {
            compare_text(a.get("brand_name"), b.get("brand_name"))
                .then_with(|| compare_text(a.get("perfume_name"), b.get("perfume_name")))
        });
        rows
    }

    fn votes_full(catalog: &[Row], brands: &TableData, votes: &TableData) -> Vec<Row> {
        catalog
            .iter()
            .filter_map(|entry| {
                let vote = votes.get(&key_of(entry.get("perfume_id")?)?)?.get("vote")?.clone();
                let brand_name = brand_name_for(entry, brands)?;
                let mut row = entry.clone();
                row.insert("vote".to_string(), vote);
                row.insert("full_name".to_string(), Value::String(full_name(entry, Some(&brand_name))));
                Some(row)
            })
            .collect()
    }

    /// Attribute rows joined to catalog and brand, optionally restricted to voted items.
    fn attribute_join(
        attributes: &[Row],
        catalog: &TableData,
        brands: &TableData,
        votes: Option<&TableData>,
    ) -> Vec<Row> {
        attributes
            .iter()
            .filter_map(|record| {
                let key = key_of(record.get("perfume_id")?)?;
                let entry = catalog.get(&key)?;
                let brand_name = brand_name_for(entry, brands)?;

                let mut row = record.clone();
                row.insert("perfume_name".to_string(), entry.get("perfume_name")?.clone());
                row.insert("brand_name".to_string(), Value::String(brand_name.clone()));
                match votes {
                    Some(votes) => {
                        let vote = votes.get(&key)?.get("vote")?.clone();
                        row.insert("vote".to_string(), vote);
                    }
                    None => {
                        row.insert("full_name".to_string(), Value::String(full_name(entry, Some(&brand_name))));
                    }
                }
                Some(row)
            })
            .collect()
    }

    async fn view(&self, name: &str) -> PipelineResult<DataFrame> {
        let catalog = self.table(&PERFUMES_CATALOG)?.read().await;
        let brands = self.table(&BRANDS)?.read().await;

        match name {
            CATALOG_FULL => frame_of(CATALOG_FULL_COLUMNS, &Self::catalog_full(&catalog.rows, &brands)),
            VOTES_FULL => {
                let votes = self.table(&MY_VOTES)?.read().await;
                frame_of(VOTES_FULL_COLUMNS, &Self::votes_full(&catalog.rows, &brands, &votes))
            }
            TRAINING_DATASET => {
                let attributes = self.table(&PERFUMES_DATA)?.read().await;
                let votes = self.table(&MY_VOTES)?.read().await;
                let rows = Self::attribute_join(&attributes.rows, &catalog, &brands, Some(&*votes));
                frame_of(TRAINING_DATASET_COLUMNS, &rows)
            }
            PREDICTION_SOURCE => {
                let attributes = self.table(&PERFUMES_DATA)?.read().await;
                let rows = Self::attribute_join(&attributes.rows, &catalog, &brands, None);
                frame_of(PREDICTION_SOURCE_COLUMNS, &rows)
            }
            other => Err(PipelineError::Schema(format!("unknown table or view '{}'", other))),
        }
    }
}

#[async_trait]
impl Storage for MemoryTableStore {
    async fn upsert_batch(&self, writes: Vec<TableWrite>) -> PipelineResult<Vec<UpsertSummary>> {
        let mut prepared = Vec::with_capacity(writes.len());
        for write in writes {
            let descriptor = descriptor(&write.table)?;
            prepared.push((descriptor, prepare(descriptor, write.rows)?));
        }

        let summaries = {
            let mut locked = HashMap::new();
            for descriptor in TABLES {
                if prepared.iter().any(|(target, _)| target.name == descriptor.name) {
                    locked.insert(descriptor.name, self.table(descriptor)?.write().await);
                }
            }

            let mut summaries = Vec::with_capacity(prepared.len());
            for (descriptor, batch) in prepared {
                let data = locked.get_mut(descriptor.name).ok_or_else(|| {
                    PipelineError::Schema(format!("table '{}' is not locked", descriptor.name))
                })?;
                let summary = apply(descriptor, data, batch);
                info!(
                    "New data inserted into {}: {} new, {} updated, {} ignored",
                    descriptor.name, summary.inserted, summary.updated, summary.ignored
                );
                summaries.push(summary);
            }
            summaries
        };

        self.save().await?;
        Ok(summaries)
    }

    async fn query(&self, name: &str) -> PipelineResult<DataFrame> {
        match descriptor(name) {
            Ok(descriptor) => {
                let rows = self.table(descriptor)?.read().await;
                frame_of(descriptor.columns, &rows.rows)
            }
            Err(_) => self.view(name).await,
        }
    }
}

/// Rows of a view whose `full_name` equals `full_name`.
pub async fn rows_named(storage: &dyn Storage, view: &str, full_name: &str) -> PipelineResult<DataFrame> {
    let df = storage.query(view).await?;
    Ok(df.lazy().filter(col("full_name").eq(lit(full_name))).collect()?)
}

/// The catalog entry held in `row` of a `perfumes_catalog`-shaped frame.
pub fn catalog_entry_at(df: &DataFrame, row: usize) -> PipelineResult<CatalogEntry> {
    let text = |name: &str| -> PipelineResult<String> {
        df.column(name)?
            .str()?
            .get(row)
            .map(str::to_string)
            .ok_or_else(|| PipelineError::Schema(format!("{} is null in row {}", name, row)))
    };
    let id = df
        .column("perfume_id")?
        .i64()?
        .get(row)
        .ok_or_else(|| PipelineError::Schema(format!("perfume_id is null in row {}", row)))?;

    Ok(CatalogEntry {
        id,
        nickname: text("perfume_nickname")?,
        display_name: text("perfume_name")?,
        source_path: text("perfume_url")?,
        brand_id: text("brand_id")?,
    })
}

/// Conforms every row and extracts its key, rejecting the whole batch on the first bad row.
fn prepare(descriptor: &TableDescriptor, rows: Vec<Row>) -> PipelineResult<Vec<(String, Row)>> {
    let table = descriptor.name;
    let key_field = descriptor.policy.key();

    let mut batch = Vec::with_capacity(rows.len());
    let mut batch_keys = HashSet::new();
    for (position, row) in rows.into_iter().enumerate() {
        let row = conform(descriptor, row).map_err(|e| {
            error!("Error inserting data into {}: {}", table, e);
            e
        })?;
        let key = row.get(key_field).and_then(key_of).ok_or_else(|| {
            PipelineError::Schema(format!("{} row {} has no usable '{}'", table, position, key_field))
        })?;

        if !batch_keys.insert(key.clone()) {
            match descriptor.policy {
                ConflictPolicy::InsertIgnore { .. } => {}
                ConflictPolicy::UpsertOverwrite { .. } => {
                    error!("Error inserting data into {}: key {} repeated in one batch", table, key);
                    return Err(PipelineError::Conflict {
                        table: table.to_string(),
                        reason: format!("{} '{}' appears twice in one overwrite batch", key_field, key),
                    });
                }
            }
        }
        batch.push((key, row));
    }
    Ok(batch)
}

fn apply(descriptor: &TableDescriptor, data: &mut TableData, batch: Vec<(String, Row)>) -> UpsertSummary {
    let mut summary = UpsertSummary::default();
    for (key, row) in batch {
        match (data.index.get(&key).copied(), descriptor.policy) {
            (None, _) => {
                let position = data.rows.len();
                data.rows.push(row);
                data.index.insert(key, position);
                summary.inserted += 1;
            }
            (Some(_), ConflictPolicy::InsertIgnore { .. }) => summary.ignored += 1,
            (Some(position), ConflictPolicy::UpsertOverwrite { fields, .. }) => {
                let stored = &mut data.rows[position];
                for field in fields {
                    if let Some(value) = row.get(*field) {
                        stored.insert(field.to_string(), value.clone());
                    }
                }
                summary.updated += 1;
            }
        }
    }
    summary
}

/// Checks a row against the table's columns and returns it with exactly those columns.
fn conform(descriptor: &TableDescriptor, mut row: Row) -> PipelineResult<Row> {
    let mut conformed = Row::new();
    for spec in descriptor.columns {
        let value = row.remove(spec.name).unwrap_or(Value::Null);
        let valid = match (&value, spec.kind) {
            (Value::Null, _) => spec.nullable,
            (value, Int) => value.is_i64(),
            (value, Float) => value.is_number(),
            (value, Text) => value.is_string(),
            (value, Bool) => value.is_boolean(),
        };
        if !valid {
            return Err(PipelineError::Schema(format!(
                "{}.{} expects {:?}, got {}",
                descriptor.name, spec.name, spec.kind, value
            )));
        }
        conformed.insert(spec.name.to_string(), value);
    }

    if let Some(extra) = row.keys().next() {
        return Err(PipelineError::Schema(format!(
            "{} has no column '{}'",
            descriptor.name, extra
        )));
    }
    Ok(conformed)
}

fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn brand_name_for(entry: &Row, brands: &TableData) -> Option<String> {
    let brand_id = entry.get("brand_id").and_then(key_of)?;
    brands
        .get(&brand_id)?
        .get("brand_name")?
        .as_str()
        .map(str::to_string)
}

/// `"<perfume_name>, <brand_name>"`, the name users type when voting or checking.
pub fn full_name(entry: &Row, brand_name: Option<&str>) -> String {
    let perfume_name = entry.get("perfume_name").and_then(Value::as_str).unwrap_or("");
    format!("{}, {}", perfume_name, brand_name.unwrap_or(""))
}

fn compare_text(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a.and_then(Value::as_str), b.and_then(Value::as_str)) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn frame_of(columns: &[ColumnSpec], rows: &[Row]) -> PipelineResult<DataFrame> {
    let mut series_vec: Vec<Column> = Vec::with_capacity(columns.len());
    for spec in columns {
        let cells = rows.iter().map(|row| row.get(spec.name).unwrap_or(&Value::Null));
        let series = match spec.kind {
            Int => Series::new(spec.name.into(), cells.map(Value::as_i64).collect::<Vec<_>>()),
            Float => Series::new(spec.name.into(), cells.map(Value::as_f64).collect::<Vec<_>>()),
            Text => Series::new(
                spec.name.into(),
                cells.map(|v| v.as_str().map(str::to_string)).collect::<Vec<_>>(),
            ),
            Bool => Series::new(spec.name.into(), cells.map(Value::as_bool).collect::<Vec<_>>()),
        };
        series_vec.push(series.into());
    }

    Ok(DataFrame::new(series_vec)?)
}
