use anyhow::{Context, Result, anyhow};
use catalog::EnvKeyStore;
use crate::config::{AppConfig, MinioConfig};
use fetcher::WreqTransport;
use pipeline::{AddOutcome, ScentPipeline};
use std::env;
use std::sync::Arc;
use storage::table_store::{CATALOG_FULL, TABLES, TRAINING_DATASET};
use storage::{ArtifactStore, MemoryArtifactStore, MemoryTableStore, MinioArtifactStore};
use tracing::{error, info, warn};

mod catalog;
mod config;
mod error;
mod fetcher;
mod models;
mod pipeline;
mod processor;
mod storage;
mod training;

const APP_CONFIG: &str = "src/configs/scent.toml";
const MINIO_CONFIG: &str = "src/configs/minio.toml";

const USAGE: &str = "usage: scent-recommender <add NAMES | vote like|dislike FULL_NAMES | check FULL_NAME | train | refresh | snapshot>
  NAMES are comma separated, FULL_NAMES are '<perfume>, <brand>' separated by ';'";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };
    let rest = args[1..].join(" ");

    let app_config = AppConfig::from_file(APP_CONFIG).context("Failed to load application configuration")?;
    info!("🚀 Starting scent recommender against {}", app_config.origin.base_url);

    let transport = Arc::new(WreqTransport::new().context("Failed to build HTTP client")?);
    let artifacts = artifact_store().await?;
    let storage = Arc::new(
        MemoryTableStore::open(artifacts.clone())
            .await
            .context("Failed to open storage")?,
    );

    let pipeline = match ScentPipeline::new(
        &app_config,
        transport,
        Arc::new(EnvKeyStore::new(&app_config.discovery.key_variable)),
        storage.clone(),
        artifacts.clone(),
    ) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            storage.close().await.context("Failed to close storage")?;
            return Err(e.into());
        }
    };

    let outcome = run(command, &rest, &pipeline, &storage, artifacts.as_ref()).await;

    // training scheduled by a vote must finish before the lease is released
    pipeline.wait_for_training().await;
    storage.close().await.context("Failed to close storage")?;

    outcome
}

async fn run(
    command: &str,
    rest: &str,
    pipeline: &ScentPipeline,
    storage: &MemoryTableStore,
    artifacts: &dyn ArtifactStore,
) -> Result<()> {
    match command {
        "add" => {
            let outcomes = pipeline.add_names(rest).await;
            if outcomes.is_empty() {
                return Err(anyhow!("No names given. {}", USAGE));
            }
            for outcome in &outcomes {
                println!("{}", outcome.message());
            }
            let added = outcomes
                .iter()
                .filter(|o| matches!(o.outcome, AddOutcome::Added { .. }))
                .count();
            info!("📊 {} of {} names added", added, outcomes.len());
        }
        "vote" => {
            let (verdict, names) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow!("vote needs like|dislike and names. {}", USAGE))?;
            let liked = match verdict {
                "like" => true,
                "dislike" => false,
                other => return Err(anyhow!("Unknown vote '{}'. {}", other, USAGE)),
            };
            let full_names: Vec<String> = names
                .split(';')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();

            let report = pipeline.submit_votes(&full_names, liked).await?;
            println!("Your vote for {} perfume(s) is added", report.recorded.len());
            for unknown in &report.unknown {
                warn!("⚠️ Not in catalog: {}", unknown);
            }
        }
        "check" => {
            if rest.is_empty() {
                return Err(anyhow!("check needs a full name. {}", USAGE));
            }
            let assessment = pipeline
                .assess(rest)
                .await
                .with_context(|| format!("Failed to check {}", rest))?;
            println!("{}: {}", rest, assessment.message());
        }
        "train" => {
            let status = pipeline.train_and_wait().await;
            if status.failed_runs > 0 {
                error!("❌ Training failed, see log above");
            } else {
                info!("🎉 Training finished ({} run(s))", status.completed_runs);
            }
        }
        "refresh" => {
            let report = pipeline.refresh_catalog().await?;
            info!(
                "📊 Refreshed {} of {} items without attributes",
                report.committed.len(),
                report.pending
            );
            if let Some(item_id) = report.stopped_at {
                warn!("⚠️ Refresh stopped at item {}, run again later", item_id);
            }
        }
        "snapshot" => {
            let names = TABLES
                .iter()
                .map(|descriptor| descriptor.name)
                .chain([CATALOG_FULL, TRAINING_DATASET]);
            for name in names {
                let parquet = storage.to_parquet(name).await?;
                let key = artifacts.put_snapshot(name, parquet).await?;
                info!("Stored processed data at: {}", key);
            }
        }
        other => {
            return Err(anyhow!("Unknown command '{}'. {}", other, USAGE));
        }
    }
    Ok(())
}

/// MinIO when its configuration and credentials are available, otherwise in-memory.
async fn artifact_store() -> Result<Arc<dyn ArtifactStore>> {
    let minio_config = match MinioConfig::from_file(MINIO_CONFIG) {
        Ok(config) => config,
        Err(e) => {
            warn!("⚠️ MinIO not configured ({}), artifacts will not outlive this run", e);
            return Ok(Arc::new(MemoryArtifactStore::new()));
        }
    };
    info!(
        "Loaded MinIO configuration: {}@{}",
        minio_config.endpoint, minio_config.bucket_name
    );

    let store = MinioArtifactStore::from_config(&minio_config)
        .context("Failed to initialize MinIO storage")?;
    store.ensure_bucket().await?;
    Ok(Arc::new(store))
}
