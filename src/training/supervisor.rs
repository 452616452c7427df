use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::trainer::Trainer;
use crate::storage::{ArtifactStore, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new run was spawned.
    Started,
    /// A run is in flight; one follow-up run is queued behind it.
    Coalesced,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub running: bool,
    pub pending: bool,
    pub completed_runs: u64,
    pub failed_runs: u64,
}

/// Runs training off the caller's path, one run at a time.
///
/// Triggers that arrive while a run is active collapse into a single
/// follow-up run, so artifact versions are always published in trigger order.
pub struct TrainingSupervisor {
    trainer: Arc<Trainer>,
    storage: Arc<dyn Storage>,
    artifacts: Arc<dyn ArtifactStore>,
    state: Arc<Mutex<SupervisorStatus>>,
    idle: Arc<Notify>,
}

impl TrainingSupervisor {
    pub fn new(trainer: Arc<Trainer>, storage: Arc<dyn Storage>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        TrainingSupervisor {
            trainer,
            storage,
            artifacts,
            state: Arc::new(Mutex::new(SupervisorStatus::default())),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Returns as soon as the run is scheduled; training itself is never awaited here.
    pub async fn trigger(&self) -> TriggerOutcome {
        let mut state = self.state.lock().await;
        if state.running {
            state.pending = true;
            info!("Training already running, follow-up run queued");
            return TriggerOutcome::Coalesced;
        }
        state.running = true;
        drop(state);

        let trainer = self.trainer.clone();
        let storage = self.storage.clone();
        let artifacts = self.artifacts.clone();
        let state = self.state.clone();
        let idle = self.idle.clone();

        tokio::spawn(async move {
            loop {
                let run_id = Uuid::new_v4();
                info!("🚀 Training run {} started", run_id);

                let failed = match trainer.train(storage.as_ref(), artifacts.as_ref()).await {
                    Ok(outcome) => {
                        info!(
                            "✅ Training run {} published version {} ({} rows, {} columns)",
                            run_id, outcome.version, outcome.rows, outcome.columns
                        );
                        false
                    }
                    Err(e) if e.is_precursor_missing() => {
                        warn!("⚠️ Training run {} skipped: {}", run_id, e);
                        false
                    }
                    Err(e) => {
                        error!("❌ Training run {} failed: {}", run_id, e);
                        true
                    }
                };

                let mut state = state.lock().await;
                state.completed_runs += 1;
                if failed {
                    state.failed_runs += 1;
                }
                if state.pending {
                    state.pending = false;
                    continue;
                }
                state.running = false;
                drop(state);
                idle.notify_waiters();
                break;
            }
        });

        TriggerOutcome::Started
    }

    pub async fn status(&self) -> SupervisorStatus {
        *self.state.lock().await
    }

    /// Resolves once no run is active or queued.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.state.lock().await.running {
                return;
            }
            notified.await;
        }
    }
}
