pub mod prediction;
pub mod supervisor;
pub mod trainer;

pub use prediction::{Assessment, PredictionService};
pub use supervisor::{SupervisorStatus, TrainingSupervisor, TriggerOutcome};
pub use trainer::{ScentEnsemble, Trainer, TrainingOutcome};
