//! Training orchestration: dispatch, concurrent encoding, serialized apply.

mod applier;
mod metrics;
mod orchestrator;
mod stages;

#[cfg(test)]
mod orchestrator_integration_tests;

pub use crate::config::ApplyOrder;
pub use applier::{ApplierReport, EncodeOutcome, TrainingContext};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use orchestrator::{OrchestratorConfig, TrainingOrchestrator, TrainingSummary};
pub use stages::TrainingStage;
