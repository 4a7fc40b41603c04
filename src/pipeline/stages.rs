//! Stages of the training state machine.
//!
//! ```text
//! Idle ─▶ Restoring ─▶ Dispatching ─▶ Encoding ‖ ─▶ Applying ─▶ Checkpointing ─┐
//!                          ▲                                                   │
//!                          └───────────────────────────────────────────────────┘
//!                      source exhausted ─▶ Flush ─▶ Done ─▶ Validation
//! ```
//!
//! Encoding runs concurrently across the worker pool; Applying and
//! Checkpointing only ever run in the single applier task.

use serde::Serialize;
use std::fmt;

/// A stage of a training run. Fatal errors are tagged with the stage that raised them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStage {
    Idle,
    /// Loading the checkpoint
    Restoring,
    /// Pulling chunks from the source and submitting them to the pool
    Dispatching,
    Encoding,
    /// Resolving vocabularies and fitting the model
    Applying,
    Checkpointing,
    /// Draining buffered completions after the source is exhausted
    Flush,
    Done,
    /// Scoring held-out rows against the final checkpoint
    Validation,
}

impl TrainingStage {
    /// Lowercase stage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingStage::Idle => "idle",
            TrainingStage::Restoring => "restoring",
            TrainingStage::Dispatching => "dispatching",
            TrainingStage::Encoding => "encoding",
            TrainingStage::Applying => "applying",
            TrainingStage::Checkpointing => "checkpointing",
            TrainingStage::Flush => "flush",
            TrainingStage::Done => "done",
            TrainingStage::Validation => "validation",
        }
    }
}

impl fmt::Display for TrainingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(TrainingStage::Checkpointing.to_string(), "checkpointing");
        assert_eq!(TrainingStage::Dispatching.as_str(), "dispatching");
        assert_eq!(
            serde_json::to_string(&TrainingStage::Validation).unwrap(),
            "\"validation\""
        );
    }
}
