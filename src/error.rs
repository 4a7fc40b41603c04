//! Error taxonomy for ingestion, training, checkpointing and inference.

use crate::encode::Field;
use crate::pipeline::TrainingStage;
use thiserror::Error;

/// Result type for library operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the training core and its collaborators.
#[derive(Error, Debug)]
pub enum Error {
    /// The chunk source could not be reached or read. Fatal, never retried.
    #[error("source connectivity failure: {0}")]
    SourceConnectivity(String),

    /// The source table does not have the columns or types needed for encoding.
    #[error("unsupported source schema: {0}")]
    Schema(String),

    /// An inference-path lookup hit a label the vocabulary has never seen.
    #[error("unknown {field} label '{label}'")]
    UnknownLabel { field: Field, label: String },

    /// A stored checkpoint exists but cannot be decoded.
    #[error("checkpoint at '{location}' is corrupt: {reason}")]
    CheckpointCorrupt { location: String, reason: String },

    /// The checkpoint blob store failed to read or write.
    #[error("checkpoint storage error: {0}")]
    CheckpointStorage(#[from] object_store::Error),

    /// The checkpoint could not be serialized.
    #[error("checkpoint encoding failed: {0}")]
    CheckpointEncode(String),

    /// A single chunk could not be encoded. The chunk is skipped.
    #[error("encoding failed for chunk {sequence}: {reason}")]
    Encoding { sequence: u64, reason: String },

    /// A single chunk missed its encoding deadline. The chunk is skipped.
    #[error("encoding of chunk {sequence} exceeded the {timeout_ms}ms deadline")]
    EncodeTimeout { sequence: u64, timeout_ms: u64 },

    /// The estimator rejected an operation.
    #[error("model error: {0}")]
    Model(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Create a corrupt-checkpoint error.
    pub fn corrupt<L: Into<String>, R: Into<String>>(location: L, reason: R) -> Self {
        Error::CheckpointCorrupt {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Create a model error with a custom message.
    pub fn model<S: Into<String>>(msg: S) -> Self {
        Error::Model(msg.into())
    }

    /// Create a source connectivity error with a custom message.
    pub fn connectivity<S: Into<String>>(msg: S) -> Self {
        Error::SourceConnectivity(msg.into())
    }

    /// Create an encoding error for one chunk.
    pub fn encoding<S: Into<String>>(sequence: u64, reason: S) -> Self {
        Error::Encoding {
            sequence,
            reason: reason.into(),
        }
    }

    /// Whether this error only affects a single chunk.
    ///
    /// Chunk-local errors are logged and the chunk is skipped; everything
    /// else aborts the training run.
    pub fn is_chunk_local(&self) -> bool {
        matches!(self, Error::Encoding { .. } | Error::EncodeTimeout { .. })
    }
}

/// A fatal error tagged with the training stage that raised it.
#[derive(Error, Debug)]
#[error("{stage} stage failed: {source}")]
pub struct TrainingError {
    /// Stage of the training state machine that failed
    pub stage: TrainingStage,

    /// Underlying cause
    #[source]
    pub source: Error,
}

impl TrainingError {
    /// Tag an error with a stage.
    pub fn new(stage: TrainingStage, source: Error) -> Self {
        Self { stage, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_local_errors() {
        assert!(Error::encoding(3, "bad row").is_chunk_local());
        assert!(Error::EncodeTimeout { sequence: 1, timeout_ms: 5000 }.is_chunk_local());
        assert!(!Error::connectivity("connection refused").is_chunk_local());
        assert!(!Error::corrupt("ckpt", "bad magic").is_chunk_local());
    }

    #[test]
    fn test_training_error_names_stage() {
        let err = TrainingError::new(
            TrainingStage::Checkpointing,
            Error::corrupt("checkpoints/model.ckpt", "checksum mismatch"),
        );
        let msg = err.to_string();
        assert!(msg.starts_with("checkpointing stage failed"), "{}", msg);
        assert!(msg.contains("checksum mismatch"));
    }

    #[test]
    fn test_unknown_label_display() {
        let err = Error::UnknownLabel {
            field: Field::Location,
            label: "USHUAIA".to_string(),
        };
        assert_eq!(err.to_string(), "unknown location label 'USHUAIA'");
    }
}
