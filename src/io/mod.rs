//! Storage and ingestion: object stores, checkpoints and chunk sources.

mod checkpoint;
mod source;
mod store;

pub use checkpoint::{
    decode_checkpoint, Checkpoint, CheckpointStore, CheckpointSummary, CheckpointView,
    LoadOutcome, SavedCheckpoint, TrainingProgress, CHECKPOINT_MAGIC, FORMAT_VERSION,
};
pub use source::{batch_to_rows, ChunkSource, MemoryChunkSource, ParquetChunkSource, SourceColumns};
pub use store::{create_s3_store, open_object, parse_location, parse_s3_uri, StoreLocation};
