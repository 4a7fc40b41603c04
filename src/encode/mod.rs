//! Categorical vocabularies and chunk encoding.

mod encoder;
mod vocabulary;

pub use encoder::{ChunkEncoder, EncodeMode, LabelGrowth, PreparedChunk};
pub use vocabulary::{DuplicateLabel, Field, UnknownLabel, Vocabularies, Vocabulary};
