//! Vector stores, document indexing and layered chat memory for DocChat.

pub mod chunk;
pub mod in_memory;
pub mod indexer;
pub mod layered;
pub mod token;
pub mod vector;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use chunk::{Chunk, TextChunker};
pub use in_memory::InMemoryVectorStore;
pub use indexer::{DocumentIndexer, embed_query, embed_texts};
pub use layered::{
    CORE_DIRECTIVE, ChatMemory, FactExtractionBlock, MemoryBlock, MemorySettings, StaticBlock,
    VectorRecallBlock, create_memory,
};
pub use vector::{cosine_similarity, rank_records};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteVectorStore;
