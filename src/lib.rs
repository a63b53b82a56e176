//! Embedded file search engine.
//!
//! An in-memory metadata index over filesystem volumes with
//! SIMD-accelerated matching: a string pool deduplicates names and paths
//! into 32-bit ids, a composite index (record map + directory map +
//! extension map + path trie) routes queries to the narrowest candidate
//! set, and a live filesystem fallback covers roots the index has not
//! seen. Enumeration uses a parallel directory walker everywhere and the
//! NTFS master file table where privileges allow; a change observer keeps
//! the index consistent while the process runs.

pub mod cancel;
pub mod engine;
pub mod enumerate;
pub mod error;
pub mod index;
pub mod matcher;
pub mod observer;
pub mod options;
pub mod persist;
pub mod pool;
pub mod query;
pub mod record;
pub mod trie;

// Re-export the public surface
pub use cancel::CancellationToken;
pub use engine::{EngineState, EngineStatistics, ProgressEvent, SearchEngine, SearchResult};
pub use error::{Result, SearchError};
pub use index::CompositeIndex;
pub use observer::{ChangeEvent, ChangeObserver, ObserverOptions};
pub use options::{IndexingOptions, MftMode, SearchQuery};
pub use persist::{MirrorOp, PersistenceGateway, PersistenceStatistics};
pub use pool::{PoolKind, StringPool};
pub use query::{CompiledQuery, QueryEvaluator, SearchOutcome};
pub use record::{FileAttributes, FileEntry, FileRecord};
pub use trie::{PathTrieIndex, RecordKey};
