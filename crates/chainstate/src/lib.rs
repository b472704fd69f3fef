//! Block index: chain graph, unspent tracking, queries and sync bookkeeping.

pub mod cache;
pub mod error;
pub mod graph;
pub mod lock;
pub mod query;
pub mod records;
pub mod stats;
pub mod unspent;

pub use cache::WriteCache;
pub use error::ChainError;
pub use graph::{ChainGraph, InsertKind, InsertOutcome};
pub use lock::{acquire_sync_lock, release_sync_lock, LockError, SyncLock};
pub use query::{AddressOutput, ChainQuery, TransactionView};
pub use records::BlockRecord;
pub use stats::{ChainStats, HashrateSample, NetworkStats, SyncHistoryEntry};
pub use unspent::{rederive_unspent, RederiveReport};
