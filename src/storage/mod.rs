pub mod memory;
pub mod redis;
pub mod traits;

pub use memory::MemoryPositionStore;
pub use redis::RedisPositionStore;
pub use traits::{
    collapse_latest, CleanupReport, HistoryRecord, LatestRecord, PositionStore, StoreError,
    StorePolicy, StoreStats,
};
