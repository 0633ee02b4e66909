// Translation cache: key codec, L1 memory tier, L2 durable tier and the manager composing them
// Author: kelexine (https://github.com/kelexine)

pub mod durable;
pub mod key;
pub mod manager;
pub mod memory;
pub mod models;

pub use durable::{system_clock, Clock, DurableCache, SqliteCache};
pub use key::{CacheKey, KeyFilter, KEY_FORMAT_VERSION};
pub use manager::CacheManager;
pub use memory::MemoryCache;
pub use models::{CacheEntry, CacheEntrySummary, CacheStats, CacheTier, Resolution};
