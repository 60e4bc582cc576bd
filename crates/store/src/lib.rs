#![warn(clippy::unwrap_used)]

pub mod error;
pub mod kv;
pub mod local;
pub mod memory;
pub mod redis_store;

pub use error::StoreError;
pub use kv::{KeyValueStore, SharedStore};
pub use local::TtlCache;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
