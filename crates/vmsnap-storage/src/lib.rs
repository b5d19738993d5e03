//! vmsnap Storage - Versioned object store and read caches
//!
//! This crate provides:
//! - KVStore trait with in-memory and redb backends
//! - ObjectStore: resource-version checked writes, merge patches,
//!   finalizer-aware deletion and a watch event bus
//! - ObjectCache trait with a store-backed implementation

pub mod cache;
pub mod error;
pub mod kv;
pub mod redb_backend;
pub mod store;

// Re-export commonly used types
pub use cache::{ObjectCache, StoreCache};
pub use error::{Result, StorageError};
pub use kv::{KVStore, MemoryBackend};
pub use redb_backend::RedbBackend;
pub use store::{EventBusConfig, ObjectStore};
