// Store module: key/value backends and the record persistence built on them

pub mod backend;
pub mod persistence;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use persistence::KvPersistence;
