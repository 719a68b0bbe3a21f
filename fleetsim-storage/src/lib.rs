mod connection_cache;
mod memory;
mod repository;

pub use connection_cache::ConnectionCache;
pub use memory::MemoryStore;
pub use repository::Stores;
