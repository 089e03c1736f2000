//! In-memory implementations for testing
pub mod store;
pub mod transport;

pub use store::InMemoryStore;
pub use transport::InMemoryTransport;
