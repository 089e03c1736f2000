//! devstream-middleware: Pluggable broker and document-store abstractions
//!
//! Provides trait-based abstractions for the telemetry Transport and
//! DocumentStore, with in-memory implementations for testing.

pub mod error;
pub mod memory;
pub mod nats;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;
pub mod transport;

pub use error::{StoreError, TransportError};
pub use store::{field_as_key, Document, DocumentStore, PersistedRecord, RecordId};
pub use transport::{ConsumerConfig, Subscription, Transport, TransportMessage};
