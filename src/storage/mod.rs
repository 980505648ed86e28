//! Storage layers.
//!
//! - [`local`]: what this node holds (`DashMap`)
//! - [`remote`]: the shared durable store, per payload type
//! - [`memory`] / [`sql`]: durable backend drivers
//! - [`filter`]: criteria shared by both drivers

pub mod traits;
pub mod filter;
pub mod local;
pub mod remote;
pub mod memory;
pub mod sql;

pub use filter::{Filter, FilterValue};
pub use local::LocalStore;
pub use memory::MemoryDocumentBackend;
pub use remote::{QueryModifier, RemoteStore};
pub use sql::SqlDocumentBackend;
pub use traits::{DocumentBackend, RawDocument, StorageError, Store};
