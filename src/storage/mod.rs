//! Storage Adapters
//!
//! Reference implementations of the `MetadataStore` and `FileStorage` ports.

mod local;
mod memory;
mod persistent;

pub use local::{LocalFileStorage, LocalStorageConfig};
pub use memory::{MemoryFileStorage, MemoryMetadataStore};
pub use persistent::JsonMetadataStore;
