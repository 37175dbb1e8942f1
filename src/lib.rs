// Axel '0vercl0k' Souchet - October 18 2026
#![allow(clippy::doc_markdown)]
#![doc = include_str!("../README.md")]
mod addr;
mod cache;
mod constraint;
pub mod dump;
mod error;
mod export;
pub mod heap;
mod instance;
mod loader;
mod schema;
mod space;

pub use addr::{Address, WordSize};
pub use cache::{ReferenceCache, DEFAULT_SOFT_LIMIT};
pub use constraint::{Constraint, Scalar};
pub use error::{ignore_recoverable, HaystackError, ReadError, Result};
pub use export::{Node, Snapshot, Value};
pub use heap::{Allocation, ChunkFlags, HeapChunk, MallocChunk};
pub use instance::{
    FieldValue, Instance, InstanceId, InstanceView, LoadState, Loadable, StringField,
};
pub use loader::{Session, SessionConfig};
pub use schema::{Field, FieldDescriptor, FieldKind, Registry, Schema, SchemaDescriptor, SchemaId};
pub use space::{AddressSpace, Mappings, MemoryRegion};
