//! Embedded checkpoint store for fleet node state.
//!
//! - `schema`: declarative entity schemas and statement generation
//! - `pool`: lazily bootstrapped SQLite connection pool
//! - `checkpoint`: lock-serialized CRUD facade with self-healing upsert
//! - `data`: persisted entities

pub mod checkpoint;
pub mod data;
pub mod pool;
pub mod schema;

use std::sync::Arc;

pub use checkpoint::CheckPointDb;
pub use pool::ConnectionPool;
pub use schema::{OrderBy, Page, SchemaMapper};

use crate::{Result, StoreConfig, store::data::NodeRecord};

/// Opens the node state store: a [`CheckPointDb`] over the node table.
///
/// Nothing touches the disk until the first operation.
pub fn open_node_store(config: &StoreConfig) -> Result<CheckPointDb> {
    let mapper = Arc::new(SchemaMapper::new());
    let pool = ConnectionPool::new(config.clone(), mapper).register::<NodeRecord>()?;
    Ok(CheckPointDb::new(Arc::new(pool)))
}
