pub mod cancel;
pub mod config;
pub mod error;
pub mod graph;
pub mod model;
pub mod store;

pub use crate::cancel::CancelToken;
pub use crate::config::{Config, CyclePolicy, PatchNull, StorageKind};
pub use crate::error::{Result, StoreError};
pub use crate::graph::IndexedGraph;
pub use crate::model::{as_reference, extract_references, node_id, Document, Reference};
pub use crate::store::file::FileStore;
pub use crate::store::sqlite::SqliteStore;
pub use crate::store::{
    open_store, Batcher, Direction, GraphIntegrity, GraphNeighbors, MatchMode, Searcher, Store,
    StoreInfo,
};
