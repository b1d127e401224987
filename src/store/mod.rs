mod embed;
pub mod file;
pub mod sqlite;

#[cfg(test)]
mod tests;

use std::fmt;
use std::str::FromStr;

use crate::cancel::CancelToken;
use crate::config::{Config, StorageKind};
use crate::error::{Result, StoreError};
use crate::graph::IndexedGraph;
use crate::model::Document;

pub use file::FileStore;
pub use sqlite::SqliteStore;

/// Field-search comparison mode. Matching is case-insensitive; non-string
/// values are stringified first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Exact,
    Contains,
    Starts,
    Ends,
}

impl FromStr for MatchMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exact" => Ok(MatchMode::Exact),
            "contains" => Ok(MatchMode::Contains),
            "starts" => Ok(MatchMode::Starts),
            "ends" => Ok(MatchMode::Ends),
            other => Err(StoreError::InvalidInput(format!(
                "invalid match mode {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Out => "out",
            Direction::In => "in",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static capability summary a backend advertises to collaborator layers.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub kind: &'static str,
    pub version: &'static str,
    pub supports_search: bool,
    pub supports_batch: bool,
    pub supports_transactions: bool,
}

/// The polymorphic contract both backends implement. Every operation threads
/// the caller's cancellation token and checks it before committing.
pub trait Store: Send + Sync {
    /// Persists `doc` under a freshly allocated id and returns that id.
    fn create(&self, ctx: &CancelToken, entity: &str, doc: Document) -> Result<i64>;

    fn get(&self, ctx: &CancelToken, entity: &str, id: i64) -> Result<Document>;

    /// Full replacement; the reserved `id` field is normalised to `id`.
    fn update(&self, ctx: &CancelToken, entity: &str, id: i64, doc: Document) -> Result<()>;

    /// Field-wise merge. `id` keys in the partial are ignored; `null` values
    /// delete or store the field per the configured null policy.
    fn patch(&self, ctx: &CancelToken, entity: &str, id: i64, partial: Document) -> Result<()>;

    /// Removes the document and every edge in which its node appears.
    fn delete(&self, ctx: &CancelToken, entity: &str, id: i64) -> Result<()>;

    /// Persists `doc` at an explicit id, bumping the id sequence past it.
    fn save(&self, ctx: &CancelToken, entity: &str, id: i64, doc: Document) -> Result<()>;

    /// All documents of the entity type, id ascending.
    fn list(&self, ctx: &CancelToken, entity: &str) -> Result<Vec<Document>>;

    fn exists(&self, ctx: &CancelToken, entity: &str, id: i64) -> bool;

    /// Entity types known to the store, name ascending.
    fn list_entity_types(&self, ctx: &CancelToken) -> Result<Vec<String>>;

    fn info(&self) -> StoreInfo;

    fn config(&self) -> &Config;

    /// The shared in-memory graph, absent when graph maintenance is
    /// disabled by configuration.
    fn graph(&self) -> Option<&IndexedGraph> {
        None
    }

    /// Fetches a document and recursively replaces its top-level reference
    /// fields with the referenced documents, up to `depth` hops (clamped to
    /// the configured maximum). Missing targets and exhausted depth leave
    /// the reference object in place.
    fn get_embedded(
        &self,
        ctx: &CancelToken,
        entity: &str,
        id: i64,
        depth: usize,
    ) -> Result<Document> {
        let doc = self.get(ctx, entity, id)?;
        embed::embed_document(self, ctx, doc, depth.min(self.config().max_embed_depth))
    }

    /// Deletes the node together with every node that transitively refers to
    /// it, bounded by the configured cascade ceiling. The default is the
    /// file-backend discipline: victims are deleted one by one, best-effort,
    /// with no rollback on partial failure.
    fn delete_cascading(&self, ctx: &CancelToken, entity: &str, id: i64) -> Result<Vec<String>> {
        embed::delete_cascading_best_effort(self, ctx, entity, id)
    }

    fn as_searcher(&self) -> Option<&dyn Searcher> {
        None
    }

    fn as_batcher(&self) -> Option<&dyn Batcher> {
        None
    }

    fn as_graph_neighbors(&self) -> Option<&dyn GraphNeighbors> {
        None
    }

    fn as_graph_integrity(&self) -> Option<&dyn GraphIntegrity> {
        None
    }
}

/// Field search over one document field.
pub trait Searcher {
    fn search(
        &self,
        ctx: &CancelToken,
        entity: &str,
        field: &str,
        query: &str,
        mode: MatchMode,
    ) -> Result<Vec<Document>>;
}

/// Batch operations, grouped atomically where the backend can.
pub trait Batcher {
    fn batch_create(
        &self,
        ctx: &CancelToken,
        entity: &str,
        items: Vec<Document>,
    ) -> Result<Vec<i64>>;

    fn batch_delete(&self, ctx: &CancelToken, entity: &str, ids: &[i64]) -> Result<()>;
}

/// Document-level neighbour queries: the documents adjacent to a node, with
/// `_neighbor_type`, `_relationship` and `_direction` metadata attached.
pub trait GraphNeighbors {
    fn neighbors_of(
        &self,
        ctx: &CancelToken,
        entity: &str,
        id: i64,
        direction: Direction,
    ) -> Result<Vec<Document>>;
}

/// Consistency checking between stored documents and the derived edge set.
pub trait GraphIntegrity {
    /// Read-only diff of the expected edge set (extracted from documents)
    /// against the persisted one. A difference is an integrity error;
    /// dangling targets are only warned about.
    fn audit(&self, ctx: &CancelToken) -> Result<()>;

    /// Destructive regeneration of the persisted edge set from documents.
    fn rebuild(&self, ctx: &CancelToken) -> Result<()>;
}

/// Opens the backend selected by `config.storage`.
pub fn open_store(config: &Config) -> Result<Box<dyn Store>> {
    match config.storage {
        StorageKind::File => Ok(Box::new(FileStore::open(config.clone())?)),
        StorageKind::Sqlite => Ok(Box::new(SqliteStore::open(config.clone())?)),
    }
}
