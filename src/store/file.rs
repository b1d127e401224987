use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::config::{Config, PatchNull};
use crate::error::{Result, StoreError};
use crate::graph::IndexedGraph;
use crate::model::{node_id, parse_node_id, validate_entity_name, validate_id, Document};

use super::{Direction, GraphIntegrity, GraphNeighbors, MatchMode, Searcher, Store, StoreInfo};

const NEXT_ID_FILE: &str = "_next_id";

/// File-per-entity backend: every document is
/// `<base>/<schema>/<entity>/<id>.json`, the per-entity id sequence lives in
/// `<entity>/_next_id`, and the derived graph is flushed to
/// `<base>/graph.data` after every mutation.
///
/// Mutations hold the backend lock exclusively across the document write and
/// the graph flush, so a reader admitted afterwards observes both. Id
/// allocation uses per-entity locks and never overlaps the backend lock.
pub struct FileStore {
    config: Config,
    schema_dir: PathBuf,
    graph_path: PathBuf,
    graph_index_path: PathBuf,
    graph: Option<IndexedGraph>,
    id_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    lock: RwLock<()>,
}

impl FileStore {
    pub fn open(config: Config) -> Result<Self> {
        let schema_dir = config.base_dir.join(&config.schema);
        fs::create_dir_all(&schema_dir)?;

        let graph_path = config.graph_data_path();
        let graph_index_path = config.graph_index_path();
        let graph = if config.graph_enabled {
            let graph = IndexedGraph::new();
            graph.load(&graph_path)?;
            graph.load_index(&graph_index_path)?;
            Some(graph)
        } else {
            None
        };

        Ok(Self {
            config,
            schema_dir,
            graph_path,
            graph_index_path,
            graph,
            id_locks: Mutex::new(HashMap::new()),
            lock: RwLock::new(()),
        })
    }

    fn entity_dir(&self, entity: &str) -> PathBuf {
        self.schema_dir.join(entity)
    }

    fn document_path(&self, entity: &str, id: i64) -> PathBuf {
        self.entity_dir(entity).join(format!("{id}.json"))
    }

    fn next_id_path(&self, entity: &str) -> PathBuf {
        self.entity_dir(entity).join(NEXT_ID_FILE)
    }

    /// Lazily created per-entity lock; the map mutex is held only to
    /// install or fetch the entry.
    fn id_lock(&self, entity: &str) -> Arc<Mutex<()>> {
        let mut locks = self.id_locks.lock();
        locks.entry(entity.to_string()).or_default().clone()
    }

    /// Allocates the next id for `entity`. The incremented sequence is
    /// durable on disk before the id is returned, so a crash cannot hand the
    /// same id out twice.
    fn next_id(&self, ctx: &CancelToken, entity: &str) -> Result<i64> {
        let lock = self.id_lock(entity);
        let _guard = lock.lock();
        ctx.check()?;

        fs::create_dir_all(self.entity_dir(entity))?;
        let path = self.next_id_path(entity);
        let next = read_sequence(&path)?;
        write_sequence(&path, next + 1)?;
        Ok(next)
    }

    /// Raises the sequence to `floor` if it is currently lower, so explicit
    /// ids handed to `save` cannot collide with later allocations.
    fn bump_sequence(&self, entity: &str, floor: i64) -> Result<()> {
        let lock = self.id_lock(entity);
        let _guard = lock.lock();

        fs::create_dir_all(self.entity_dir(entity))?;
        let path = self.next_id_path(entity);
        if read_sequence(&path)? < floor {
            write_sequence(&path, floor)?;
        }
        Ok(())
    }

    fn read_document(&self, entity: &str, id: i64) -> Result<Document> {
        let path = self.document_path(entity, id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::not_found(entity, id))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Temp file + fsync + rename, so a torn write never replaces a
    /// previously committed document.
    fn write_document(&self, entity: &str, id: i64, doc: &Document) -> Result<()> {
        let dir = self.entity_dir(entity);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!(".{id}.json.tmp"));
        let data = serde_json::to_vec_pretty(doc)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.document_path(entity, id))?;
        Ok(())
    }

    fn load_documents(&self, entity: &str) -> Result<Vec<Document>> {
        let dir = self.entity_dir(entity);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut docs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == NEXT_ID_FILE || !name.ends_with(".json") {
                continue;
            }
            match fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|data| Ok(serde_json::from_slice::<Document>(&data)?))
            {
                Ok(doc) => docs.push(doc),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable document")
                }
            }
        }
        docs.sort_by_key(|doc| doc.get("id").and_then(Value::as_i64).unwrap_or(0));
        Ok(docs)
    }

    fn entity_types(&self) -> Result<Vec<String>> {
        let mut types = Vec::new();
        for entry in fs::read_dir(&self.schema_dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                types.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        types.sort();
        Ok(types)
    }

    /// Reconciles the in-memory graph with `doc` and flushes it. Called with
    /// the backend lock held exclusively.
    fn sync_graph(&self, entity: &str, id: i64, doc: &Document) -> Result<()> {
        if let Some(graph) = &self.graph {
            graph.update_from_document(entity, id, doc);
            self.flush_graph(graph)?;
        }
        Ok(())
    }

    fn flush_graph(&self, graph: &IndexedGraph) -> Result<()> {
        graph.save(&self.graph_path)?;
        graph.save_index(&self.graph_index_path)
    }

    /// The edge set the documents on disk imply, materialised through the
    /// same sync path the runtime uses.
    fn expected_graph(&self) -> Result<IndexedGraph> {
        let expected = IndexedGraph::new();
        for entity in self.entity_types()? {
            for doc in self.load_documents(&entity)? {
                match doc.get("id").and_then(Value::as_i64) {
                    Some(id) => expected.update_from_document(&entity, id, &doc),
                    None => warn!(entity = %entity, "skipping document without a numeric id"),
                }
            }
        }
        Ok(expected)
    }
}

impl Store for FileStore {
    fn create(&self, ctx: &CancelToken, entity: &str, mut doc: Document) -> Result<i64> {
        validate_entity_name(entity)?;
        ctx.check()?;

        let id = self.next_id(ctx, entity)?;
        doc.insert("id".to_string(), Value::from(id));

        let _guard = self.lock.write();
        ctx.check()?;
        self.write_document(entity, id, &doc)?;
        self.sync_graph(entity, id, &doc)?;
        Ok(id)
    }

    fn get(&self, ctx: &CancelToken, entity: &str, id: i64) -> Result<Document> {
        validate_entity_name(entity)?;
        ctx.check()?;
        let _guard = self.lock.read();
        self.read_document(entity, id)
    }

    fn update(&self, ctx: &CancelToken, entity: &str, id: i64, mut doc: Document) -> Result<()> {
        validate_entity_name(entity)?;
        validate_id(id)?;
        ctx.check()?;

        let _guard = self.lock.write();
        if !self.document_path(entity, id).is_file() {
            return Err(StoreError::not_found(entity, id));
        }
        doc.insert("id".to_string(), Value::from(id));
        ctx.check()?;
        self.write_document(entity, id, &doc)?;
        self.sync_graph(entity, id, &doc)
    }

    fn patch(&self, ctx: &CancelToken, entity: &str, id: i64, partial: Document) -> Result<()> {
        validate_entity_name(entity)?;
        ctx.check()?;

        let _guard = self.lock.write();
        let mut doc = self.read_document(entity, id)?;
        for (field, value) in partial {
            if field == "id" {
                continue;
            }
            if value.is_null() && self.config.patch_null == PatchNull::Delete {
                doc.remove(&field);
            } else {
                doc.insert(field, value);
            }
        }
        doc.insert("id".to_string(), Value::from(id));
        ctx.check()?;
        self.write_document(entity, id, &doc)?;
        self.sync_graph(entity, id, &doc)
    }

    fn delete(&self, ctx: &CancelToken, entity: &str, id: i64) -> Result<()> {
        validate_entity_name(entity)?;
        ctx.check()?;

        let _guard = self.lock.write();
        let path = self.document_path(entity, id);
        if !path.is_file() {
            return Err(StoreError::not_found(entity, id));
        }
        ctx.check()?;
        fs::remove_file(&path)?;
        if let Some(graph) = &self.graph {
            graph.remove_node(&node_id(entity, id));
            self.flush_graph(graph)?;
        }
        Ok(())
    }

    fn save(&self, ctx: &CancelToken, entity: &str, id: i64, mut doc: Document) -> Result<()> {
        validate_entity_name(entity)?;
        validate_id(id)?;
        ctx.check()?;

        let _guard = self.lock.write();
        if self.document_path(entity, id).is_file() {
            return Err(StoreError::already_exists(entity, id));
        }
        self.bump_sequence(entity, id + 1)?;
        doc.insert("id".to_string(), Value::from(id));
        ctx.check()?;
        self.write_document(entity, id, &doc)?;
        self.sync_graph(entity, id, &doc)
    }

    fn list(&self, ctx: &CancelToken, entity: &str) -> Result<Vec<Document>> {
        validate_entity_name(entity)?;
        ctx.check()?;
        let _guard = self.lock.read();
        self.load_documents(entity)
    }

    fn exists(&self, _ctx: &CancelToken, entity: &str, id: i64) -> bool {
        let _guard = self.lock.read();
        self.document_path(entity, id).is_file()
    }

    fn list_entity_types(&self, ctx: &CancelToken) -> Result<Vec<String>> {
        ctx.check()?;
        let _guard = self.lock.read();
        self.entity_types()
    }

    fn info(&self) -> StoreInfo {
        StoreInfo {
            kind: "file",
            version: env!("CARGO_PKG_VERSION"),
            supports_search: true,
            supports_batch: false,
            supports_transactions: false,
        }
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn graph(&self) -> Option<&IndexedGraph> {
        self.graph.as_ref()
    }

    fn as_searcher(&self) -> Option<&dyn Searcher> {
        Some(self)
    }

    fn as_graph_neighbors(&self) -> Option<&dyn GraphNeighbors> {
        Some(self)
    }

    fn as_graph_integrity(&self) -> Option<&dyn GraphIntegrity> {
        Some(self)
    }
}

impl Searcher for FileStore {
    /// Linear scan over `list`; the match is case-insensitive and
    /// non-string values are stringified first.
    fn search(
        &self,
        ctx: &CancelToken,
        entity: &str,
        field: &str,
        query: &str,
        mode: MatchMode,
    ) -> Result<Vec<Document>> {
        let needle = query.to_lowercase();
        let docs = self.list(ctx, entity)?;
        Ok(docs
            .into_iter()
            .filter(|doc| {
                doc.get(field).is_some_and(|value| {
                    let hay = stringify(value).to_lowercase();
                    match mode {
                        MatchMode::Exact => hay == needle,
                        MatchMode::Contains => hay.contains(&needle),
                        MatchMode::Starts => hay.starts_with(&needle),
                        MatchMode::Ends => hay.ends_with(&needle),
                    }
                })
            })
            .collect())
    }
}

impl GraphNeighbors for FileStore {
    fn neighbors_of(
        &self,
        ctx: &CancelToken,
        entity: &str,
        id: i64,
        direction: Direction,
    ) -> Result<Vec<Document>> {
        validate_entity_name(entity)?;
        ctx.check()?;

        let _guard = self.lock.read();
        let graph = self
            .graph
            .as_ref()
            .ok_or(StoreError::Unsupported("graph maintenance is disabled"))?;

        let node = node_id(entity, id);
        let adjacent = match direction {
            Direction::Out => graph.neighbors(&node),
            Direction::In => graph.incoming(&node),
        };

        let mut results = Vec::new();
        for (other, relationship) in adjacent {
            let (other_entity, other_id) = parse_node_id(&other)?;
            // Dangling references have an edge but no document; skip them.
            let mut doc = match self.read_document(&other_entity, other_id) {
                Ok(doc) => doc,
                Err(StoreError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            doc.insert("_neighbor_type".to_string(), Value::from(other_entity));
            doc.insert("_relationship".to_string(), Value::from(relationship));
            doc.insert("_direction".to_string(), Value::from(direction.as_str()));
            results.push(doc);
        }
        Ok(results)
    }
}

impl GraphIntegrity for FileStore {
    /// Diffs the edge set implied by the documents against the persisted
    /// `graph.data`, through the same extraction the runtime sync uses.
    fn audit(&self, ctx: &CancelToken) -> Result<()> {
        ctx.check()?;
        let _guard = self.lock.read();
        if self.graph.is_none() {
            return Err(StoreError::Unsupported("graph maintenance is disabled"));
        }

        let expected = self.expected_graph()?;
        let persisted = IndexedGraph::new();
        persisted.load(&self.graph_path)?;

        let expected_edges: std::collections::BTreeSet<_> = expected.edges().into_iter().collect();
        let actual_edges: std::collections::BTreeSet<_> = persisted.edges().into_iter().collect();

        for (source, target, relationship) in &expected_edges {
            let (target_entity, target_id) = parse_node_id(target)?;
            if !self.document_path(&target_entity, target_id).is_file() {
                warn!(source = %source, target = %target, relationship = %relationship, "dangling reference");
            }
        }

        if let Some((source, target, relationship)) =
            expected_edges.difference(&actual_edges).next()
        {
            return Err(StoreError::Integrity(format!(
                "missing edge {source} -[{relationship}]-> {target}"
            )));
        }
        if let Some((source, target, relationship)) =
            actual_edges.difference(&expected_edges).next()
        {
            return Err(StoreError::Integrity(format!(
                "unexpected edge {source} -[{relationship}]-> {target}"
            )));
        }
        Ok(())
    }

    /// Regenerates the in-memory graph from the documents and rewrites both
    /// graph files.
    fn rebuild(&self, ctx: &CancelToken) -> Result<()> {
        ctx.check()?;
        let _guard = self.lock.write();
        let graph = self
            .graph
            .as_ref()
            .ok_or(StoreError::Unsupported("graph maintenance is disabled"))?;

        graph.clear();
        for entity in self.entity_types()? {
            for doc in self.load_documents(&entity)? {
                if let Some(id) = doc.get("id").and_then(Value::as_i64) {
                    graph.update_from_document(&entity, id, &doc);
                }
            }
        }
        self.flush_graph(graph)
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn read_sequence(path: &Path) -> Result<i64> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(1),
        Err(err) => return Err(err.into()),
    };
    let parsed: Value = match serde_json::from_slice(&data) {
        Ok(parsed) => parsed,
        Err(_) => return Ok(1),
    };
    Ok(parsed.get("next_id").and_then(Value::as_i64).unwrap_or(1))
}

fn write_sequence(path: &Path, next_id: i64) -> Result<()> {
    let tmp = {
        let mut os = path.as_os_str().to_owned();
        os.push(".tmp");
        PathBuf::from(os)
    };
    let data = serde_json::to_vec(&serde_json::json!({ "next_id": next_id }))?;
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
