use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::config::{Config, PatchNull};
use crate::error::{Result, StoreError};
use crate::graph::IndexedGraph;
use crate::model::{
    extract_references, node_id, validate_entity_name, validate_id, Document,
};

use super::{Batcher, Direction, GraphIntegrity, GraphNeighbors, MatchMode, Searcher, Store, StoreInfo};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entities (
    entity_type TEXT NOT NULL,
    id INTEGER NOT NULL,
    data_json TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (entity_type, id)
);
CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type);
CREATE INDEX IF NOT EXISTS idx_entities_updated_at ON entities(updated_at);

CREATE TABLE IF NOT EXISTS graph_edges (
    source_entity TEXT NOT NULL,
    source_id INTEGER NOT NULL,
    target_entity TEXT NOT NULL,
    target_id INTEGER NOT NULL,
    relationship TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (source_entity, source_id, target_entity, target_id, relationship)
);
CREATE INDEX IF NOT EXISTS idx_graph_source ON graph_edges(source_entity, source_id);
CREATE INDEX IF NOT EXISTS idx_graph_target ON graph_edges(target_entity, target_id);
CREATE INDEX IF NOT EXISTS idx_graph_relationship ON graph_edges(relationship);

CREATE TABLE IF NOT EXISTS entity_sequences (
    entity_type TEXT PRIMARY KEY,
    next_id INTEGER NOT NULL DEFAULT 1
);
";

/// Relational backend: documents are rows of `entities`, edges rows of
/// `graph_edges`, id sequences rows of `entity_sequences`. Every mutation is
/// one transaction covering the document write and the explicit edge sync;
/// the edge sync is code, not triggers, so document/graph atomicity does not
/// depend on the engine's JSON support.
///
/// The in-memory graph (when enabled) is rebuilt from the stored documents
/// at open and updated after each commit while the connection lock is still
/// held, so store readers admitted afterwards observe both effects.
pub struct SqliteStore {
    config: Config,
    conn: Mutex<Connection>,
    graph: Option<IndexedGraph>,
}

impl SqliteStore {
    pub fn open(config: Config) -> Result<Self> {
        let conn = Connection::open(&config.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        conn.execute_batch(SCHEMA)?;

        let graph = if config.graph_enabled {
            let graph = IndexedGraph::new();
            let mut stmt = conn.prepare("SELECT entity_type, id, data_json FROM entities")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (entity, id, data) = row?;
                match serde_json::from_str::<Document>(&data) {
                    Ok(doc) => graph.update_from_document(&entity, id, &doc),
                    Err(err) => warn!(entity = %entity, id, error = %err, "skipping unreadable row"),
                }
            }
            drop(stmt);
            Some(graph)
        } else {
            None
        };

        Ok(Self {
            config,
            conn: Mutex::new(conn),
            graph,
        })
    }

    fn fetch_document(conn: &Connection, entity: &str, id: i64) -> Result<Document> {
        let data: Option<String> = conn
            .query_row(
                "SELECT data_json FROM entities WHERE entity_type = ?1 AND id = ?2",
                params![entity, id],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(StoreError::not_found(entity, id)),
        }
    }

    fn row_exists(conn: &Connection, entity: &str, id: i64) -> Result<bool> {
        Ok(conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM entities WHERE entity_type = ?1 AND id = ?2)",
            params![entity, id],
            |row| row.get(0),
        )?)
    }

    fn graph_update(&self, entity: &str, id: i64, doc: &Document) {
        if let Some(graph) = &self.graph {
            graph.update_from_document(entity, id, doc);
        }
    }

    fn graph_remove(&self, entity: &str, id: i64) {
        if let Some(graph) = &self.graph {
            graph.remove_node(&node_id(entity, id));
        }
    }
}

/// Replaces the out-edge set of `(entity, id)` inside the caller's
/// transaction: delete everything, reinsert what the document implies.
fn sync_edges(conn: &Connection, entity: &str, id: i64, doc: &Document) -> Result<()> {
    conn.execute(
        "DELETE FROM graph_edges WHERE source_entity = ?1 AND source_id = ?2",
        params![entity, id],
    )?;
    for (field, reference) in extract_references(doc) {
        conn.execute(
            "INSERT INTO graph_edges (source_entity, source_id, target_entity, target_id, relationship)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![entity, id, reference.entity, reference.id, field],
        )?;
    }
    Ok(())
}

/// Allocates the next id for `entity` inside the caller's transaction.
fn allocate_id(conn: &Connection, entity: &str) -> Result<i64> {
    Ok(conn.query_row(
        "INSERT INTO entity_sequences (entity_type, next_id) VALUES (?1, 2)
         ON CONFLICT(entity_type) DO UPDATE SET next_id = next_id + 1
         RETURNING next_id - 1",
        params![entity],
        |row| row.get(0),
    )?)
}

/// Raises the sequence past an explicitly saved id.
fn bump_sequence(conn: &Connection, entity: &str, id: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO entity_sequences (entity_type, next_id) VALUES (?1, ?2)
         ON CONFLICT(entity_type) DO UPDATE SET next_id = MAX(next_id, excluded.next_id)",
        params![entity, id + 1],
    )?;
    Ok(())
}

fn delete_node_rows(conn: &Connection, entity: &str, id: i64) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM entities WHERE entity_type = ?1 AND id = ?2",
        params![entity, id],
    )?;
    conn.execute(
        "DELETE FROM graph_edges
         WHERE (source_entity = ?1 AND source_id = ?2)
            OR (target_entity = ?1 AND target_id = ?2)",
        params![entity, id],
    )?;
    Ok(removed)
}

impl Store for SqliteStore {
    fn create(&self, ctx: &CancelToken, entity: &str, mut doc: Document) -> Result<i64> {
        validate_entity_name(entity)?;
        ctx.check()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = allocate_id(&tx, entity)?;
        doc.insert("id".to_string(), Value::from(id));
        tx.execute(
            "INSERT INTO entities (entity_type, id, data_json) VALUES (?1, ?2, ?3)",
            params![entity, id, serde_json::to_string(&doc)?],
        )?;
        sync_edges(&tx, entity, id, &doc)?;
        ctx.check()?;
        tx.commit()?;

        self.graph_update(entity, id, &doc);
        Ok(id)
    }

    fn get(&self, ctx: &CancelToken, entity: &str, id: i64) -> Result<Document> {
        validate_entity_name(entity)?;
        ctx.check()?;
        let conn = self.conn.lock();
        Self::fetch_document(&conn, entity, id)
    }

    fn update(&self, ctx: &CancelToken, entity: &str, id: i64, mut doc: Document) -> Result<()> {
        validate_entity_name(entity)?;
        validate_id(id)?;
        ctx.check()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        doc.insert("id".to_string(), Value::from(id));
        let changed = tx.execute(
            "UPDATE entities SET data_json = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE entity_type = ?2 AND id = ?3",
            params![serde_json::to_string(&doc)?, entity, id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found(entity, id));
        }
        sync_edges(&tx, entity, id, &doc)?;
        ctx.check()?;
        tx.commit()?;

        self.graph_update(entity, id, &doc);
        Ok(())
    }

    fn patch(&self, ctx: &CancelToken, entity: &str, id: i64, partial: Document) -> Result<()> {
        validate_entity_name(entity)?;
        ctx.check()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut doc = Self::fetch_document(&tx, entity, id)?;
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
        tx.execute(
            "UPDATE entities SET data_json = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE entity_type = ?2 AND id = ?3",
            params![serde_json::to_string(&doc)?, entity, id],
        )?;
        sync_edges(&tx, entity, id, &doc)?;
        ctx.check()?;
        tx.commit()?;

        self.graph_update(entity, id, &doc);
        Ok(())
    }

    fn delete(&self, ctx: &CancelToken, entity: &str, id: i64) -> Result<()> {
        validate_entity_name(entity)?;
        ctx.check()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if delete_node_rows(&tx, entity, id)? == 0 {
            return Err(StoreError::not_found(entity, id));
        }
        ctx.check()?;
        tx.commit()?;

        self.graph_remove(entity, id);
        Ok(())
    }

    fn save(&self, ctx: &CancelToken, entity: &str, id: i64, mut doc: Document) -> Result<()> {
        validate_entity_name(entity)?;
        validate_id(id)?;
        ctx.check()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if Self::row_exists(&tx, entity, id)? {
            return Err(StoreError::already_exists(entity, id));
        }
        bump_sequence(&tx, entity, id)?;
        doc.insert("id".to_string(), Value::from(id));
        tx.execute(
            "INSERT INTO entities (entity_type, id, data_json) VALUES (?1, ?2, ?3)",
            params![entity, id, serde_json::to_string(&doc)?],
        )?;
        sync_edges(&tx, entity, id, &doc)?;
        ctx.check()?;
        tx.commit()?;

        self.graph_update(entity, id, &doc);
        Ok(())
    }

    fn list(&self, ctx: &CancelToken, entity: &str) -> Result<Vec<Document>> {
        validate_entity_name(entity)?;
        ctx.check()?;

        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT data_json FROM entities WHERE entity_type = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![entity], |row| row.get::<_, String>(0))?;
        let mut docs = Vec::new();
        for row in rows {
            docs.push(serde_json::from_str(&row?)?);
        }
        Ok(docs)
    }

    fn exists(&self, _ctx: &CancelToken, entity: &str, id: i64) -> bool {
        let conn = self.conn.lock();
        Self::row_exists(&conn, entity, id).unwrap_or(false)
    }

    fn list_entity_types(&self, ctx: &CancelToken) -> Result<Vec<String>> {
        ctx.check()?;
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT DISTINCT entity_type FROM entities ORDER BY entity_type")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut types = Vec::new();
        for row in rows {
            types.push(row?);
        }
        Ok(types)
    }

    fn info(&self) -> StoreInfo {
        StoreInfo {
            kind: "sqlite",
            version: env!("CARGO_PKG_VERSION"),
            supports_search: true,
            supports_batch: true,
            supports_transactions: true,
        }
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn graph(&self) -> Option<&IndexedGraph> {
        self.graph.as_ref()
    }

    /// Unlike the best-effort default, the whole cascade is one transaction:
    /// either every victim is deleted or none are.
    fn delete_cascading(&self, ctx: &CancelToken, entity: &str, id: i64) -> Result<Vec<String>> {
        validate_entity_name(entity)?;
        validate_id(id)?;
        ctx.check()?;

        let limit = self.config.max_cascade_deletions;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if !Self::row_exists(&tx, entity, id)? {
            return Err(StoreError::not_found(entity, id));
        }

        let victims = {
            let mut stmt = tx.prepare(
                "SELECT source_entity, source_id FROM graph_edges
                 WHERE target_entity = ?1 AND target_id = ?2",
            )?;
            let mut queue = VecDeque::new();
            queue.push_back((entity.to_string(), id));
            let mut seen = BTreeSet::new();
            seen.insert(node_id(entity, id));
            let mut victims = Vec::new();

            while let Some((victim_entity, victim_id)) = queue.pop_front() {
                victims.push((victim_entity.clone(), victim_id));
                if victims.len() > limit {
                    return Err(StoreError::CascadeLimit(limit));
                }
                let sources = stmt.query_map(params![victim_entity, victim_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for source in sources {
                    let (source_entity, source_id) = source?;
                    if seen.insert(node_id(&source_entity, source_id)) {
                        queue.push_back((source_entity, source_id));
                    }
                }
            }
            victims
        };

        for (victim_entity, victim_id) in &victims {
            delete_node_rows(&tx, victim_entity, *victim_id)?;
        }
        ctx.check()?;
        tx.commit()?;

        let mut deleted = Vec::with_capacity(victims.len());
        for (victim_entity, victim_id) in victims {
            self.graph_remove(&victim_entity, victim_id);
            deleted.push(node_id(&victim_entity, victim_id));
        }
        Ok(deleted)
    }

    fn as_searcher(&self) -> Option<&dyn Searcher> {
        Some(self)
    }

    fn as_batcher(&self) -> Option<&dyn Batcher> {
        Some(self)
    }

    fn as_graph_neighbors(&self) -> Option<&dyn GraphNeighbors> {
        Some(self)
    }

    fn as_graph_integrity(&self) -> Option<&dyn GraphIntegrity> {
        Some(self)
    }
}

impl Searcher for SqliteStore {
    /// `json_extract` predicate over `data_json`, cast to TEXT so non-string
    /// values compare by their stringified form.
    fn search(
        &self,
        ctx: &CancelToken,
        entity: &str,
        field: &str,
        query: &str,
        mode: MatchMode,
    ) -> Result<Vec<Document>> {
        validate_entity_name(entity)?;
        ctx.check()?;

        let (predicate, pattern) = match mode {
            MatchMode::Exact => ("= ?3", query.to_string()),
            MatchMode::Contains => ("LIKE ?3", format!("%{query}%")),
            MatchMode::Starts => ("LIKE ?3", format!("{query}%")),
            MatchMode::Ends => ("LIKE ?3", format!("%{query}")),
        };
        let sql = format!(
            "SELECT data_json FROM entities
             WHERE entity_type = ?1
               AND LOWER(CAST(json_extract(data_json, '$.' || ?2) AS TEXT)) {predicate}
             ORDER BY id"
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![entity, field, pattern.to_lowercase()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut docs = Vec::new();
        for row in rows {
            docs.push(serde_json::from_str(&row?)?);
        }
        Ok(docs)
    }
}

impl Batcher for SqliteStore {
    /// One transaction for the whole batch; ids are allocated in order.
    fn batch_create(
        &self,
        ctx: &CancelToken,
        entity: &str,
        items: Vec<Document>,
    ) -> Result<Vec<i64>> {
        validate_entity_name(entity)?;
        ctx.check()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut created = Vec::with_capacity(items.len());
        for mut doc in items {
            let id = allocate_id(&tx, entity)?;
            doc.insert("id".to_string(), Value::from(id));
            tx.execute(
                "INSERT INTO entities (entity_type, id, data_json) VALUES (?1, ?2, ?3)",
                params![entity, id, serde_json::to_string(&doc)?],
            )?;
            sync_edges(&tx, entity, id, &doc)?;
            created.push((id, doc));
        }
        ctx.check()?;
        tx.commit()?;

        let mut ids = Vec::with_capacity(created.len());
        for (id, doc) in created {
            self.graph_update(entity, id, &doc);
            ids.push(id);
        }
        Ok(ids)
    }

    /// Deletes the ids that exist; missing ids are not an error.
    fn batch_delete(&self, ctx: &CancelToken, entity: &str, ids: &[i64]) -> Result<()> {
        validate_entity_name(entity)?;
        ctx.check()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for &id in ids {
            delete_node_rows(&tx, entity, id)?;
        }
        ctx.check()?;
        tx.commit()?;

        for &id in ids {
            self.graph_remove(entity, id);
        }
        Ok(())
    }
}

impl GraphNeighbors for SqliteStore {
    fn neighbors_of(
        &self,
        ctx: &CancelToken,
        entity: &str,
        id: i64,
        direction: Direction,
    ) -> Result<Vec<Document>> {
        validate_entity_name(entity)?;
        ctx.check()?;

        let sql = match direction {
            Direction::Out => {
                "SELECT e.entity_type, e.data_json, g.relationship
                 FROM graph_edges g
                 JOIN entities e ON e.entity_type = g.target_entity AND e.id = g.target_id
                 WHERE g.source_entity = ?1 AND g.source_id = ?2
                 ORDER BY e.entity_type, e.id"
            }
            Direction::In => {
                "SELECT e.entity_type, e.data_json, g.relationship
                 FROM graph_edges g
                 JOIN entities e ON e.entity_type = g.source_entity AND e.id = g.source_id
                 WHERE g.target_entity = ?1 AND g.target_id = ?2
                 ORDER BY e.entity_type, e.id"
            }
        };

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![entity, id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (neighbor_type, data, relationship) = row?;
            let mut doc: Document = serde_json::from_str(&data)?;
            doc.insert("_neighbor_type".to_string(), Value::from(neighbor_type));
            doc.insert("_relationship".to_string(), Value::from(relationship));
            doc.insert("_direction".to_string(), Value::from(direction.as_str()));
            results.push(doc);
        }
        Ok(results)
    }
}

impl GraphIntegrity for SqliteStore {
    /// Diffs the edge set implied by the stored documents against the
    /// `graph_edges` table. Any difference is an integrity failure; dangling
    /// targets are warned about only.
    fn audit(&self, ctx: &CancelToken) -> Result<()> {
        ctx.check()?;
        let conn = self.conn.lock();

        let mut expected: BTreeSet<(String, i64, String, i64, String)> = BTreeSet::new();
        let mut nodes: BTreeSet<String> = BTreeSet::new();
        {
            let mut stmt = conn.prepare("SELECT entity_type, id, data_json FROM entities")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (entity, id, data) = row?;
                nodes.insert(node_id(&entity, id));
                let doc: Document = match serde_json::from_str(&data) {
                    Ok(doc) => doc,
                    Err(err) => {
                        warn!(entity = %entity, id, error = %err, "skipping unreadable row");
                        continue;
                    }
                };
                for (field, reference) in extract_references(&doc) {
                    expected.insert((entity.clone(), id, reference.entity, reference.id, field));
                }
            }
        }

        let mut actual: BTreeSet<(String, i64, String, i64, String)> = BTreeSet::new();
        {
            let mut stmt = conn.prepare(
                "SELECT source_entity, source_id, target_entity, target_id, relationship
                 FROM graph_edges",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            for row in rows {
                actual.insert(row?);
            }
        }

        for (source_entity, source_id, target_entity, target_id, relationship) in &expected {
            if !nodes.contains(&node_id(target_entity, *target_id)) {
                warn!(
                    source = %node_id(source_entity, *source_id),
                    target = %node_id(target_entity, *target_id),
                    relationship = %relationship,
                    "dangling reference"
                );
            }
        }

        if let Some(edge) = expected.difference(&actual).next() {
            return Err(StoreError::Integrity(format!("missing edge {edge:?}")));
        }
        if let Some(edge) = actual.difference(&expected).next() {
            return Err(StoreError::Integrity(format!("unexpected edge {edge:?}")));
        }
        Ok(())
    }

    /// Drops and regenerates `graph_edges` from the stored documents, then
    /// rebuilds the in-memory graph the same way.
    fn rebuild(&self, ctx: &CancelToken) -> Result<()> {
        ctx.check()?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM graph_edges", [])?;

        let mut documents = Vec::new();
        {
            let mut stmt = tx.prepare("SELECT entity_type, id, data_json FROM entities")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (entity, id, data) = row?;
                match serde_json::from_str::<Document>(&data) {
                    Ok(doc) => documents.push((entity, id, doc)),
                    Err(err) => warn!(entity = %entity, id, error = %err, "skipping unreadable row"),
                }
            }
        }
        for (entity, id, doc) in &documents {
            for (field, reference) in extract_references(doc) {
                tx.execute(
                    "INSERT INTO graph_edges (source_entity, source_id, target_entity, target_id, relationship)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![entity, id, reference.entity, reference.id, field],
                )?;
            }
        }
        ctx.check()?;
        tx.commit()?;

        if let Some(graph) = &self.graph {
            graph.clear();
            for (entity, id, doc) in &documents {
                graph.update_from_document(entity, *id, doc);
            }
        }
        Ok(())
    }
}
