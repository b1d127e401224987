mod persist;


use std::collections::{BTreeMap, BTreeSet, VecDeque};

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::model::{extract_references, node_id, Document};

/// `node -> (neighbour -> relationship)`. BTreeMaps keep neighbour
/// enumeration deterministic, which path search and persistence rely on.
pub type AdjacencyMap = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Default)]
struct GraphInner {
    adjacency: AdjacencyMap,
    reverse: AdjacencyMap,
    index: BTreeMap<String, Vec<String>>,
}

impl GraphInner {
    fn ensure_node(&mut self, node: &str) {
        if !self.adjacency.contains_key(node) {
            self.adjacency.insert(node.to_string(), BTreeMap::new());
            self.reverse.insert(node.to_string(), BTreeMap::new());
        }
    }

    fn index_insert(&mut self, bucket: &str, node: &str) {
        let nodes = self.index.entry(bucket.to_string()).or_default();
        if !nodes.iter().any(|n| n == node) {
            nodes.push(node.to_string());
        }
    }

    fn insert_edge(&mut self, from: &str, to: &str, relationship: &str) {
        self.ensure_node(from);
        self.ensure_node(to);
        if let Some(neighbors) = self.adjacency.get_mut(from) {
            neighbors.insert(to.to_string(), relationship.to_string());
        }
        if let Some(sources) = self.reverse.get_mut(to) {
            sources.insert(from.to_string(), relationship.to_string());
        }
        self.index_insert(&format!("relationship:{relationship}"), from);
    }

    fn remove_edge(&mut self, from: &str, to: &str) {
        if let Some(neighbors) = self.adjacency.get_mut(from) {
            neighbors.remove(to);
        }
        if let Some(sources) = self.reverse.get_mut(to) {
            sources.remove(from);
        }
    }

    fn remove_node(&mut self, node: &str) {
        if let Some(out) = self.adjacency.remove(node) {
            for target in out.keys() {
                if let Some(sources) = self.reverse.get_mut(target) {
                    sources.remove(node);
                }
            }
        }
        if let Some(incoming) = self.reverse.remove(node) {
            for source in incoming.keys() {
                if let Some(neighbors) = self.adjacency.get_mut(source) {
                    neighbors.remove(node);
                }
            }
        }
        self.index.retain(|_, nodes| {
            nodes.retain(|n| n != node);
            !nodes.is_empty()
        });
    }

    fn out_neighbors(&self, node: &str) -> Vec<String> {
        self.adjacency
            .get(node)
            .map(|neighbors| neighbors.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn clear(&mut self) {
        self.adjacency.clear();
        self.reverse.clear();
        self.index.clear();
    }
}

/// Directed labelled graph derived from stored documents.
///
/// Holds forward and reverse adjacency plus a type/relationship bucket index
/// behind a single readers-writer lock. Queries copy their results out so the
/// lock is released before the caller traverses them.
#[derive(Debug, Default)]
pub struct IndexedGraph {
    inner: RwLock<GraphInner>,
}

impl IndexedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: &str, node_type: Option<&str>) {
        let mut inner = self.inner.write();
        inner.ensure_node(node);
        if let Some(node_type) = node_type.filter(|t| !t.is_empty()) {
            inner.index_insert(node_type, node);
        }
    }

    /// Removes a node together with every edge in which it appears as source
    /// or target, and drops it from all index buckets.
    pub fn remove_node(&self, node: &str) {
        self.inner.write().remove_node(node);
    }

    pub fn add_edge(&self, from: &str, to: &str, relationship: &str) {
        self.inner.write().insert_edge(from, to, relationship);
    }

    pub fn remove_edge(&self, from: &str, to: &str) {
        self.inner.write().remove_edge(from, to);
    }

    pub fn contains(&self, node: &str) -> bool {
        self.inner.read().adjacency.contains_key(node)
    }

    /// Outgoing neighbours of `node` as `neighbour -> relationship`.
    pub fn neighbors(&self, node: &str) -> BTreeMap<String, String> {
        self.inner
            .read()
            .adjacency
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    /// Incoming edges of `node` as `source -> relationship`.
    pub fn incoming(&self, node: &str) -> BTreeMap<String, String> {
        self.inner
            .read()
            .reverse
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    /// Nodes recorded in an index bucket (a node type or
    /// `relationship:<name>`).
    pub fn nodes_in_bucket(&self, bucket: &str) -> Vec<String> {
        self.inner
            .read()
            .index
            .get(bucket)
            .cloned()
            .unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.inner
            .read()
            .adjacency
            .values()
            .map(|neighbors| neighbors.len())
            .sum()
    }

    /// Every edge as `(source, target, relationship)`, source-ordered.
    pub fn edges(&self) -> Vec<(String, String, String)> {
        let inner = self.inner.read();
        inner
            .adjacency
            .iter()
            .flat_map(|(source, neighbors)| {
                neighbors.iter().map(move |(target, relationship)| {
                    (source.clone(), target.clone(), relationship.clone())
                })
            })
            .collect()
    }

    /// Shortest path (in hops) from `from` to `to`, breadth-first over the
    /// outgoing adjacency. `max_depth` bounds the number of edges in the
    /// path. Returns `Ok(None)` when no path exists within the bound and
    /// `NotFound` when either endpoint is absent from the graph.
    pub fn find_path(&self, from: &str, to: &str, max_depth: usize) -> Result<Option<Vec<String>>> {
        let inner = self.inner.read();
        for endpoint in [from, to] {
            if !inner.adjacency.contains_key(endpoint) {
                return Err(StoreError::NotFound(format!("node {endpoint}")));
            }
        }

        let mut queue: VecDeque<Vec<String>> = VecDeque::new();
        queue.push_back(vec![from.to_string()]);
        let mut visited: BTreeSet<String> = BTreeSet::new();
        visited.insert(from.to_string());

        while let Some(path) = queue.pop_front() {
            let current = match path.last() {
                Some(node) => node.clone(),
                None => continue,
            };
            if current == to {
                return Ok(Some(path));
            }
            // The goal test precedes pruning, so a path of exactly
            // max_depth edges is still accepted.
            if path.len() - 1 >= max_depth {
                continue;
            }
            if let Some(neighbors) = inner.adjacency.get(&current) {
                for neighbor in neighbors.keys() {
                    if visited.insert(neighbor.clone()) {
                        let mut next = path.clone();
                        next.push(neighbor.clone());
                        queue.push_back(next);
                    }
                }
            }
        }

        Ok(None)
    }

    /// Depth-first back-edge detection over the outgoing adjacency.
    pub fn has_cycle(&self) -> bool {
        struct Frame {
            node: String,
            neighbors: Vec<String>,
            next: usize,
        }

        let inner = self.inner.read();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut on_stack: BTreeSet<String> = BTreeSet::new();

        for start in inner.adjacency.keys() {
            if visited.contains(start) {
                continue;
            }
            visited.insert(start.clone());
            on_stack.insert(start.clone());
            let mut stack = vec![Frame {
                node: start.clone(),
                neighbors: inner.out_neighbors(start),
                next: 0,
            }];

            while let Some(frame) = stack.last_mut() {
                if frame.next < frame.neighbors.len() {
                    let candidate = frame.neighbors[frame.next].clone();
                    frame.next += 1;
                    if on_stack.contains(&candidate) {
                        return true;
                    }
                    if visited.insert(candidate.clone()) {
                        on_stack.insert(candidate.clone());
                        let neighbors = inner.out_neighbors(&candidate);
                        stack.push(Frame {
                            node: candidate,
                            neighbors,
                            next: 0,
                        });
                    }
                } else {
                    on_stack.remove(&frame.node);
                    stack.pop();
                }
            }
        }

        false
    }

    /// Replace-set sync: makes the out-edge set of `(entity, id)` exactly the
    /// references present in `doc`. Ensures both endpoints exist; indexes the
    /// node under its `type` field when that is a string. Idempotent, and the
    /// same for update and patch since both hand over the merged document.
    pub fn update_from_document(&self, entity: &str, id: i64, doc: &Document) {
        let node = node_id(entity, id);
        let node_type = doc.get("type").and_then(Value::as_str);
        let references = extract_references(doc);

        let mut inner = self.inner.write();
        inner.ensure_node(&node);
        if let Some(node_type) = node_type.filter(|t| !t.is_empty()) {
            inner.index_insert(node_type, &node);
        }

        let stale: Vec<String> = inner.out_neighbors(&node);
        for target in stale {
            inner.remove_edge(&node, &target);
        }
        for (field, reference) in references {
            let target = reference.node_id();
            inner.insert_edge(&node, &target, &field);
        }
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

/// Equality over the logical edge structure; the bucket index is derived
/// state and excluded. Used by persistence round-trip checks.
impl PartialEq for IndexedGraph {
    fn eq(&self, other: &Self) -> bool {
        let a = self.inner.read();
        let b = other.inner.read();
        a.adjacency == b.adjacency && a.reverse == b.reverse
    }
}
