use std::collections::{BTreeSet, VecDeque};

use serde_json::Value;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::{Result, StoreError};
use crate::graph::IndexedGraph;
use crate::model::{as_reference, node_id, parse_node_id, validate_entity_name, validate_id, Document};

use super::Store;

/// Recursively replaces top-level reference fields with the documents they
/// point at. Missing targets and `depth == 0` retain the reference object;
/// any other fetch failure propagates.
pub(crate) fn embed_document<S: Store + ?Sized>(
    store: &S,
    ctx: &CancelToken,
    doc: Document,
    depth: usize,
) -> Result<Document> {
    if depth == 0 {
        return Ok(doc);
    }
    let mut result = Document::new();
    for (field, value) in doc {
        match as_reference(&value) {
            Some(reference) => {
                ctx.check()?;
                match store.get(ctx, &reference.entity, reference.id) {
                    Ok(target) => {
                        let embedded = embed_document(store, ctx, target, depth - 1)?;
                        result.insert(field, Value::Object(embedded));
                    }
                    Err(StoreError::NotFound(_)) => {
                        result.insert(field, value);
                    }
                    Err(err) => return Err(err),
                }
            }
            None => {
                result.insert(field, value);
            }
        }
    }
    Ok(result)
}

/// Walks the incoming edges of `start` transitively, de-duplicated,
/// returning the set of nodes to delete (the start node first). Exceeding
/// `limit` aborts before anything is deleted.
pub(crate) fn collect_victims(
    graph: &IndexedGraph,
    start: &str,
    limit: usize,
) -> Result<Vec<(String, i64)>> {
    let mut queue = VecDeque::new();
    queue.push_back(start.to_string());
    let mut seen = BTreeSet::new();
    seen.insert(start.to_string());
    let mut victims = Vec::new();

    while let Some(node) = queue.pop_front() {
        victims.push(parse_node_id(&node)?);
        if victims.len() > limit {
            return Err(StoreError::CascadeLimit(limit));
        }
        for source in graph.incoming(&node).into_keys() {
            if seen.insert(source.clone()) {
                queue.push_back(source);
            }
        }
    }

    Ok(victims)
}

/// The default (file-backend) cascade: compute the victim set up front, then
/// delete documents one at a time. Failures after the first deletion leave
/// partial progress behind; each is logged and the walk continues.
pub(crate) fn delete_cascading_best_effort<S: Store + ?Sized>(
    store: &S,
    ctx: &CancelToken,
    entity: &str,
    id: i64,
) -> Result<Vec<String>> {
    validate_entity_name(entity)?;
    validate_id(id)?;
    ctx.check()?;
    if !store.exists(ctx, entity, id) {
        return Err(StoreError::not_found(entity, id));
    }

    let start = node_id(entity, id);
    let victims = match store.graph() {
        Some(graph) => collect_victims(graph, &start, store.config().max_cascade_deletions)?,
        None => vec![(entity.to_string(), id)],
    };

    let mut deleted = Vec::with_capacity(victims.len());
    for (victim_entity, victim_id) in victims {
        ctx.check()?;
        let node = node_id(&victim_entity, victim_id);
        match store.delete(ctx, &victim_entity, victim_id) {
            Ok(()) => deleted.push(node),
            Err(StoreError::NotFound(_)) => {}
            Err(err) => warn!(node = %node, error = %err, "cascade delete failed for node"),
        }
    }
    Ok(deleted)
}
