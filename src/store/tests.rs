use super::*;
use crate::cancel::CancelToken;
use crate::config::{Config, PatchNull, StorageKind};
use crate::error::StoreError;
use crate::model::Document;
use serde_json::json;
use tempfile::TempDir;

fn ctx() -> CancelToken {
    CancelToken::new()
}

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().expect("document object")
}

fn file_config(dir: &TempDir) -> Config {
    Config {
        base_dir: dir.path().to_path_buf(),
        ..Config::default()
    }
}

fn sqlite_config(dir: &TempDir) -> Config {
    Config {
        storage: StorageKind::Sqlite,
        db_path: dir.path().join("store.db"),
        ..Config::default()
    }
}

fn both_stores(dir: &TempDir) -> Vec<Box<dyn Store>> {
    vec![
        Box::new(FileStore::open(file_config(dir)).expect("open file store")),
        Box::new(SqliteStore::open(sqlite_config(dir)).expect("open sqlite store")),
    ]
}

#[test]
fn create_assigns_sequential_ids() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        for expected in 1..=3 {
            let id = store
                .create(&ctx(), "users", doc(json!({"name": "u"})))
                .expect("create");
            assert_eq!(id, expected);
        }
    }
}

#[test]
fn save_with_id_bumps_the_sequence() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        for _ in 0..3 {
            store
                .create(&ctx(), "users", doc(json!({"name": "u"})))
                .expect("create");
        }
        store
            .save(&ctx(), "users", 100, doc(json!({"name": "D"})))
            .expect("save at explicit id");
        let id = store
            .create(&ctx(), "users", doc(json!({"name": "E"})))
            .expect("create after save");
        assert_eq!(id, 101);
    }
}

#[test]
fn save_below_the_sequence_does_not_lower_it() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        for _ in 0..5 {
            store
                .create(&ctx(), "users", doc(json!({"name": "u"})))
                .expect("create");
        }
        store
            .save(&ctx(), "users", 2, doc(json!({"name": "explicit"})))
            .expect_err("id 2 is taken");
        store
            .save(&ctx(), "users", 7, doc(json!({"name": "explicit"})))
            .expect("id 7 is free");
        // 1..=5 allocated, 7 saved; the next allocation must skip past 7.
        let id = store
            .create(&ctx(), "users", doc(json!({"name": "next"})))
            .expect("create");
        assert_eq!(id, 8);
    }
}

#[test]
fn get_returns_the_stored_document_with_id() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        let id = store
            .create(&ctx(), "users", doc(json!({"name": "Ada"})))
            .expect("create");
        let fetched = store.get(&ctx(), "users", id).expect("get");
        assert_eq!(fetched, doc(json!({"id": 1, "name": "Ada"})));
    }
}

#[test]
fn get_missing_is_not_found() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        assert!(matches!(
            store.get(&ctx(), "users", 42),
            Err(StoreError::NotFound(_))
        ));
    }
}

#[test]
fn update_replaces_the_whole_document() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        let id = store
            .create(&ctx(), "users", doc(json!({"name": "Ada", "email": "a@x"})))
            .expect("create");
        store
            .update(&ctx(), "users", id, doc(json!({"name": "Grace"})))
            .expect("update");
        let fetched = store.get(&ctx(), "users", id).expect("get");
        assert_eq!(fetched, doc(json!({"id": 1, "name": "Grace"})));
    }
}

#[test]
fn update_missing_is_not_found() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        assert!(matches!(
            store.update(&ctx(), "users", 9, doc(json!({"name": "x"}))),
            Err(StoreError::NotFound(_))
        ));
    }
}

#[test]
fn invalid_entity_names_are_rejected() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        for entity in ["", "2users", "users:1", "../etc"] {
            assert!(
                matches!(
                    store.create(&ctx(), entity, doc(json!({"name": "x"}))),
                    Err(StoreError::InvalidInput(_))
                ),
                "entity {entity:?} must be rejected"
            );
        }
    }
}

#[test]
fn patch_with_store_null_policy_keeps_the_field() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        let id = store
            .create(&ctx(), "users", doc(json!({"name": "A", "email": "a@x"})))
            .expect("create");
        store
            .patch(&ctx(), "users", id, doc(json!({"email": null, "age": 30})))
            .expect("patch");
        let fetched = store.get(&ctx(), "users", id).expect("get");
        assert_eq!(
            fetched,
            doc(json!({"id": 1, "name": "A", "email": null, "age": 30}))
        );
    }
}

#[test]
fn patch_with_delete_null_policy_removes_the_field() {
    let dir = TempDir::new().expect("temp dir");
    let stores: Vec<Box<dyn Store>> = vec![
        Box::new(
            FileStore::open(Config {
                patch_null: PatchNull::Delete,
                ..file_config(&dir)
            })
            .expect("open file store"),
        ),
        Box::new(
            SqliteStore::open(Config {
                patch_null: PatchNull::Delete,
                ..sqlite_config(&dir)
            })
            .expect("open sqlite store"),
        ),
    ];
    for store in stores {
        let id = store
            .create(&ctx(), "users", doc(json!({"name": "A", "email": "a@x"})))
            .expect("create");
        store
            .patch(&ctx(), "users", id, doc(json!({"email": null, "age": 30})))
            .expect("patch");
        let fetched = store.get(&ctx(), "users", id).expect("get");
        assert_eq!(fetched, doc(json!({"id": 1, "name": "A", "age": 30})));
    }
}

#[test]
fn patch_with_empty_partial_is_a_noop() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        let id = store
            .create(&ctx(), "users", doc(json!({"name": "A"})))
            .expect("create");
        let before = store.get(&ctx(), "users", id).expect("get before");
        store
            .patch(&ctx(), "users", id, Document::new())
            .expect("empty patch");
        let after = store.get(&ctx(), "users", id).expect("get after");
        assert_eq!(before, after);
    }
}

#[test]
fn patch_ignores_the_id_key() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        let id = store
            .create(&ctx(), "users", doc(json!({"name": "A"})))
            .expect("create");
        store
            .patch(&ctx(), "users", id, doc(json!({"id": 999, "name": "B"})))
            .expect("patch");
        let fetched = store.get(&ctx(), "users", id).expect("get");
        assert_eq!(fetched.get("id").and_then(serde_json::Value::as_i64), Some(1));
        assert!(!store.exists(&ctx(), "users", 999));
    }
}

#[test]
fn delete_removes_document_and_every_edge() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        store
            .create(&ctx(), "users", doc(json!({"name": "M"})))
            .expect("create manager");
        store
            .create(
                &ctx(),
                "users",
                doc(json!({"name": "E", "manager": {"type": "REF", "entity": "users", "id": 1}})),
            )
            .expect("create employee");

        store.delete(&ctx(), "users", 1).expect("delete manager");

        assert!(!store.exists(&ctx(), "users", 1));
        let graph = store.graph().expect("graph enabled");
        assert!(graph.neighbors("users:2").is_empty());
        assert!(graph.incoming("users:1").is_empty());
        // The dangling reference stays in the surviving document.
        let employee = store.get(&ctx(), "users", 2).expect("get employee");
        assert!(employee.contains_key("manager"));
    }
}

#[test]
fn delete_missing_is_not_found() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        assert!(matches!(
            store.delete(&ctx(), "users", 3),
            Err(StoreError::NotFound(_))
        ));
    }
}

#[test]
fn save_on_an_occupied_id_already_exists() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        store
            .save(&ctx(), "users", 5, doc(json!({"name": "A"})))
            .expect("first save");
        assert!(matches!(
            store.save(&ctx(), "users", 5, doc(json!({"name": "B"}))),
            Err(StoreError::AlreadyExists(_))
        ));
    }
}

#[test]
fn list_is_ordered_by_id() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        store
            .save(&ctx(), "users", 20, doc(json!({"name": "b"})))
            .expect("save 20");
        store
            .save(&ctx(), "users", 3, doc(json!({"name": "a"})))
            .expect("save 3");
        store
            .save(&ctx(), "users", 100, doc(json!({"name": "c"})))
            .expect("save 100");

        let ids: Vec<i64> = store
            .list(&ctx(), "users")
            .expect("list")
            .iter()
            .filter_map(|d| d.get("id").and_then(serde_json::Value::as_i64))
            .collect();
        assert_eq!(ids, vec![3, 20, 100]);
    }
}

#[test]
fn list_of_unknown_entity_is_empty() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        assert!(store.list(&ctx(), "ghosts").expect("list").is_empty());
    }
}

#[test]
fn file_list_skips_foreign_and_malformed_files() {
    let dir = TempDir::new().expect("temp dir");
    let store = FileStore::open(file_config(&dir)).expect("open");
    store
        .create(&ctx(), "users", doc(json!({"name": "A"})))
        .expect("create");

    let entity_dir = dir.path().join("default/users");
    std::fs::write(entity_dir.join("2.json"), b"{not json").expect("write broken file");
    std::fs::write(entity_dir.join("notes.txt"), b"ignored").expect("write foreign file");

    let docs = store.list(&ctx(), "users").expect("list survives bad files");
    assert_eq!(docs.len(), 1);
}

#[test]
fn list_entity_types_enumerates_known_types() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        store
            .create(&ctx(), "users", doc(json!({"name": "A"})))
            .expect("create user");
        store
            .create(&ctx(), "teams", doc(json!({"name": "T"})))
            .expect("create team");
        assert_eq!(
            store.list_entity_types(&ctx()).expect("types"),
            vec!["teams".to_string(), "users".to_string()]
        );
    }
}

#[test]
fn references_become_edges_with_metadata() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        store
            .create(&ctx(), "users", doc(json!({"name": "M"})))
            .expect("create manager");
        store
            .create(
                &ctx(),
                "users",
                doc(json!({"name": "E", "manager": {"type": "REF", "entity": "users", "id": 1}})),
            )
            .expect("create employee");

        let neighbors = store.as_graph_neighbors().expect("capability");
        let out = neighbors
            .neighbors_of(&ctx(), "users", 2, Direction::Out)
            .expect("out neighbours");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("name"), Some(&json!("M")));
        assert_eq!(out[0].get("_relationship"), Some(&json!("manager")));
        assert_eq!(out[0].get("_neighbor_type"), Some(&json!("users")));
        assert_eq!(out[0].get("_direction"), Some(&json!("out")));

        let incoming = neighbors
            .neighbors_of(&ctx(), "users", 1, Direction::In)
            .expect("in neighbours");
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].get("name"), Some(&json!("E")));
        assert_eq!(incoming[0].get("_direction"), Some(&json!("in")));
    }
}

#[test]
fn update_replaces_the_edge_set() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        store
            .create(&ctx(), "users", doc(json!({"name": "M"})))
            .expect("create manager");
        store
            .create(
                &ctx(),
                "users",
                doc(json!({"name": "E", "manager": {"type": "REF", "entity": "users", "id": 1}})),
            )
            .expect("create employee");
        store
            .update(
                &ctx(),
                "users",
                2,
                doc(json!({"name": "E", "manager": {"type": "REF", "entity": "users", "id": 99}})),
            )
            .expect("update");

        let graph = store.graph().expect("graph enabled");
        let out = graph.neighbors("users:2");
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("users:99"));
        assert!(graph.incoming("users:1").is_empty());
    }
}

#[test]
fn search_modes_are_case_insensitive() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        store
            .create(&ctx(), "users", doc(json!({"name": "Alice", "age": 30})))
            .expect("create");
        store
            .create(&ctx(), "users", doc(json!({"name": "Alastair"})))
            .expect("create");
        store
            .create(&ctx(), "users", doc(json!({"name": "Bob"})))
            .expect("create");

        let searcher = store.as_searcher().expect("capability");
        let names = |mode: MatchMode, query: &str| -> Vec<String> {
            searcher
                .search(&ctx(), "users", "name", query, mode)
                .expect("search")
                .iter()
                .filter_map(|d| d.get("name").and_then(serde_json::Value::as_str))
                .map(str::to_string)
                .collect()
        };

        assert_eq!(names(MatchMode::Exact, "alice"), vec!["Alice"]);
        assert_eq!(names(MatchMode::Starts, "AL"), vec!["Alice", "Alastair"]);
        assert_eq!(names(MatchMode::Ends, "OB"), vec!["Bob"]);
        assert_eq!(names(MatchMode::Contains, "li"), vec!["Alice"]);
        assert!(names(MatchMode::Exact, "alic").is_empty());

        // Non-string values are compared by their stringified form.
        let by_age = searcher
            .search(&ctx(), "users", "age", "30", MatchMode::Exact)
            .expect("search on number");
        assert_eq!(by_age.len(), 1);

        // Documents without the field never match.
        assert!(searcher
            .search(&ctx(), "users", "missing", "x", MatchMode::Contains)
            .expect("search on absent field")
            .is_empty());
    }
}

#[test]
fn get_embedded_dereferences_up_to_depth() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        store
            .create(&ctx(), "teams", doc(json!({"name": "core"})))
            .expect("create team");
        store
            .create(
                &ctx(),
                "users",
                doc(json!({"name": "M", "team": {"type": "REF", "entity": "teams", "id": 1}})),
            )
            .expect("create manager");
        store
            .create(
                &ctx(),
                "users",
                doc(json!({"name": "E", "manager": {"type": "REF", "entity": "users", "id": 1}})),
            )
            .expect("create employee");

        let embedded = store
            .get_embedded(&ctx(), "users", 2, 2)
            .expect("embed two levels");
        let manager = embedded.get("manager").and_then(|v| v.as_object()).expect("embedded manager");
        assert_eq!(manager.get("name"), Some(&json!("M")));
        let team = manager.get("team").and_then(|v| v.as_object()).expect("embedded team");
        assert_eq!(team.get("name"), Some(&json!("core")));

        // Depth 1 leaves the second level as a reference.
        let shallow = store.get_embedded(&ctx(), "users", 2, 1).expect("embed one level");
        let manager = shallow.get("manager").and_then(|v| v.as_object()).expect("manager");
        assert_eq!(
            manager.get("team"),
            Some(&json!({"type": "REF", "entity": "teams", "id": 1}))
        );

        // Depth 0 returns the document untouched.
        let raw = store.get_embedded(&ctx(), "users", 2, 0).expect("no embedding");
        assert_eq!(
            raw.get("manager"),
            Some(&json!({"type": "REF", "entity": "users", "id": 1}))
        );
    }
}

#[test]
fn get_embedded_retains_missing_targets_and_survives_cycles() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        store
            .create(
                &ctx(),
                "users",
                doc(json!({"name": "A", "friend": {"type": "REF", "entity": "users", "id": 2}})),
            )
            .expect("create a");
        store
            .create(
                &ctx(),
                "users",
                doc(json!({
                    "name": "B",
                    "friend": {"type": "REF", "entity": "users", "id": 1},
                    "ghost": {"type": "REF", "entity": "users", "id": 404}
                })),
            )
            .expect("create b");

        let embedded = store.get_embedded(&ctx(), "users", 1, 5).expect("embed cycle");
        let friend = embedded.get("friend").and_then(|v| v.as_object()).expect("friend");
        assert_eq!(friend.get("name"), Some(&json!("B")));
        assert_eq!(
            friend.get("ghost"),
            Some(&json!({"type": "REF", "entity": "users", "id": 404}))
        );
    }
}

#[test]
fn cascade_deletes_transitive_referrers() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        store
            .create(&ctx(), "docs", doc(json!({"name": "root"})))
            .expect("create root");
        store
            .create(
                &ctx(),
                "docs",
                doc(json!({"name": "child", "parent": {"type": "REF", "entity": "docs", "id": 1}})),
            )
            .expect("create child");
        store
            .create(
                &ctx(),
                "docs",
                doc(json!({"name": "grandchild", "parent": {"type": "REF", "entity": "docs", "id": 2}})),
            )
            .expect("create grandchild");
        store
            .create(&ctx(), "docs", doc(json!({"name": "unrelated"})))
            .expect("create unrelated");

        let deleted = store
            .delete_cascading(&ctx(), "docs", 1)
            .expect("cascade from root");
        assert_eq!(deleted.len(), 3);
        assert!(!store.exists(&ctx(), "docs", 1));
        assert!(!store.exists(&ctx(), "docs", 2));
        assert!(!store.exists(&ctx(), "docs", 3));
        assert!(store.exists(&ctx(), "docs", 4));
    }
}

#[test]
fn cascade_aborts_beyond_the_ceiling_without_deleting() {
    let dir = TempDir::new().expect("temp dir");
    let stores: Vec<Box<dyn Store>> = vec![
        Box::new(
            FileStore::open(Config {
                max_cascade_deletions: 2,
                ..file_config(&dir)
            })
            .expect("open file store"),
        ),
        Box::new(
            SqliteStore::open(Config {
                max_cascade_deletions: 2,
                ..sqlite_config(&dir)
            })
            .expect("open sqlite store"),
        ),
    ];
    for store in stores {
        store
            .create(&ctx(), "docs", doc(json!({"name": "root"})))
            .expect("create root");
        for parent in 1..=2 {
            store
                .create(
                    &ctx(),
                    "docs",
                    doc(json!({"name": "child", "parent": {"type": "REF", "entity": "docs", "id": parent}})),
                )
                .expect("create child");
        }

        assert!(matches!(
            store.delete_cascading(&ctx(), "docs", 1),
            Err(StoreError::CascadeLimit(2))
        ));
        for id in 1..=3 {
            assert!(store.exists(&ctx(), "docs", id), "nothing may be deleted");
        }
    }
}

#[test]
fn cancelled_token_aborts_before_persistence() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        let cancelled = CancelToken::new();
        cancelled.cancel();
        assert!(matches!(
            store.create(&cancelled, "users", doc(json!({"name": "x"}))),
            Err(StoreError::Cancelled)
        ));
        assert!(store.list(&ctx(), "users").expect("list").is_empty());
    }
}

#[test]
fn disabling_the_graph_skips_sync_entirely() {
    let dir = TempDir::new().expect("temp dir");
    let store = FileStore::open(Config {
        graph_enabled: false,
        ..file_config(&dir)
    })
    .expect("open");

    store
        .create(
            &ctx(),
            "users",
            doc(json!({"name": "E", "manager": {"type": "REF", "entity": "users", "id": 1}})),
        )
        .expect("create still works");

    assert!(store.graph().is_none());
    assert!(!dir.path().join("graph.data").exists());
    let neighbors = store.as_graph_neighbors().expect("trait implemented");
    assert!(matches!(
        neighbors.neighbors_of(&ctx(), "users", 1, Direction::Out),
        Err(StoreError::Unsupported(_))
    ));
}

#[test]
fn capability_probes_match_info() {
    let dir = TempDir::new().expect("temp dir");
    for store in both_stores(&dir) {
        let info = store.info();
        assert_eq!(info.supports_search, store.as_searcher().is_some());
        assert_eq!(info.supports_batch, store.as_batcher().is_some());
        assert!(store.as_graph_neighbors().is_some());
        assert!(store.as_graph_integrity().is_some());
    }
}

#[test]
fn sqlite_batch_operations_share_one_transaction() {
    let dir = TempDir::new().expect("temp dir");
    let store = SqliteStore::open(sqlite_config(&dir)).expect("open");
    let batcher = store.as_batcher().expect("capability");

    let ids = batcher
        .batch_create(
            &ctx(),
            "users",
            vec![
                doc(json!({"name": "A"})),
                doc(json!({"name": "B", "peer": {"type": "REF", "entity": "users", "id": 1}})),
                doc(json!({"name": "C"})),
            ],
        )
        .expect("batch create");
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(store.graph().expect("graph").neighbors("users:2").len(), 1);

    batcher
        .batch_delete(&ctx(), "users", &[1, 3, 99])
        .expect("batch delete tolerates missing ids");
    assert!(!store.exists(&ctx(), "users", 1));
    assert!(store.exists(&ctx(), "users", 2));
    assert!(store.graph().expect("graph").neighbors("users:2").is_empty());
}

#[test]
fn file_persistence_survives_reopen() {
    let dir = TempDir::new().expect("temp dir");
    {
        let store = FileStore::open(file_config(&dir)).expect("open");
        store
            .create(&ctx(), "users", doc(json!({"name": "M"})))
            .expect("create manager");
        store
            .create(
                &ctx(),
                "users",
                doc(json!({"name": "E", "manager": {"type": "REF", "entity": "users", "id": 1}})),
            )
            .expect("create employee");
    }

    let store = FileStore::open(file_config(&dir)).expect("reopen");
    let fetched = store.get(&ctx(), "users", 2).expect("get after reopen");
    assert_eq!(fetched.get("name"), Some(&json!("E")));
    let graph = store.graph().expect("graph");
    assert_eq!(graph.neighbors("users:2").len(), 1);
    let id = store
        .create(&ctx(), "users", doc(json!({"name": "F"})))
        .expect("sequence survives reopen");
    assert_eq!(id, 3);
}

#[test]
fn sqlite_persistence_survives_reopen() {
    let dir = TempDir::new().expect("temp dir");
    {
        let store = SqliteStore::open(sqlite_config(&dir)).expect("open");
        store
            .create(&ctx(), "users", doc(json!({"name": "M"})))
            .expect("create manager");
        store
            .create(
                &ctx(),
                "users",
                doc(json!({"name": "E", "manager": {"type": "REF", "entity": "users", "id": 1}})),
            )
            .expect("create employee");
    }

    let store = SqliteStore::open(sqlite_config(&dir)).expect("reopen");
    assert!(store.exists(&ctx(), "users", 2));
    // The in-memory graph is rebuilt from the stored rows.
    let graph = store.graph().expect("graph");
    assert_eq!(graph.incoming("users:1").len(), 1);
    let id = store
        .create(&ctx(), "users", doc(json!({"name": "F"})))
        .expect("sequence survives reopen");
    assert_eq!(id, 3);
}

#[test]
fn sqlite_audit_detects_tampering_and_rebuild_repairs() {
    let dir = TempDir::new().expect("temp dir");
    let store = SqliteStore::open(sqlite_config(&dir)).expect("open");
    store
        .create(&ctx(), "users", doc(json!({"name": "M"})))
        .expect("create manager");
    store
        .create(
            &ctx(),
            "users",
            doc(json!({"name": "E", "manager": {"type": "REF", "entity": "users", "id": 1}})),
        )
        .expect("create employee");

    let integrity = store.as_graph_integrity().expect("capability");
    integrity.audit(&ctx()).expect("fresh store is consistent");

    // Tamper with the edge table through a second connection.
    let raw = rusqlite::Connection::open(dir.path().join("store.db")).expect("second connection");
    raw.execute("DELETE FROM graph_edges", []).expect("drop edges");
    drop(raw);

    assert!(matches!(
        integrity.audit(&ctx()),
        Err(StoreError::Integrity(_))
    ));

    integrity.rebuild(&ctx()).expect("rebuild");
    integrity.audit(&ctx()).expect("consistent after rebuild");
    assert_eq!(store.graph().expect("graph").neighbors("users:2").len(), 1);
}

#[test]
fn file_audit_detects_graph_file_tampering_and_rebuild_repairs() {
    let dir = TempDir::new().expect("temp dir");
    let store = FileStore::open(file_config(&dir)).expect("open");
    store
        .create(&ctx(), "users", doc(json!({"name": "M"})))
        .expect("create manager");
    store
        .create(
            &ctx(),
            "users",
            doc(json!({"name": "E", "manager": {"type": "REF", "entity": "users", "id": 1}})),
        )
        .expect("create employee");

    let integrity = store.as_graph_integrity().expect("capability");
    integrity.audit(&ctx()).expect("fresh store is consistent");

    // Remove the employee's line from graph.data behind the store's back.
    let graph_path = dir.path().join("graph.data");
    let contents = std::fs::read_to_string(&graph_path).expect("read graph file");
    let filtered: String = contents
        .lines()
        .filter(|line| !line.starts_with("users:2:"))
        .map(|line| format!("{line}\n"))
        .collect();
    std::fs::write(&graph_path, filtered).expect("rewrite graph file");

    assert!(matches!(
        integrity.audit(&ctx()),
        Err(StoreError::Integrity(_))
    ));

    integrity.rebuild(&ctx()).expect("rebuild");
    integrity.audit(&ctx()).expect("consistent after rebuild");
}
