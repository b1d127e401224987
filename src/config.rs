use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    File,
    Sqlite,
}

/// What `patch` does with an explicit `null` value: keep the field with a
/// null value, or remove the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchNull {
    Store,
    Delete,
}

/// How the ingest layer reacts to a cycle appearing in the graph. The core
/// only exposes `has_cycle`; the policy is carried here for the callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePolicy {
    Warn,
    Error,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageKind,
    pub base_dir: PathBuf,
    pub schema: String,
    pub db_path: PathBuf,
    pub graph_enabled: bool,
    pub graph_data_file: String,
    pub graph_index_file: String,
    pub patch_null: PatchNull,
    pub max_embed_depth: usize,
    pub cascade_delete: bool,
    pub max_cascade_deletions: usize,
    pub cycle_policy: CyclePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageKind::File,
            base_dir: PathBuf::from("data"),
            schema: "default".to_string(),
            db_path: PathBuf::from("grafito.db"),
            graph_enabled: true,
            graph_data_file: "graph.data".to_string(),
            graph_index_file: "graph.index".to_string(),
            patch_null: PatchNull::Store,
            max_embed_depth: 10,
            cascade_delete: false,
            max_cascade_deletions: 10_000,
            cycle_policy: CyclePolicy::Warn,
        }
    }
}

impl Config {
    /// Default configuration overridden by recognised environment variables.
    /// Unknown or unparseable values leave the default in place.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(val) = env::var("STORAGE_TYPE") {
            match val.as_str() {
                "file" | "jsonfile" => cfg.storage = StorageKind::File,
                "sqlite" => cfg.storage = StorageKind::Sqlite,
                _ => {}
            }
        }
        if let Ok(val) = env::var("BASE_DIR") {
            cfg.base_dir = PathBuf::from(val);
        }
        if let Ok(val) = env::var("SCHEMA_NAME") {
            cfg.schema = val;
        }
        if let Ok(val) = env::var("DB_PATH") {
            cfg.db_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("GRAPH_ENABLED") {
            cfg.graph_enabled = parse_bool(&val);
        }
        if let Ok(val) = env::var("PATCH_NULL") {
            match val.as_str() {
                "store" => cfg.patch_null = PatchNull::Store,
                "delete" => cfg.patch_null = PatchNull::Delete,
                _ => {}
            }
        }
        if let Ok(val) = env::var("REF_EMBED_DEPTH") {
            if let Ok(depth) = val.parse() {
                cfg.max_embed_depth = depth;
            }
        }
        if let Ok(val) = env::var("CASCADING_DELETE") {
            cfg.cascade_delete = parse_bool(&val);
        }
        if let Ok(val) = env::var("MAX_CASCADE_DELETIONS") {
            if let Ok(max) = val.parse() {
                cfg.max_cascade_deletions = max;
            }
        }
        if let Ok(val) = env::var("GRAPH_CYCLE_DETECTION") {
            match val.as_str() {
                "warn" => cfg.cycle_policy = CyclePolicy::Warn,
                "error" => cfg.cycle_policy = CyclePolicy::Error,
                "ignore" => cfg.cycle_policy = CyclePolicy::Ignore,
                _ => {}
            }
        }
        cfg
    }

    /// Path of the serialised adjacency file for the file backend.
    pub fn graph_data_path(&self) -> PathBuf {
        self.base_dir.join(&self.graph_data_file)
    }

    /// Path of the serialised type/relationship index for the file backend.
    pub fn graph_index_path(&self) -> PathBuf {
        self.base_dir.join(&self.graph_index_file)
    }
}

fn parse_bool(val: &str) -> bool {
    matches!(val.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}
