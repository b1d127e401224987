use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Result;

use super::IndexedGraph;

/// One line per source node:
/// `<entity>:<id>:<nbr_entity>:<nbr_id>:<rel> ...`, neighbour tokens
/// space-separated, sources without out-edges ending in a bare `:`.
/// Entity names and relationships carry no `:` or whitespace, so tokens
/// split cleanly into entity, id and remainder.
impl IndexedGraph {
    /// Serialises the adjacency to `path` atomically (temp file, fsync,
    /// rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let inner = self.inner.read();
        let tmp = tmp_path(path);
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            for (node, neighbors) in &inner.adjacency {
                let tokens: Vec<String> = neighbors
                    .iter()
                    .map(|(target, relationship)| format!("{target}:{relationship}"))
                    .collect();
                writeln!(writer, "{node}:{}", tokens.join(" "))?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Replaces the in-memory state with the contents of `path`. A missing
    /// file is an empty graph. Empty and malformed lines are skipped with a
    /// warning; loading rebuilds both adjacency directions and the
    /// relationship buckets.
    pub fn load(&self, path: &Path) -> Result<()> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut inner = self.inner.write();
        inner.clear();

        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((source, rest)) = split_source(line) else {
                warn!(line, "skipping malformed graph line");
                continue;
            };
            inner.ensure_node(source);
            for token in rest.split(' ').filter(|t| !t.is_empty()) {
                match split_neighbor(token) {
                    Some((target, relationship)) => {
                        inner.insert_edge(source, target, relationship);
                    }
                    None => warn!(token, "skipping malformed neighbour token"),
                }
            }
        }

        Ok(())
    }

    /// Serialises the type/relationship bucket index as JSON, atomically.
    pub fn save_index(&self, path: &Path) -> Result<()> {
        let inner = self.inner.read();
        let data = serde_json::to_vec_pretty(&inner.index)?;
        let tmp = tmp_path(path);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Replaces the bucket index from `path`; a missing file keeps whatever
    /// the adjacency load reconstructed.
    pub fn load_index(&self, path: &Path) -> Result<()> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let index = serde_json::from_slice(&data)?;
        self.inner.write().index = index;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Splits `entity:id:rest`, returning the `entity:id` source node and the
/// neighbour list remainder. `None` when the line has fewer than two colons
/// or a non-numeric id.
fn split_source(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.splitn(3, ':');
    let entity = parts.next()?;
    let id = parts.next()?;
    let rest = parts.next()?;
    if entity.is_empty() || id.parse::<i64>().is_err() {
        return None;
    }
    Some((&line[..entity.len() + 1 + id.len()], rest))
}

/// Splits a neighbour token `entity:id:relationship` into the target node
/// and the relationship name.
fn split_neighbor(token: &str) -> Option<(&str, &str)> {
    let mut parts = token.splitn(3, ':');
    let entity = parts.next()?;
    let id = parts.next()?;
    let relationship = parts.next()?;
    if entity.is_empty() || relationship.is_empty() || id.parse::<i64>().is_err() {
        return None;
    }
    Some((&token[..entity.len() + 1 + id.len()], relationship))
}
