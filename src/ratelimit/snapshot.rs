//! Point-in-time export of limiter state.
//!
//! Snapshots are diagnostic output only. They are never read back to restore
//! live state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use super::node::TrieNode;
use super::path::SEPARATOR;
use crate::error::Result;

/// The state of one terminal node at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// `/`-joined segments from the root, e.g. `/api/login/POST/10.0.0.1`
    pub path: String,
    /// Tokens available when the record was taken
    pub tokens: f64,
    /// Refill rate in tokens per second
    pub rate: f64,
    /// Burst capacity
    pub burst: u32,
    /// Last admission check against this limiter
    pub last_seen: DateTime<Utc>,
}

/// Collect one record per terminal node with a payload, sorted by path.
pub fn collect(root: &TrieNode) -> Vec<SnapshotRecord> {
    let mut records = Vec::new();
    collect_into(root, "", &mut records);
    records.sort_by(|a, b| a.path.cmp(&b.path));
    records
}

fn collect_into(node: &TrieNode, prefix: &str, out: &mut Vec<SnapshotRecord>) {
    let state = node.state.read();

    if state.terminal {
        if let Some(entry) = &state.entry {
            let bucket = entry.bucket();
            out.push(SnapshotRecord {
                path: prefix.to_string(),
                tokens: bucket.tokens(),
                rate: bucket.rate(),
                burst: bucket.burst(),
                last_seen: entry.last_seen(),
            });
        }
    }

    for (segment, child) in &state.children {
        let child_prefix = format!("{}{}{}", prefix, SEPARATOR, segment);
        collect_into(child, &child_prefix, out);
    }
}

/// Serialize `records` as a JSON array and write them to `path`, creating
/// parent directories as needed.
pub fn write_to_file(records: &[SnapshotRecord], path: &Path) -> Result<()> {
    let data = serde_json::to_vec(records)?;

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    std::fs::write(path, data)?;

    debug!(
        path = %path.display(),
        records = records.len(),
        "Snapshot written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> std::sync::Arc<TrieNode> {
        let root = TrieNode::root();
        let (api, _) = root.add_child("api");
        let (login, _) = api.add_child("login");
        login.ensure_entry(5.0, 10);
        let (health, _) = api.add_child("health");
        health.ensure_entry(1.0, 1);
        root
    }

    #[test]
    fn test_collect_terminal_nodes() {
        let root = sample_tree();
        let records = collect(&root);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "/api/health");
        assert_eq!(records[0].rate, 1.0);
        assert_eq!(records[0].burst, 1);
        assert_eq!(records[1].path, "/api/login");
        assert_eq!(records[1].rate, 5.0);
        assert_eq!(records[1].burst, 10);
        assert_eq!(records[1].tokens, 10.0);
    }

    #[test]
    fn test_collect_skips_scaffolding() {
        let root = TrieNode::root();
        let (a, _) = root.add_child("a");
        a.add_child("b");

        assert!(collect(&root).is_empty());
    }

    #[test]
    fn test_write_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/snapshot.json");

        let records = collect(&sample_tree());
        write_to_file(&records, &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<SnapshotRecord> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].path, "/api/login");
        assert_eq!(parsed[1].burst, 10);

        let raw: serde_json::Value = serde_json::from_str(&contents).unwrap();
        let first = &raw[0];
        for field in ["path", "tokens", "rate", "burst", "last_seen"] {
            assert!(first.get(field).is_some(), "missing field {}", field);
        }
    }

    #[test]
    fn test_write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where a directory is expected
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let result = write_to_file(&[], &blocker.join("snapshot.json"));
        assert!(result.is_err());
    }
}
