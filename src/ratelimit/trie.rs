//! Path-keyed rate limiter trie with copy-on-write garbage collection.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace};

use super::node::{LimitEntry, LockedNode, TrieNode};
use super::path::RoutePath;
use super::snapshot::{self, SnapshotRecord};
use crate::config::RateLimitingConfig;

/// Inactivity after which a limiter is reclaimed when nothing else is configured.
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(60);

/// Outcome of one garbage collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Nodes copied into the new tree, root included
    pub nodes_cloned: usize,
    /// Terminal nodes reclaimed for inactivity
    pub leaves_pruned: usize,
    /// Records written, or `None` if no snapshot was written
    pub snapshot_records: Option<usize>,
}

/// A concurrent prefix tree mapping key sequences to token buckets.
///
/// Lookups and inserts lock individual nodes of the live tree. Garbage
/// collection builds a pruned copy off to the side and swaps it in
/// atomically, so readers see either the old tree or the new one.
pub struct RateLimiterTrie {
    root: ArcSwap<TrieNode>,
    staleness_threshold: Duration,
}

impl RateLimiterTrie {
    /// Create an empty trie with the default staleness threshold.
    pub fn new() -> Self {
        Self::with_staleness_threshold(DEFAULT_STALENESS_THRESHOLD)
    }

    /// Create an empty trie that reclaims limiters idle for longer than `threshold`.
    pub fn with_staleness_threshold(threshold: Duration) -> Self {
        Self {
            root: ArcSwap::new(TrieNode::root()),
            staleness_threshold: threshold,
        }
    }

    /// Create an empty trie using the staleness threshold from `config`.
    pub fn from_config(config: &RateLimitingConfig) -> Self {
        Self::with_staleness_threshold(config.staleness_threshold())
    }

    /// The configured staleness threshold.
    pub fn staleness_threshold(&self) -> Duration {
        self.staleness_threshold
    }

    /// The current root. Holding it keeps that version of the tree alive.
    pub fn root(&self) -> Arc<TrieNode> {
        self.root.load_full()
    }

    /// Return the leaf for `keys`, creating the path and its limiter if needed.
    ///
    /// `rate` and `burst` are only used when the leaf has no limiter yet; an
    /// existing limiter is never reset. The flag is `true` for exactly the call
    /// that created the limiter.
    pub fn get_or_create<S: AsRef<str>>(
        &self,
        keys: &[S],
        rate: f64,
        burst: u32,
    ) -> (Arc<TrieNode>, bool) {
        let (node, _, created) = self.resolve(&RoutePath::from_keys(keys), rate, burst);
        (node, created)
    }

    /// Like [`get_or_create`](Self::get_or_create), also handing back the
    /// entry that was observed under the leaf's lock.
    pub(crate) fn resolve(
        &self,
        path: &RoutePath,
        rate: f64,
        burst: u32,
    ) -> (Arc<TrieNode>, Arc<LimitEntry>, bool) {
        let node = self.walk(path);
        let (entry, created) = node.ensure_entry(rate, burst);

        if created {
            debug!(
                path = %path,
                rate = rate,
                burst = burst,
                "Creating new rate limiter"
            );
        } else {
            trace!(path = %path, "Reusing rate limiter");
        }

        (node, entry, created)
    }

    /// Register `keys` with a fresh limiter, replacing any existing one.
    pub fn register<S: AsRef<str>>(&self, keys: &[S], rate: f64, burst: u32) -> Arc<TrieNode> {
        let path = RoutePath::from_keys(keys);
        let node = self.walk(&path);
        node.replace_entry(Arc::new(LimitEntry::new(rate, burst)));

        debug!(path = %path, rate = rate, burst = burst, "Registered rate limiter");
        node
    }

    /// Find the terminal node for `keys` without creating anything.
    pub fn match_keys<S: AsRef<str>>(&self, keys: &[S]) -> Option<Arc<TrieNode>> {
        let path = RoutePath::from_keys(keys);
        let mut node = self.root.load_full();
        for segment in path.segments() {
            node = node.find_child(segment)?;
        }

        if node.is_terminal() {
            Some(node)
        } else {
            None
        }
    }

    fn walk(&self, path: &RoutePath) -> Arc<TrieNode> {
        let mut node = self.root.load_full();
        for segment in path.segments() {
            let (child, _) = node.add_child(segment);
            node = child;
        }
        node
    }

    /// Lock every node from the root down to `path` and run `f` on the last one.
    ///
    /// Locks are taken root-to-leaf and released leaf-to-root, also when `f`
    /// panics. Returns `None` without calling `f` when the path does not exist.
    pub fn with_locked_path<R, F>(&self, path: &str, f: F) -> Option<R>
    where
        F: FnOnce(LockedNode<'_>) -> R,
    {
        let path = RoutePath::parse(path);
        self.root.load_full().with_locked_descendant(path.segments(), f)
    }

    /// Remove the node at `path` if it is a terminal node without children.
    ///
    /// Parents left without children stay in place until the next garbage
    /// collection. A concurrent [`get_or_create`](Self::get_or_create) that
    /// reached the node before it was detached may still hand out its limiter;
    /// later lookups build a new node with a full bucket.
    pub fn remove_path(&self, path: &str) -> bool {
        let removed = self
            .with_locked_path(path, |mut locked| {
                if locked.is_terminal() && locked.child_count() == 0 {
                    locked.clear();
                    locked.detach()
                } else {
                    false
                }
            })
            .unwrap_or(false);

        debug!(path = %path, removed = removed, "Remove path");
        removed
    }

    /// A detached deep copy of the current tree.
    pub fn snapshot(&self) -> Arc<TrieNode> {
        let mut cloned = 0;
        self.root.load_full().deep_clone(Weak::new(), &mut cloned)
    }

    /// Snapshot records for every terminal node of the current tree.
    pub fn records(&self) -> Vec<SnapshotRecord> {
        snapshot::collect(&self.snapshot())
    }

    /// Number of terminal nodes in the current tree.
    pub fn leaf_count(&self) -> usize {
        count_terminal(&self.root.load_full())
    }

    /// Reclaim idle limiters, optionally exporting a snapshot to `target` first.
    pub fn gc(&self, write_snapshot: bool, target: &Path) -> GcReport {
        self.gc_at(write_snapshot, target, Utc::now())
    }

    /// Run a garbage collection cycle with staleness measured against `now`.
    ///
    /// The live tree is only read-locked while it is copied. Snapshot export
    /// and pruning work on the copy, which then replaces the root in a single
    /// atomic store. A failed export is logged and does not stop the cycle.
    pub fn gc_at(&self, write_snapshot: bool, target: &Path, now: DateTime<Utc>) -> GcReport {
        let current = self.root.load_full();
        let mut nodes_cloned = 0;
        let copy = current.deep_clone(Weak::new(), &mut nodes_cloned);
        drop(current);

        let snapshot_records = if write_snapshot {
            let records = snapshot::collect(&copy);
            match snapshot::write_to_file(&records, target) {
                Ok(()) => Some(records.len()),
                Err(e) => {
                    error!(
                        path = %target.display(),
                        error = %e,
                        "Failed to write rate limiter snapshot"
                    );
                    None
                }
            }
        } else {
            None
        };

        let mut leaves_pruned = 0;
        copy.prune(self.staleness_threshold, now, &mut leaves_pruned);
        self.root.store(copy);

        let report = GcReport {
            nodes_cloned,
            leaves_pruned,
            snapshot_records,
        };
        info!(
            nodes_cloned = report.nodes_cloned,
            leaves_pruned = report.leaves_pruned,
            snapshot_records = ?report.snapshot_records,
            "Rate limiter garbage collection complete"
        );
        report
    }
}

fn count_terminal(node: &TrieNode) -> usize {
    let state = node.state.read();
    let own = usize::from(state.terminal);
    own + state
        .children
        .values()
        .map(|child| count_terminal(child))
        .sum::<usize>()
}

impl Default for RateLimiterTrie {
    fn default() -> Self {
        Self::new()
    }
}
