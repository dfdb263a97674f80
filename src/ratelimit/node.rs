//! Trie nodes and their terminal limiter payload.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::bucket::TokenBucket;

/// The payload of a terminal node: a token bucket and the last time it was
/// consulted.
///
/// Entries are shared by reference between the live tree and any clone taken
/// during garbage collection, so `last_seen` is stored atomically and can be
/// refreshed without holding a node lock.
#[derive(Debug)]
pub struct LimitEntry {
    bucket: TokenBucket,
    /// Unix milliseconds of the last admission check
    last_seen_ms: AtomicI64,
}

impl LimitEntry {
    /// Create an entry with a full bucket, seen now.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            bucket: TokenBucket::new(rate, burst),
            last_seen_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    /// The underlying token bucket.
    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// Try to take one token from the bucket.
    pub fn allow(&self) -> bool {
        self.bucket.allow()
    }

    /// Record that the entry was consulted now.
    pub fn touch(&self) {
        self.touch_at(Utc::now());
    }

    /// Record that the entry was consulted at `at`.
    pub fn touch_at(&self, at: DateTime<Utc>) {
        self.last_seen_ms.store(at.timestamp_millis(), Ordering::Relaxed);
    }

    /// When the entry was last consulted.
    pub fn last_seen(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_seen_ms.load(Ordering::Relaxed))
            .unwrap_or_default()
    }

    /// Whether the entry has been idle for longer than `threshold` at `now`.
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        let idle_ms = now.timestamp_millis() - self.last_seen_ms.load(Ordering::Relaxed);
        idle_ms > threshold.as_millis() as i64
    }
}

/// Mutable state of a node, guarded by the node's own lock.
#[derive(Default)]
pub(crate) struct NodeState {
    pub(crate) children: HashMap<String, Arc<TrieNode>>,
    pub(crate) terminal: bool,
    pub(crate) entry: Option<Arc<LimitEntry>>,
}

/// A vertex of the rate limiter trie.
///
/// Each node is owned by its parent's child map (the root by the trie). The
/// parent link is weak and only used for navigation.
pub struct TrieNode {
    key: String,
    parent: Weak<TrieNode>,
    pub(crate) state: RwLock<NodeState>,
}

impl TrieNode {
    /// Create a detached root node.
    pub fn root() -> Arc<Self> {
        Arc::new(Self::new(String::new(), Weak::new()))
    }

    fn new(key: String, parent: Weak<TrieNode>) -> Self {
        Self {
            key,
            parent,
            state: RwLock::new(NodeState::default()),
        }
    }

    /// The segment this node is keyed by. Empty for the root.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The parent node, if this is not a root and the parent is still alive.
    pub fn parent(&self) -> Option<Arc<TrieNode>> {
        self.parent.upgrade()
    }

    /// Whether this node ends a registered key sequence.
    pub fn is_terminal(&self) -> bool {
        self.state.read().terminal
    }

    /// The limiter payload, present only on terminal nodes.
    pub fn entry(&self) -> Option<Arc<LimitEntry>> {
        self.state.read().entry.clone()
    }

    /// Number of direct children.
    pub fn child_count(&self) -> usize {
        self.state.read().children.len()
    }

    /// Segments of the direct children, sorted.
    pub fn child_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.read().children.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Return the child for `segment`, creating a non-terminal one if needed.
    ///
    /// The flag is `true` when this call inserted the child. Creation happens
    /// under this node's write lock, so concurrent callers converge on one
    /// child.
    pub fn add_child(self: &Arc<Self>, segment: &str) -> (Arc<TrieNode>, bool) {
        if let Some(child) = self.find_child(segment) {
            return (child, false);
        }

        let mut state = self.state.write();
        match state.children.entry(segment.to_string()) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(slot) => {
                let child = Arc::new(TrieNode::new(segment.to_string(), Arc::downgrade(self)));
                slot.insert(child.clone());
                (child, true)
            }
        }
    }

    /// Look up a direct child without creating it.
    pub fn find_child(&self, segment: &str) -> Option<Arc<TrieNode>> {
        self.state.read().children.get(segment).cloned()
    }

    /// Detach the child for `segment` if it is a terminal node without
    /// children. Returns whether it was removed.
    pub fn remove_child(&self, segment: &str) -> bool {
        let mut state = self.state.write();
        let is_leaf = match state.children.get(segment) {
            Some(child) => {
                let child_state = child.state.read();
                child_state.terminal && child_state.children.is_empty()
            }
            None => false,
        };

        if is_leaf {
            state.children.remove(segment);
        }
        is_leaf
    }

    /// Mark this node terminal and return its entry, creating the entry from
    /// `rate` and `burst` only if there is none yet.
    pub(crate) fn ensure_entry(&self, rate: f64, burst: u32) -> (Arc<LimitEntry>, bool) {
        let mut state = self.state.write();
        state.terminal = true;
        if let Some(entry) = &state.entry {
            return (entry.clone(), false);
        }

        let entry = Arc::new(LimitEntry::new(rate, burst));
        state.entry = Some(entry.clone());
        (entry, true)
    }

    /// Mark this node terminal with a fresh entry, replacing any previous one.
    pub(crate) fn replace_entry(&self, entry: Arc<LimitEntry>) {
        let mut state = self.state.write();
        state.terminal = true;
        state.entry = Some(entry);
    }

    /// Copy this subtree into freshly allocated nodes.
    ///
    /// Entries are shared, parent links point into the copy. Each source
    /// node is read-locked while its own children are copied.
    pub(crate) fn deep_clone(&self, parent: Weak<TrieNode>, cloned: &mut usize) -> Arc<TrieNode> {
        Arc::new_cyclic(|me| {
            let state = self.state.read();
            let children = state
                .children
                .iter()
                .map(|(segment, child)| (segment.clone(), child.deep_clone(me.clone(), cloned)))
                .collect();
            *cloned += 1;

            TrieNode {
                key: self.key.clone(),
                parent,
                state: RwLock::new(NodeState {
                    children,
                    terminal: state.terminal,
                    entry: state.entry.clone(),
                }),
            }
        })
    }

    /// Drop stale terminal nodes below this one.
    ///
    /// Returns `true` when this node itself should be detached by its parent:
    /// it was a stale leaf, or scaffolding without children. A stale terminal
    /// node that still has live descendants is demoted to scaffolding instead.
    pub(crate) fn prune(&self, threshold: Duration, now: DateTime<Utc>, pruned: &mut usize) -> bool {
        let mut state = self.state.write();
        state
            .children
            .retain(|_, child| !child.prune(threshold, now, pruned));

        if !state.terminal {
            return state.children.is_empty();
        }

        let stale = state
            .entry
            .as_ref()
            .map_or(false, |entry| entry.is_stale(threshold, now));
        if !stale {
            return false;
        }

        *pruned += 1;
        if state.children.is_empty() {
            return true;
        }
        state.terminal = false;
        state.entry = None;
        false
    }

    /// Lock the path below this node top-down and run `f` on its last node.
    ///
    /// This node is locked first, then each node along `segments`, each one
    /// while its parent is still held. Guards live on the recursion stack and
    /// are released leaf-to-root on return and on unwind. Returns `None`
    /// without calling `f` when a segment is missing or `segments` is empty.
    pub(crate) fn with_locked_descendant<R, F>(&self, segments: &[String], f: F) -> Option<R>
    where
        F: FnOnce(LockedNode<'_>) -> R,
    {
        let mut state = self.state.write();
        let (first, rest) = segments.split_first()?;
        let child = state.children.get(first)?.clone();
        descend(&child, &mut state, rest, f)
    }
}

fn descend<R, F>(node: &Arc<TrieNode>, parent: &mut NodeState, rest: &[String], f: F) -> Option<R>
where
    F: FnOnce(LockedNode<'_>) -> R,
{
    let mut state = node.state.write();
    match rest.split_first() {
        None => Some(f(LockedNode {
            node,
            state: &mut *state,
            parent,
        })),
        Some((next, rest)) => {
            let child = state.children.get(next)?.clone();
            descend(&child, &mut state, rest, f)
        }
    }
}

impl std::fmt::Debug for TrieNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("TrieNode")
            .field("key", &self.key)
            .field("terminal", &state.terminal)
            .field("children", &state.children.len())
            .finish()
    }
}

/// A node reached by a locked path walk.
///
/// The node and its parent are both write-locked for as long as this view
/// exists, along with every ancestor up to the root.
pub struct LockedNode<'a> {
    node: &'a Arc<TrieNode>,
    state: &'a mut NodeState,
    parent: &'a mut NodeState,
}

impl LockedNode<'_> {
    /// Whether `other` is the locked node. Takes no lock.
    pub fn is(&self, other: &Arc<TrieNode>) -> bool {
        Arc::ptr_eq(self.node, other)
    }

    /// The locked node's segment.
    pub fn key(&self) -> &str {
        self.node.key()
    }

    /// Whether the node ends a registered key sequence.
    pub fn is_terminal(&self) -> bool {
        self.state.terminal
    }

    /// Number of direct children.
    pub fn child_count(&self) -> usize {
        self.state.children.len()
    }

    /// The limiter payload, if any.
    pub fn entry(&self) -> Option<&Arc<LimitEntry>> {
        self.state.entry.as_ref()
    }

    /// Clear the terminal flag and drop the payload.
    pub fn clear(&mut self) {
        self.state.terminal = false;
        self.state.entry = None;
    }

    /// Remove the node from its parent's child map. Returns whether the
    /// parent still pointed at this node.
    pub fn detach(&mut self) -> bool {
        let key = self.node.key();
        match self.parent.children.get(key) {
            Some(current) if Arc::ptr_eq(current, self.node) => {
                self.parent.children.remove(key);
                true
            }
            _ => false,
        }
    }
}
