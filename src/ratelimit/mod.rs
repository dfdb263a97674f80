//! Path-keyed token-bucket rate limiting and its lifecycle.

mod admission;
mod bucket;
mod node;
mod path;
mod reclaimer;
mod snapshot;
mod trie;

pub use admission::{Admission, AdmissionRequest, Decision};
pub use bucket::TokenBucket;
pub use node::{LimitEntry, LockedNode, TrieNode};
pub use path::RoutePath;
pub use reclaimer::{Reclaimer, ReclaimerHandle};
pub use snapshot::SnapshotRecord;
pub use trie::{GcReport, RateLimiterTrie, DEFAULT_STALENESS_THRESHOLD};
