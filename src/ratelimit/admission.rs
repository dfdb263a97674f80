//! Admission checks for the request layer.
//!
//! The request layer derives an ordered key sequence and the limiter
//! parameters for each unit of work; this module turns those into an
//! allow or limit decision backed by the trie.

use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, trace};

use super::node::LimitEntry;
use super::path::RoutePath;
use super::trie::RateLimiterTrie;
use crate::error::{PathguardError, Result};

/// The limiter keys and parameters for one unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionRequest {
    /// Ordered keys, most general first
    pub keys: Vec<String>,
    /// Refill rate in tokens per second
    pub rate: f64,
    /// Burst capacity
    pub burst: u32,
}

impl AdmissionRequest {
    /// Create a request from explicit keys.
    pub fn new<I, S>(keys: I, rate: f64, burst: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            rate,
            burst,
        }
    }

    /// Create a request keyed by route and method.
    pub fn route(path: &str, method: &str, rate: f64, burst: u32) -> Self {
        Self::new([path, method], rate, burst)
    }

    /// Append a caller-specific key such as a client address or API key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.keys.push(key.into());
        self
    }

    /// Whether the parameters ask for any limiting at all.
    pub fn is_limited(&self) -> bool {
        self.rate.is_finite() && self.rate > 0.0 && self.burst > 0
    }
}

/// Parses `RATE BURST KEY...`, the line format read by the binary.
impl FromStr for AdmissionRequest {
    type Err = PathguardError;

    fn from_str(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();

        let rate = fields
            .next()
            .ok_or_else(|| PathguardError::InvalidRequest("missing rate".to_string()))?;
        let rate: f64 = rate
            .parse()
            .map_err(|e| PathguardError::InvalidRequest(format!("rate {:?}: {}", rate, e)))?;

        let burst = fields
            .next()
            .ok_or_else(|| PathguardError::InvalidRequest("missing burst".to_string()))?;
        let burst: u32 = burst
            .parse()
            .map_err(|e| PathguardError::InvalidRequest(format!("burst {:?}: {}", burst, e)))?;

        let keys: Vec<&str> = fields.collect();
        if keys.is_empty() {
            return Err(PathguardError::InvalidRequest(
                "at least one key is required".to_string(),
            ));
        }

        Ok(Self::new(keys, rate, burst))
    }
}

/// Result of an admission check.
#[derive(Debug, Clone)]
pub enum Decision {
    /// No limit applies to the request
    Unlimited,
    /// A token was taken from the entry
    Allowed(Arc<LimitEntry>),
    /// The entry had no token to spare
    Limited(Arc<LimitEntry>),
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Limited(_))
    }

    /// The limiter consulted, for diagnostics such as remaining tokens.
    pub fn entry(&self) -> Option<&Arc<LimitEntry>> {
        match self {
            Decision::Unlimited => None,
            Decision::Allowed(entry) | Decision::Limited(entry) => Some(entry),
        }
    }
}

/// Admission control backed by a shared [`RateLimiterTrie`].
#[derive(Clone)]
pub struct Admission {
    trie: Arc<RateLimiterTrie>,
}

impl Admission {
    /// Create an admission checker over `trie`.
    pub fn new(trie: Arc<RateLimiterTrie>) -> Self {
        Self { trie }
    }

    /// The trie backing this checker.
    pub fn trie(&self) -> &Arc<RateLimiterTrie> {
        &self.trie
    }

    /// Decide whether the unit of work described by `request` may proceed.
    pub fn check(&self, request: &AdmissionRequest) -> Decision {
        if !request.is_limited() {
            trace!(keys = ?request.keys, "No rate limit configured, skipping");
            return Decision::Unlimited;
        }

        let path = RoutePath::from_keys(&request.keys);
        let (_, entry, _) = self.trie.resolve(&path, request.rate, request.burst);
        entry.touch();

        if entry.allow() {
            trace!(path = %path, "Request admitted");
            Decision::Allowed(entry)
        } else {
            debug!(
                path = %path,
                tokens = entry.bucket().tokens(),
                rate = entry.bucket().rate(),
                burst = entry.bucket().burst(),
                "Rate limit exceeded"
            );
            Decision::Limited(entry)
        }
    }
}
