//! Route path normalization.

/// Separator between path segments.
pub const SEPARATOR: char = '/';

/// An ordered list of trie segments derived from caller keys.
///
/// Every key is trimmed of leading and trailing separators and then split on
/// the separators it still contains, so `["/api/user/", "GET"]` and the path
/// string `"/api/user/GET"` resolve to the same leaf.
///
/// Key boundaries are not preserved: `["a/b", "c"]` and `["a", "b/c"]` are the
/// same path. Callers whose keys may contain `/`, such as base64 API keys,
/// should encode them first if they must stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutePath {
    segments: Vec<String>,
}

impl RoutePath {
    /// Build a path from an ordered sequence of keys.
    pub fn from_keys<S: AsRef<str>>(keys: &[S]) -> Self {
        if keys.is_empty() {
            return Self::parse("");
        }

        let segments = keys
            .iter()
            .flat_map(|key| split(key.as_ref()))
            .collect();
        Self { segments }
    }

    /// Parse a `/`-separated path string.
    pub fn parse(path: &str) -> Self {
        Self {
            segments: split(path).collect(),
        }
    }

    /// The normalized segments, root first.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether there are no segments. Never true for parsed paths.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Trim outer separators, then split on the inner ones.
///
/// An empty input yields a single empty segment rather than nothing, so a
/// degenerate key never addresses the root itself.
fn split(key: &str) -> impl Iterator<Item = String> + '_ {
    key.trim_matches(SEPARATOR).split(SEPARATOR).map(str::to_string)
}

impl std::fmt::Display for RoutePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for segment in &self.segments {
            write!(f, "{}{}", SEPARATOR, segment)?;
        }
        Ok(())
    }
}
