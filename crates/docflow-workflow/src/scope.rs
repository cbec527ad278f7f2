//! Scope paths
//!
//! Every scope context of an instance is addressed by its path from the
//! project root: `project`, `project/epic:E1`, `project/epic:E1/story:S3`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Name of the root scope; exactly one instance per workflow instance
pub const ROOT_SCOPE: &str = "project";

/// One step down the scope tree: the child scope and the item that created it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeSegment {
    /// Child scope name
    pub scope: String,
    /// Item that created the scope
    pub item_id: String,
}

/// Path from the project root to a scope context
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopePath {
    segments: Vec<ScopeSegment>,
}

impl ScopePath {
    /// The project scope
    #[inline]
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Whether this is the project scope
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Child path for `item_id` in `scope`
    #[must_use]
    pub fn child(&self, scope: impl Into<String>, item_id: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(ScopeSegment {
            scope: scope.into(),
            item_id: item_id.into(),
        });
        Self { segments }
    }

    /// Enclosing path; `None` at the root
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Self { segments })
    }

    /// Scope name of the context this path addresses
    #[must_use]
    pub fn scope_name(&self) -> &str {
        self.segments
            .last()
            .map_or(ROOT_SCOPE, |s| s.scope.as_str())
    }

    /// Item id of the iteration child, `None` at the root
    #[must_use]
    pub fn item_id(&self) -> Option<&str> {
        self.segments.last().map(|s| s.item_id.as_str())
    }

    /// Number of segments below the root
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Segments below the root
    #[must_use]
    pub fn segments(&self) -> &[ScopeSegment] {
        &self.segments
    }

    /// This path followed by each ancestor up to the root
    #[must_use]
    pub fn lineage(&self) -> Vec<ScopePath> {
        let mut out = Vec::with_capacity(self.depth() + 1);
        let mut current = Some(self.clone());
        while let Some(path) = current {
            current = path.parent();
            out.push(path);
        }
        out
    }

    /// Nearest path in the lineage whose scope name is `scope`
    #[must_use]
    pub fn nearest(&self, scope: &str) -> Option<ScopePath> {
        self.lineage().into_iter().find(|p| p.scope_name() == scope)
    }

    /// Strict ancestor check
    #[must_use]
    pub fn is_ancestor_of(&self, other: &ScopePath) -> bool {
        self.depth() < other.depth() && other.segments[..self.depth()] == self.segments[..]
    }
}

impl fmt::Display for ScopePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(ROOT_SCOPE)?;
        for segment in &self.segments {
            write!(f, "/{}:{}", segment.scope, segment.item_id)?;
        }
        Ok(())
    }
}

/// Scope path parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopePathError {
    /// Path not rooted at the project scope
    #[error("scope path must start with 'project': {0}")]
    MissingRoot(String),

    /// Segment not of the form `scope:item`
    #[error("malformed scope segment '{0}', expected scope:item")]
    MalformedSegment(String),
}

impl FromStr for ScopePath {
    type Err = ScopePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        if parts.next() != Some(ROOT_SCOPE) {
            return Err(ScopePathError::MissingRoot(s.to_string()));
        }
        let mut segments = Vec::new();
        for part in parts {
            let (scope, item_id) = part
                .split_once(':')
                .filter(|(scope, item)| !scope.is_empty() && !item.is_empty())
                .ok_or_else(|| ScopePathError::MalformedSegment(part.to_string()))?;
            segments.push(ScopeSegment {
                scope: scope.to_string(),
                item_id: item_id.to_string(),
            });
        }
        Ok(Self { segments })
    }
}

impl Serialize for ScopePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ScopePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn displays_and_parses() {
        let path = ScopePath::root().child("epic", "E1").child("story", "S3");
        assert_eq!(path.to_string(), "project/epic:E1/story:S3");
        assert_eq!("project/epic:E1/story:S3".parse::<ScopePath>().unwrap(), path);
        assert_eq!("project".parse::<ScopePath>().unwrap(), ScopePath::root());
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(
            "epic:E1".parse::<ScopePath>(),
            Err(ScopePathError::MissingRoot(_))
        ));
        assert!(matches!(
            "project/epic".parse::<ScopePath>(),
            Err(ScopePathError::MalformedSegment(_))
        ));
    }

    #[test]
    fn lineage_and_nearest() {
        let story = ScopePath::root().child("epic", "E1").child("story", "S3");
        let names: Vec<String> = story.lineage().iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["project/epic:E1/story:S3", "project/epic:E1", "project"]);
        assert_eq!(story.nearest("epic").unwrap().to_string(), "project/epic:E1");
        assert_eq!(story.nearest(ROOT_SCOPE), Some(ScopePath::root()));
        assert!(story.nearest("feature").is_none());
    }

    #[test]
    fn siblings_are_not_ancestors() {
        let e1 = ScopePath::root().child("epic", "E1");
        let e2 = ScopePath::root().child("epic", "E2");
        assert!(ScopePath::root().is_ancestor_of(&e1));
        assert!(!e1.is_ancestor_of(&e2));
        assert!(!e1.is_ancestor_of(&e1));
        assert!(!e1.child("story", "S1").is_ancestor_of(&e1));
    }

    proptest! {
        #[test]
        fn parse_inverts_display(items in proptest::collection::vec(("[a-z]{1,8}", "[A-Za-z0-9_-]{1,8}"), 0..5)) {
            let mut path = ScopePath::root();
            for (scope, item) in &items {
                path = path.child(scope.clone(), item.clone());
            }
            prop_assert_eq!(path.to_string().parse::<ScopePath>().unwrap(), path);
        }
    }
}
