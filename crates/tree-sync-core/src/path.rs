//! NodePath: Key of a node in the tree replica.
//!
//! Stored as a sequence of segments but written on the wire as a
//! `/`-separated string (e.g. `"/notes/today.md"`).

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Path of a node in the replica.
///
/// Empty segments are dropped when parsing, so `"/a//b/"` and `"a/b"`
/// name the same node. The root is the empty path.
///
/// # Examples
/// ```
/// use tree_sync_core::NodePath;
///
/// let path = NodePath::from("/notes//today.md");
/// assert_eq!(path.to_string(), "/notes/today.md");
/// assert_eq!(path.name(), Some("today.md"));
/// assert_eq!(path.parent(), Some(NodePath::from("/notes")));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodePath(Vec<String>);

impl NodePath {
    /// The root path (no segments).
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Last segment, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Parent path, or `None` for the root.
    pub fn parent(&self) -> Option<NodePath> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Append a single segment.
    pub fn join(&self, segment: &str) -> NodePath {
        let mut segments = self.0.clone();
        segments.extend(
            segment
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
        Self(segments)
    }

    /// Whether `self` is `other` or lies underneath it.
    pub fn starts_with(&self, other: &NodePath) -> bool {
        self.0.starts_with(&other.0)
    }

    /// Replace the `from` prefix with `to`. Returns `None` if `from` is not a prefix.
    pub fn rebase(&self, from: &NodePath, to: &NodePath) -> Option<NodePath> {
        let rest = self.0.strip_prefix(from.0.as_slice())?;
        let mut segments = to.0.clone();
        segments.extend(rest.iter().cloned());
        Some(Self(segments))
    }

    /// All proper ancestors, outermost first, excluding the root.
    pub fn ancestors(&self) -> impl Iterator<Item = NodePath> + '_ {
        (1..self.0.len()).map(|len| Self(self.0[..len].to_vec()))
    }
}

impl Display for NodePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl From<&str> for NodePath {
    fn from(s: &str) -> Self {
        Self(
            s.split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

impl From<String> for NodePath {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl FromStr for NodePath {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

// Serialize as the `/`-joined string used on the wire
impl serde::Serialize for NodePath {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for NodePath {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(Self::from(s))
    }
}
