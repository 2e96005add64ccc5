//! Hierarchical path parsing and relationship checks.
//!
//! Paths address nodes in the key tree: `"users/ewout/posts"` walks object
//! keys, `"songs[3]/title"` walks an array index followed by an object key.
//! The empty path addresses the root node.

use std::fmt;

use crate::error::{ArborError, Result};

/// Characters that cannot appear in a stored key because they carry meaning
/// inside a path expression.
pub const RESERVED_KEY_CHARS: &[char] = &['/', '[', ']', '.', '"', '\''];

/// One segment of a path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathKey {
    /// Named object member.
    Name(String),
    /// Positional array member.
    Index(usize),
}

impl PathKey {
    /// Renders the segment the way it appears inside a path string.
    pub fn to_segment(&self) -> String {
        match self {
            PathKey::Name(name) => name.clone(),
            PathKey::Index(index) => format!("[{index}]"),
        }
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKey::Name(name) => write!(f, "{name}"),
            PathKey::Index(index) => write!(f, "[{index}]"),
        }
    }
}

/// A parsed node path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathInfo {
    keys: Vec<PathKey>,
}

impl PathInfo {
    /// The root path (no segments).
    pub fn root() -> Self {
        Self { keys: Vec::new() }
    }

    /// Parses a path string such as `"users/1"` or `"songs[3]/title"`.
    pub fn parse(path: &str) -> Result<Self> {
        let mut keys = Vec::new();
        if path.is_empty() {
            return Ok(Self { keys });
        }
        for part in path.split('/') {
            if part.is_empty() {
                return Err(ArborError::InvalidArgument(format!(
                    "empty segment in path \"{path}\""
                )));
            }
            let mut rest = part;
            // Leading name before any [index] suffixes.
            if !rest.starts_with('[') {
                let name_end = rest.find('[').unwrap_or(rest.len());
                let name = &rest[..name_end];
                validate_key(name)?;
                keys.push(PathKey::Name(name.to_string()));
                rest = &rest[name_end..];
            }
            while !rest.is_empty() {
                if !rest.starts_with('[') {
                    return Err(ArborError::InvalidArgument(format!(
                        "malformed index in path \"{path}\""
                    )));
                }
                let close = rest.find(']').ok_or_else(|| {
                    ArborError::InvalidArgument(format!("unterminated index in path \"{path}\""))
                })?;
                let index: usize = rest[1..close].parse().map_err(|_| {
                    ArborError::InvalidArgument(format!("non-numeric index in path \"{path}\""))
                })?;
                keys.push(PathKey::Index(index));
                rest = &rest[close + 1..];
            }
        }
        Ok(Self { keys })
    }

    /// Whether this is the root path.
    pub fn is_root(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.keys.len()
    }

    /// The segments of this path.
    pub fn keys(&self) -> &[PathKey] {
        &self.keys
    }

    /// The last segment, if any.
    pub fn key(&self) -> Option<&PathKey> {
        self.keys.last()
    }

    /// Parent path; `None` for the root.
    pub fn parent(&self) -> Option<PathInfo> {
        if self.keys.is_empty() {
            return None;
        }
        Some(PathInfo {
            keys: self.keys[..self.keys.len() - 1].to_vec(),
        })
    }

    /// Path of a direct child of this node.
    pub fn child(&self, key: PathKey) -> PathInfo {
        let mut keys = self.keys.clone();
        keys.push(key);
        PathInfo { keys }
    }

    /// True when `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &PathInfo) -> bool {
        self.keys.len() < other.keys.len() && other.keys[..self.keys.len()] == self.keys[..]
    }

    /// True when `self` is a strict descendant of `other`.
    pub fn is_descendant_of(&self, other: &PathInfo) -> bool {
        other.is_ancestor_of(self)
    }

    /// True when the paths are equal or one contains the other.
    pub fn is_on_trail_of(&self, other: &PathInfo) -> bool {
        self == other || self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }
}

impl fmt::Display for PathInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for key in &self.keys {
            match key {
                PathKey::Name(name) => {
                    if !first {
                        write!(f, "/")?;
                    }
                    write!(f, "{name}")?;
                }
                PathKey::Index(index) => write!(f, "[{index}]")?,
            }
            first = false;
        }
        Ok(())
    }
}

/// Validates a key for storage: non-empty, at most 128 bytes, and free of
/// reserved and control characters.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(ArborError::InvalidArgument("empty key".into()));
    }
    if key.len() > 128 {
        return Err(ArborError::AllocationLimit(format!(
            "key \"{key}\" exceeds 128 bytes"
        )));
    }
    if let Some(ch) = key
        .chars()
        .find(|c| c.is_control() || RESERVED_KEY_CHARS.contains(c))
    {
        return Err(ArborError::InvalidArgument(format!(
            "key \"{key}\" contains reserved character {ch:?}"
        )));
    }
    Ok(())
}
