//! Tree paths
//!
//! A [`TreePath`] is the slash-delimited location of a node relative to the
//! root of the tree being migrated. It is the key shared by the staged
//! archive, the path index and the checkpoint ledger, so it has to be stable:
//! a source name is sanitized exactly once, when it first becomes a path
//! segment, and everything downstream works with the sanitized form.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Characters that break a path segment on at least one platform.
pub const PATH_BREAKING_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

const SEPARATOR: char = '/';

/// Replace every path-breaking character in a display name with `_`.
///
/// Names that would still be special to a filesystem (`""`, `.`, `..`) get a
/// leading `_` so they land as ordinary entries.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if PATH_BREAKING_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => format!("_{}", cleaned),
        _ => cleaned,
    }
}

/// Relative, sanitized location of a node inside a migrated tree.
///
/// The empty path is the tree root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreePath(String);

impl TreePath {
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Extend the path with a raw source name, sanitizing it.
    pub fn child(&self, raw_name: &str) -> Self {
        self.join_segment(&sanitize_name(raw_name))
    }

    /// Extend the path with a segment that was already sanitized, e.g. a
    /// file name read back from the staging directory.
    pub fn join_staged(&self, segment: &str) -> Self {
        self.join_segment(segment)
    }

    fn join_segment(&self, segment: &str) -> Self {
        if self.0.is_empty() {
            Self(segment.to_string())
        } else {
            Self(format!("{}{}{}", self.0, SEPARATOR, segment))
        }
    }

    /// Rebuild a path from its string form (ledger lines, index keys).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR).filter(|s| !s.is_empty())
    }

    /// The last segment, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments().last()
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Split `name.ext` into `("name", ".ext")`; dotfiles have no extension.
pub(crate) fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(idx) => name.split_at(idx),
    }
}
