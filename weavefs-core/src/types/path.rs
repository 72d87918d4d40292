//! Virtual path normalization.
//!
//! A [`VirtualPath`] is the comparable key used to route lookups through the
//! virtual tree. Both `/` and `\` separate segments, empty segments are
//! dropped and every segment keeps its original spelling for display next to a
//! case-folded key used for comparison.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, VfsError};

/// Case-folds a single name the way the virtual tree compares names.
pub fn fold_name(name: &str) -> String {
    name.to_lowercase()
}

/// One component of a [`VirtualPath`].
#[derive(Debug, Clone)]
pub struct PathSegment {
    name: String,
    key: String,
}

impl PathSegment {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            key: fold_name(name),
        }
    }

    /// Original spelling of the segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Case-folded comparison key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl PartialEq for PathSegment {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PathSegment {}

impl std::hash::Hash for PathSegment {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// A normalized, case-insensitive path into the virtual namespace.
///
/// Two paths compare equal iff their folded segment sequences are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualPath {
    segments: Vec<PathSegment>,
}

impl VirtualPath {
    /// The virtual filesystem root.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Parses a path, rejecting unresolved `.` and `..` components.
    ///
    /// # Arguments
    /// * `raw` - Path using `/` or `\` separators, optionally drive-prefixed
    ///
    /// # Returns
    /// The normalized path, or `InvalidPath` if a component cannot be represented
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for part in Self::split(raw) {
            if part == "." || part == ".." {
                return Err(VfsError::InvalidPath {
                    path: raw.to_string(),
                    reason: format!("unresolved relative component '{}'", part),
                });
            }
            Self::validate_segment(raw, part)?;
            segments.push(PathSegment::new(part));
        }
        Ok(Self { segments })
    }

    /// Parses a path after lexically collapsing `.` and `..` components.
    ///
    /// A `..` that would climb above the root is an error rather than being
    /// silently dropped.
    pub fn parse_collapsed(raw: &str) -> Result<Self> {
        let mut segments: Vec<PathSegment> = Vec::new();
        for part in Self::split(raw) {
            match part {
                "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(VfsError::InvalidPath {
                            path: raw.to_string(),
                            reason: "'..' escapes the root".to_string(),
                        });
                    }
                }
                _ => {
                    Self::validate_segment(raw, part)?;
                    segments.push(PathSegment::new(part));
                }
            }
        }
        Ok(Self { segments })
    }

    /// Parses a host path, collapsing relative components.
    pub fn from_host_path(path: &Path) -> Result<Self> {
        Self::parse_collapsed(&path.to_string_lossy())
    }

    fn split(raw: &str) -> impl Iterator<Item = &str> {
        let trimmed = raw
            .strip_prefix(r"\\?\")
            .or_else(|| raw.strip_prefix(r"\??\"))
            .unwrap_or(raw);
        trimmed.split(['/', '\\']).filter(|part| !part.is_empty())
    }

    fn validate_segment(raw: &str, part: &str) -> Result<()> {
        if part.contains('\0') {
            return Err(VfsError::InvalidPath {
                path: raw.to_string(),
                reason: "contains a NUL character".to_string(),
            });
        }
        Ok(())
    }

    /// Returns true for the virtual root.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments (the depth below the root).
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// All segments, root first.
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Folded keys, root first.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(PathSegment::key)
    }

    /// The last segment's original spelling.
    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(PathSegment::name)
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<VirtualPath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Appends a single name to the path.
    pub fn join(&self, name: &str) -> Result<VirtualPath> {
        let child = Self::parse(name)?;
        if child.depth() != 1 {
            return Err(VfsError::InvalidPath {
                path: name.to_string(),
                reason: "expected a single path segment".to_string(),
            });
        }
        let mut segments = self.segments.clone();
        segments.extend(child.segments);
        Ok(Self { segments })
    }

    /// Appends already-normalized segments to the path.
    pub fn join_segments(&self, tail: &[PathSegment]) -> VirtualPath {
        let mut segments = self.segments.clone();
        segments.extend_from_slice(tail);
        Self { segments }
    }

    /// Returns true if `prefix` is this path or one of its ancestors.
    pub fn starts_with(&self, prefix: &VirtualPath) -> bool {
        prefix.segments.len() <= self.segments.len()
            && prefix
                .segments
                .iter()
                .zip(self.segments.iter())
                .all(|(a, b)| a == b)
    }

    /// Returns the segments remaining after `prefix`.
    pub fn strip_prefix(&self, prefix: &VirtualPath) -> Option<&[PathSegment]> {
        if self.starts_with(prefix) {
            Some(&self.segments[prefix.segments.len()..])
        } else {
            None
        }
    }

    /// Converts the path back into a host path.
    ///
    /// A leading drive segment (`C:`) becomes the drive root; otherwise the path
    /// is anchored at the host root.
    pub fn to_host_path(&self) -> PathBuf {
        let (mut path, rest) = match self.segments.first() {
            Some(first) if is_drive(first.name()) => (
                PathBuf::from(format!("{}{}", first.name(), std::path::MAIN_SEPARATOR)),
                &self.segments[1..],
            ),
            _ => (
                PathBuf::from(std::path::MAIN_SEPARATOR.to_string()),
                &self.segments[..],
            ),
        };
        for segment in rest {
            path.push(segment.name());
        }
        path
    }
}

fn is_drive(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rest = match self.segments.first() {
            None => return write!(f, "/"),
            Some(first) if is_drive(first.name()) => {
                write!(f, "{}", first.name())?;
                if self.segments.len() == 1 {
                    return write!(f, "/");
                }
                &self.segments[1..]
            }
            Some(_) => &self.segments[..],
        };
        for segment in rest {
            write!(f, "/{}", segment.name())?;
        }
        Ok(())
    }
}

impl FromStr for VirtualPath {
    type Err = VfsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_equality() {
        let a = VirtualPath::parse("/Game/Data/Textures").unwrap();
        let b = VirtualPath::parse("\\game\\DATA\\textures\\").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "/Game/Data/Textures");
        assert_eq!(b.to_string(), "/game/DATA/textures");
    }

    #[test]
    fn test_rejects_unresolved_components() {
        assert!(matches!(
            VirtualPath::parse("/a/./b"),
            Err(VfsError::InvalidPath { .. })
        ));
        assert!(matches!(
            VirtualPath::parse("/a/../b"),
            Err(VfsError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_collapse() {
        let path = VirtualPath::parse_collapsed("./foo/../bar/./baz").unwrap();
        assert_eq!(path, VirtualPath::parse("/bar/baz").unwrap());
        assert!(VirtualPath::parse_collapsed("/a/../..").is_err());
    }

    #[test]
    fn test_drive_paths() {
        let path = VirtualPath::parse("C:\\Games\\Skyrim").unwrap();
        assert_eq!(path.to_string(), "C:/Games/Skyrim");
        assert_eq!(VirtualPath::parse("c:/").unwrap().to_string(), "c:/");
        assert_eq!(
            VirtualPath::parse(r"\\?\C:\Games").unwrap(),
            VirtualPath::parse("c:/games").unwrap()
        );
    }

    #[test]
    fn test_parent_and_join() {
        let path = VirtualPath::parse("/mnt/sub/b.txt").unwrap();
        let parent = path.parent().unwrap();
        assert_eq!(parent.to_string(), "/mnt/sub");
        assert_eq!(parent.join("B.TXT").unwrap(), path);
        assert!(parent.join("x/y").is_err());
        assert!(VirtualPath::root().parent().is_none());
        assert_eq!(VirtualPath::root().to_string(), "/");
    }

    #[test]
    fn test_strip_prefix() {
        let path = VirtualPath::parse("/a/b/c").unwrap();
        let prefix = VirtualPath::parse("/A").unwrap();
        let rest: Vec<&str> = path
            .strip_prefix(&prefix)
            .unwrap()
            .iter()
            .map(PathSegment::name)
            .collect();
        assert_eq!(rest, vec!["b", "c"]);
        assert!(prefix.strip_prefix(&path).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_to_host_path() {
        let path = VirtualPath::parse("/mnt/sub").unwrap();
        assert_eq!(path.to_host_path(), PathBuf::from("/mnt/sub"));
        assert_eq!(VirtualPath::root().to_host_path(), PathBuf::from("/"));
    }
}
