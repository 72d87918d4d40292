//! Enumeration of a real source directory for static directory links.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, VfsError};
use crate::rules::RuleRegistry;
use crate::tree::NodeKind;
use crate::types::{fold_name, VirtualPath};

/// One entry found below a source directory.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEntry {
    /// Path relative to the source root, in the virtual namespace
    pub relative: VirtualPath,
    pub kind: NodeKind,
    /// Real path of the entry
    pub source: PathBuf,
}

/// Entries of a source directory keyed by their folded relative segments.
///
/// The key order puts every directory before its descendants, which is the
/// order links have to be applied in; iterating in reverse gives the order
/// removals have to be applied in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceListing {
    entries: BTreeMap<Vec<String>, SourceEntry>,
}

impl SourceListing {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &[String]) -> Option<&SourceEntry> {
        self.entries.get(key)
    }

    /// Entries with their keys, parents first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&Vec<String>, &SourceEntry)> {
        self.entries.iter()
    }

    /// Entries, parents first.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &SourceEntry> {
        self.entries.values()
    }

    /// Returns the entry previously stored under the same folded key.
    fn insert(&mut self, entry: SourceEntry) -> Option<SourceEntry> {
        let key = entry.relative.keys().map(str::to_string).collect();
        self.entries.insert(key, entry)
    }
}

/// Result of scanning a source directory.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub listing: SourceListing,
    /// Real paths of entries omitted because they matched a skip rule or
    /// could not be read
    pub skipped: Vec<PathBuf>,
}

/// Enumerates `root`, applying the skip lists of `rules`.
///
/// Without `recursive` only the immediate entries are listed; subdirectories
/// appear as entries but are not descended into. Siblings are visited in
/// folded-name order, ties broken by the raw name, so repeated scans of the
/// same layout are identical. Names that differ only in case fold to one
/// entry; the one sorting last wins.
///
/// Entries that cannot be read are logged, recorded as skipped and left out.
///
/// # Arguments
/// * `root` - Source directory, must exist
/// * `recursive` - Whether to descend into subdirectories
/// * `rules` - Skip lists to apply
pub fn scan_source(root: &Path, recursive: bool, rules: &RuleRegistry) -> Result<ScanResult> {
    if !root.is_dir() {
        return Err(VfsError::PathNotFound {
            path: root.display().to_string(),
        });
    }

    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by(|a, b| {
            fold_name(&a.file_name().to_string_lossy())
                .cmp(&fold_name(&b.file_name().to_string_lossy()))
                .then_with(|| a.file_name().cmp(b.file_name()))
        });
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut result = ScanResult::default();
    let mut entries = walker.into_iter();
    while let Some(entry) = entries.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // The walk carries on with the next sibling of the failed entry.
                let path = e.path().unwrap_or(root).to_path_buf();
                warn!(path = %path.display(), error = %e, "Cannot read source entry, leaving it out");
                result.skipped.push(path);
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().is_dir()
            || (entry.path_is_symlink() && entry.path().is_dir());

        let skip = if is_dir {
            rules.should_skip_directory(&name)
        } else {
            rules.should_skip_file(&name)
        };
        if skip {
            debug!(path = %entry.path().display(), "Skipping entry matched by skip rule");
            result.skipped.push(entry.path().to_path_buf());
            if entry.file_type().is_dir() {
                entries.skip_current_dir();
            }
            continue;
        }

        let relative = match relative_virtual_path(root, entry.path()) {
            Some(relative) => relative,
            None => {
                warn!(path = %entry.path().display(), "Entry name cannot be represented as a virtual path");
                if entry.file_type().is_dir() {
                    entries.skip_current_dir();
                }
                continue;
            }
        };

        let replaced = result.listing.insert(SourceEntry {
            relative,
            kind: if is_dir { NodeKind::Directory } else { NodeKind::File },
            source: entry.path().to_path_buf(),
        });
        if let Some(replaced) = replaced {
            warn!(
                kept = %entry.path().display(),
                dropped = %replaced.source.display(),
                "Source names differ only in case"
            );
        }
    }

    Ok(result)
}

fn relative_virtual_path(root: &Path, path: &Path) -> Option<VirtualPath> {
    let relative = path.strip_prefix(root).ok()?;
    let mut virtual_path = VirtualPath::root();
    for component in relative.components() {
        virtual_path = virtual_path
            .join(&component.as_os_str().to_string_lossy())
            .ok()?;
    }
    Some(virtual_path)
}
