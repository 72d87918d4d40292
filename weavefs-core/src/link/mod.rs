//! Link resolution engine.
//!
//! Every link operation is split into a planning step, which reads the tree and
//! validates the whole operation, and an application step which mutates it.
//! A plan that validated cleanly applies without failing, so a rejected link
//! leaves the tree exactly as it was.

pub mod scan;

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Result, VfsError};
use crate::tree::{NodeKind, VirtualTree};
use crate::types::{LinkFlags, VirtualPath};

pub use scan::{scan_source, ScanResult, SourceEntry, SourceListing};

/// A single tree mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedOp {
    /// Insert or replace a node
    Link {
        path: VirtualPath,
        kind: NodeKind,
        target: PathBuf,
        flags: LinkFlags,
    },
    /// Set the create-target of an existing directory node
    SetCreateTarget { path: VirtualPath, target: PathBuf },
    /// Remove a node, but only while it still links to `expected_target`.
    /// Children linked from elsewhere survive under an implicit directory.
    Remove {
        path: VirtualPath,
        expected_target: PathBuf,
    },
}

/// Ordered mutations produced by planning a link operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkPlan {
    pub ops: Vec<PlannedOp>,
}

impl LinkPlan {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Counts of what applying a plan changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub linked: usize,
    pub replaced: usize,
    pub removed: usize,
}

/// Plans linking the file `source` to `destination`.
///
/// The destination's parent must exist, either as a directory node in the tree
/// (implicit nodes count) or as a real directory on disk.
pub fn plan_file_link(
    tree: &VirtualTree,
    source: &Path,
    destination: &VirtualPath,
    flags: LinkFlags,
) -> Result<LinkPlan> {
    let parent = destination
        .parent()
        .ok_or_else(|| VfsError::invalid_parameters("the virtual root cannot be linked"))?;

    tree.check_hostable(destination)?;
    match tree.lookup(&parent) {
        Some(node) if node.is_directory() => {}
        Some(_) => {
            return Err(VfsError::NotADirectory {
                path: parent.to_string(),
            })
        }
        None if parent.to_host_path().is_dir() => {}
        None => {
            return Err(VfsError::PathNotFound {
                path: parent.to_string(),
            })
        }
    }

    if flags.contains(LinkFlags::FAIL_IF_EXISTS) && tree.lookup(destination).is_some() {
        return Err(VfsError::AlreadyExists {
            path: destination.to_string(),
        });
    }

    let mut plan = LinkPlan::default();
    plan.ops.push(PlannedOp::Link {
        path: destination.clone(),
        kind: NodeKind::File,
        target: source.to_path_buf(),
        flags,
    });
    if flags.contains(LinkFlags::CREATE_TARGET) {
        let target = match source.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        plan.ops.push(PlannedOp::SetCreateTarget { path: parent, target });
    }
    Ok(plan)
}

/// Plans linking a scanned source directory onto `destination`.
///
/// `scan` must come from [`scan_source`] on `source`. With `FAIL_IF_SKIPPED`
/// any skipped entry rejects the whole operation. With `FAIL_IF_EXISTS` the
/// operation is rejected if the destination is already linked or is a file, or
/// if any file entry would replace an existing node; directory entries merging
/// into existing directories are not collisions.
pub fn plan_directory_link(
    tree: &VirtualTree,
    source: &Path,
    scan: &ScanResult,
    destination: &VirtualPath,
    flags: LinkFlags,
) -> Result<LinkPlan> {
    if destination.is_root() {
        return Err(VfsError::invalid_parameters("the virtual root cannot be linked"));
    }
    if flags.contains(LinkFlags::FAIL_IF_SKIPPED) {
        if let Some(skipped) = scan.skipped.first() {
            return Err(VfsError::SkippedEntry {
                path: skipped.clone(),
            });
        }
    }
    tree.check_hostable(destination)?;

    if flags.contains(LinkFlags::FAIL_IF_EXISTS) {
        check_directory_collisions(tree, scan, destination)?;
    }

    let mut plan = LinkPlan::default();
    plan.ops.push(PlannedOp::Link {
        path: destination.clone(),
        kind: NodeKind::Directory,
        target: source.to_path_buf(),
        flags,
    });
    for entry in scan.listing.entries() {
        plan.ops.push(PlannedOp::Link {
            path: destination.join_segments(entry.relative.segments()),
            kind: entry.kind,
            target: entry.source.clone(),
            flags,
        });
    }
    if flags.contains(LinkFlags::CREATE_TARGET) {
        plan.ops.push(PlannedOp::SetCreateTarget {
            path: destination.clone(),
            target: source.to_path_buf(),
        });
    }
    Ok(plan)
}

fn check_directory_collisions(
    tree: &VirtualTree,
    scan: &ScanResult,
    destination: &VirtualPath,
) -> Result<()> {
    if let Some(existing) = tree.lookup(destination) {
        if !existing.is_directory() || existing.link_target().is_some() {
            return Err(VfsError::AlreadyExists {
                path: destination.to_string(),
            });
        }
    }
    for entry in scan.listing.entries() {
        let path = destination.join_segments(entry.relative.segments());
        let collides = match tree.lookup(&path) {
            Some(node) => entry.kind == NodeKind::File || !node.is_directory(),
            None => false,
        };
        if collides {
            return Err(VfsError::AlreadyExists {
                path: path.to_string(),
            });
        }
    }
    Ok(())
}

/// Computes the mutations that bring a monitored destination from the
/// `previous` listing of its source to the `current` one.
///
/// Removals come first, deepest entries first; additions follow, parents
/// first. Entries present in both listings with the same kind produce nothing.
pub fn plan_listing_diff(
    previous: &SourceListing,
    current: &SourceListing,
    destination: &VirtualPath,
    flags: LinkFlags,
) -> LinkPlan {
    let mut plan = LinkPlan::default();

    for (key, entry) in previous.iter().rev() {
        let gone = match current.get(key) {
            Some(now) => now.kind != entry.kind,
            None => true,
        };
        if gone {
            plan.ops.push(PlannedOp::Remove {
                path: destination.join_segments(entry.relative.segments()),
                expected_target: entry.source.clone(),
            });
        }
    }

    for (key, entry) in current.iter() {
        let added = match previous.get(key) {
            Some(before) => before.kind != entry.kind || before.source != entry.source,
            None => true,
        };
        if added {
            plan.ops.push(PlannedOp::Link {
                path: destination.join_segments(entry.relative.segments()),
                kind: entry.kind,
                target: entry.source.clone(),
                flags,
            });
        }
    }

    plan
}

/// Applies a validated plan.
pub fn apply(tree: &mut VirtualTree, plan: &LinkPlan) -> Result<ApplyOutcome> {
    let mut outcome = ApplyOutcome::default();
    for op in &plan.ops {
        apply_op(tree, op, &mut outcome)?;
    }
    Ok(outcome)
}

/// Applies every op it can, logging the ones that fail.
///
/// Used for monitor-driven updates, which are best effort and never abort.
pub fn apply_best_effort(tree: &mut VirtualTree, plan: &LinkPlan) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    for op in &plan.ops {
        if let Err(e) = apply_op(tree, op, &mut outcome) {
            warn!(error = %e, "Skipping tree update");
        }
    }
    outcome
}

fn apply_op(tree: &mut VirtualTree, op: &PlannedOp, outcome: &mut ApplyOutcome) -> Result<()> {
    match op {
        PlannedOp::Link {
            path,
            kind,
            target,
            flags,
        } => {
            let replaced = tree.link(path, *kind, Some(target.clone()), *flags)?;
            outcome.linked += 1;
            if replaced {
                outcome.replaced += 1;
            }
        }
        PlannedOp::SetCreateTarget { path, target } => {
            tree.set_create_target(path, target.clone())?;
        }
        PlannedOp::Remove {
            path,
            expected_target,
        } => {
            let still_ours = tree
                .lookup(path)
                .and_then(|node| node.link_target())
                .map(|target| target == expected_target.as_path())
                .unwrap_or(false);
            if still_ours {
                outcome.removed += tree.prune(path, expected_target);
            } else {
                debug!(path = %path, "Entry no longer links into the monitored source");
            }
        }
    }
    Ok(())
}
