//! Keeps statically linked directories in sync with their source.
//!
//! A [`DirectoryMonitor`] watches a source directory through a debounced
//! `notify` watcher. Each batch of events triggers a rescan of the source, a
//! diff against the previously recorded listing and a best-effort application
//! of the resulting mutations to the shared tree.

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, VfsError};
use crate::instance::SharedInstance;
use crate::link::{self, ApplyOutcome, SourceListing};
use crate::rules::RuleRegistry;
use crate::stats::VfsStats;
use crate::types::{LinkFlags, VirtualPath};

const DEBOUNCE_TIMEOUT: Duration = Duration::from_millis(200);

struct MonitorInner {
    source: PathBuf,
    destination: VirtualPath,
    flags: LinkFlags,
    rules: RuleRegistry,
    instance: Arc<SharedInstance>,
    stats: Arc<VfsStats>,
    /// Also serializes syncs with `activate` and `stop`.
    listing: Mutex<SourceListing>,
    armed: AtomicBool,
    dirty: AtomicBool,
    detached: AtomicBool,
    stopped: AtomicBool,
}

impl MonitorInner {
    fn sync(&self) -> Result<ApplyOutcome> {
        if self.is_inactive() {
            return Ok(ApplyOutcome::default());
        }
        let mut listing = self.listing.lock();
        if self.is_inactive() {
            return Ok(ApplyOutcome::default());
        }
        if !self.armed.load(Ordering::Acquire) {
            self.dirty.store(true, Ordering::Release);
            return Ok(ApplyOutcome::default());
        }

        if !self.source.is_dir() {
            info!(source = %self.source.display(), destination = %self.destination, "Monitored source removed, detaching");
            self.detached.store(true, Ordering::Release);
            return Ok(ApplyOutcome::default());
        }

        let recursive = self.flags.contains(LinkFlags::RECURSIVE);
        let current = link::scan_source(&self.source, recursive, &self.rules)?.listing;
        let plan = link::plan_listing_diff(&listing, &current, &self.destination, self.flags);
        if plan.is_empty() {
            *listing = current;
            return Ok(ApplyOutcome::default());
        }

        let destination = &self.destination;
        let outcome = self.instance.update_if(|state| {
            let attached = state
                .tree
                .lookup(destination)
                .map(|node| node.is_directory())
                .unwrap_or(false);
            if !attached {
                return (None, false);
            }
            let outcome = link::apply_best_effort(&mut state.tree, &plan);
            let changed = outcome != ApplyOutcome::default();
            (Some(outcome), changed)
        })?;

        match outcome {
            Some(outcome) => {
                *listing = current;
                self.stats.record_monitor_update();
                debug!(
                    destination = %self.destination,
                    linked = outcome.linked,
                    removed = outcome.removed,
                    "Applied monitored changes"
                );
                Ok(outcome)
            }
            None => {
                info!(destination = %self.destination, "Monitored destination no longer in tree, detaching");
                self.detached.store(true, Ordering::Release);
                Ok(ApplyOutcome::default())
            }
        }
    }

    fn is_inactive(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.detached.load(Ordering::Acquire)
    }
}

/// Watcher attached to one static directory link.
pub struct DirectoryMonitor {
    inner: Arc<MonitorInner>,
    debouncer: Option<Debouncer<RecommendedWatcher, RecommendedCache>>,
}

impl std::fmt::Debug for DirectoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryMonitor")
            .field("source", &self.inner.source)
            .field("destination", &self.inner.destination)
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl DirectoryMonitor {
    /// Starts watching `source` for the link that produced `listing`.
    ///
    /// The monitor records changes but leaves the tree alone until
    /// [`DirectoryMonitor::activate`] is called, so it can be attached before
    /// the link itself is applied.
    ///
    /// # Arguments
    /// * `instance` - Instance whose tree receives the updates
    /// * `source` - Real directory that was linked
    /// * `destination` - Virtual directory it was linked onto
    /// * `flags` - Flags of the original link operation
    /// * `rules` - Skip lists as they were when the link was made
    /// * `listing` - Entries linked by the original operation
    pub fn attach(
        instance: Arc<SharedInstance>,
        stats: Arc<VfsStats>,
        source: &Path,
        destination: VirtualPath,
        flags: LinkFlags,
        rules: RuleRegistry,
        listing: SourceListing,
    ) -> Result<Self> {
        let mut monitor = Self::unwatched(instance, stats, source, destination, flags, rules, listing);
        monitor.inner.armed.store(false, Ordering::Release);

        let handler_inner = Arc::clone(&monitor.inner);
        let mut debouncer = new_debouncer(DEBOUNCE_TIMEOUT, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    if events.is_empty() {
                        return;
                    }
                    handler_inner.stats.record_monitor_events(events.len());
                    if let Err(e) = handler_inner.sync() {
                        warn!(source = %handler_inner.source.display(), error = %e, "Failed to apply monitored changes");
                    }
                }
                Err(errors) => {
                    for error in errors {
                        warn!(source = %handler_inner.source.display(), error = %error, "Watcher error");
                    }
                }
            }
        })
        .map_err(|source_error| VfsError::Watch {
            path: source.to_path_buf(),
            source: source_error,
        })?;

        let mode = if flags.contains(LinkFlags::RECURSIVE) {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        debouncer.watch(source, mode).map_err(|source_error| VfsError::Watch {
            path: source.to_path_buf(),
            source: source_error,
        })?;

        info!(source = %source.display(), destination = %monitor.inner.destination, "Monitoring linked directory");
        monitor.debouncer = Some(debouncer);
        Ok(monitor)
    }

    /// Creates a monitor that is only driven through [`DirectoryMonitor::sync_now`].
    pub fn unwatched(
        instance: Arc<SharedInstance>,
        stats: Arc<VfsStats>,
        source: &Path,
        destination: VirtualPath,
        flags: LinkFlags,
        rules: RuleRegistry,
        listing: SourceListing,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                source: source.to_path_buf(),
                destination,
                flags,
                rules,
                instance,
                stats,
                listing: Mutex::new(listing),
                armed: AtomicBool::new(true),
                dirty: AtomicBool::new(false),
                detached: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
            debouncer: None,
        }
    }

    /// Starts applying changes, replaying any that arrived while inactive.
    pub fn activate(&self) {
        let replay = {
            let _listing = self.inner.listing.lock();
            self.inner.armed.store(true, Ordering::Release);
            self.inner.dirty.swap(false, Ordering::AcqRel)
        };
        if replay {
            if let Err(e) = self.inner.sync() {
                warn!(source = %self.inner.source.display(), error = %e, "Failed to apply monitored changes");
            }
        }
    }

    /// Stops the monitor for good.
    ///
    /// Waits for a sync already touching the instance to finish; no sync
    /// reaches the instance once this returns.
    pub fn stop(&mut self) {
        self.inner.stopped.store(true, Ordering::Release);
        drop(self.inner.listing.lock());
        self.debouncer = None;
    }

    /// Rescans the source and applies the difference right away.
    pub fn sync_now(&self) -> Result<ApplyOutcome> {
        self.inner.sync()
    }

    pub fn source(&self) -> &Path {
        &self.inner.source
    }

    pub fn destination(&self) -> &VirtualPath {
        &self.inner.destination
    }

    /// True once the source directory or the destination node disappeared.
    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::Acquire)
    }

    /// Returns true if the monitor is backed by a live watcher.
    pub fn is_watching(&self) -> bool {
        self.debouncer.is_some() && !self.inner.is_inactive()
    }
}

impl Drop for DirectoryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
