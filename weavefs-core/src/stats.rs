//! Per-process counters reported by `print_debug_info`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::tree::AccessIntent;

/// Counters of one connection's activity.
#[derive(Debug, Default)]
pub struct VfsStats {
    resolves: AtomicU64,
    create_resolves: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    links: AtomicU64,
    failed_links: AtomicU64,
    entries_linked: AtomicU64,
    monitor_events: AtomicU64,
    monitor_updates: AtomicU64,
}

/// Point-in-time copy of [`VfsStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub resolves: u64,
    pub create_resolves: u64,
    pub hits: u64,
    pub misses: u64,
    pub links: u64,
    pub failed_links: u64,
    pub entries_linked: u64,
    pub monitor_events: u64,
    pub monitor_updates: u64,
}

impl VfsStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one resolve and whether it found a mapping.
    pub fn record_resolve(&self, intent: AccessIntent, hit: bool) {
        self.resolves.fetch_add(1, Ordering::Relaxed);
        if intent == AccessIntent::Create {
            self.create_resolves.fetch_add(1, Ordering::Relaxed);
        }
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a completed link operation and the nodes it placed.
    pub fn record_link(&self, entries: usize) {
        self.links.fetch_add(1, Ordering::Relaxed);
        self.entries_linked.fetch_add(entries as u64, Ordering::Relaxed);
    }

    pub fn record_failed_link(&self) {
        self.failed_links.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_monitor_events(&self, count: usize) {
        self.monitor_events.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_monitor_update(&self) {
        self.monitor_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Hit rate of resolves as a value between 0.0 and 1.0.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            resolves: self.resolves.load(Ordering::Relaxed),
            create_resolves: self.create_resolves.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            links: self.links.load(Ordering::Relaxed),
            failed_links: self.failed_links.load(Ordering::Relaxed),
            entries_linked: self.entries_linked.load(Ordering::Relaxed),
            monitor_events: self.monitor_events.load(Ordering::Relaxed),
            monitor_updates: self.monitor_updates.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.resolves,
            &self.create_resolves,
            &self.hits,
            &self.misses,
            &self.links,
            &self.failed_links,
            &self.entries_linked,
            &self.monitor_events,
            &self.monitor_updates,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resolves={} (create={}) hits={} misses={} links={} failed_links={} entries_linked={} monitor_events={} monitor_updates={}",
            self.resolves,
            self.create_resolves,
            self.hits,
            self.misses,
            self.links,
            self.failed_links,
            self.entries_linked,
            self.monitor_events,
            self.monitor_updates
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_counters() {
        let stats = VfsStats::new();
        stats.record_resolve(AccessIntent::Read, true);
        stats.record_resolve(AccessIntent::Read, true);
        stats.record_resolve(AccessIntent::Create, false);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.resolves, 3);
        assert_eq!(snapshot.create_resolves, 1);
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_link_counters_and_reset() {
        let stats = VfsStats::new();
        stats.record_link(4);
        stats.record_failed_link();
        stats.record_monitor_events(3);
        stats.record_monitor_update();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.links, 1);
        assert_eq!(snapshot.entries_linked, 4);
        assert_eq!(snapshot.failed_links, 1);
        assert_eq!(snapshot.monitor_events, 3);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
        assert_eq!(stats.hit_rate(), 0.0);
    }
}
