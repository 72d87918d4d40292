//! In-process named segments.
//!
//! Every connection inside one OS process that opens the same name gets the
//! same segment. `parking_lot` locks are not poisoned, so a thread that
//! panicked while holding the lock does not wedge later callers.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::debug;

use super::{SharedState, StateBackend};
use crate::error::Result;

static SEGMENTS: OnceLock<Mutex<HashMap<String, Arc<LocalSegment>>>> = OnceLock::new();

fn segments() -> &'static Mutex<HashMap<String, Arc<LocalSegment>>> {
    SEGMENTS.get_or_init(|| Mutex::new(HashMap::new()))
}

#[derive(Debug, Default)]
struct LocalSegment {
    state: Mutex<SharedState>,
    changed: Condvar,
}

/// Backend over a process-wide registry of named segments.
#[derive(Debug)]
pub struct LocalBackend {
    name: String,
    segment: Mutex<Arc<LocalSegment>>,
}

impl LocalBackend {
    /// Opens the named segment, creating it if absent.
    pub fn open(name: &str) -> Self {
        Self {
            name: name.to_string(),
            segment: Mutex::new(Self::attach(name)),
        }
    }

    fn attach(name: &str) -> Arc<LocalSegment> {
        segments()
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(instance = name, "Creating in-process segment");
                Arc::new(LocalSegment::default())
            })
            .clone()
    }

    /// Re-attaches if the segment was destroyed through another handle.
    fn current(&self) -> Arc<LocalSegment> {
        let mut segment = self.segment.lock();
        let registered = segments().lock().get(&self.name).cloned();
        match registered {
            Some(live) => {
                if !Arc::ptr_eq(&live, &segment) {
                    *segment = live;
                }
            }
            None => *segment = Self::attach(&self.name),
        }
        segment.clone()
    }

    /// Returns true if a segment with this name is currently registered.
    pub fn exists(name: &str) -> bool {
        segments().lock().contains_key(name)
    }
}

impl StateBackend for LocalBackend {
    fn kind(&self) -> &'static str {
        "in-process"
    }

    fn read(&self, f: &mut dyn FnMut(&SharedState)) -> Result<()> {
        let segment = self.current();
        let state = segment.state.lock();
        f(&state);
        Ok(())
    }

    fn write(&self, f: &mut dyn FnMut(&mut SharedState) -> bool) -> Result<()> {
        let segment = self.current();
        let mut state = segment.state.lock();
        if f(&mut state) {
            segment.changed.notify_all();
        }
        Ok(())
    }

    fn wait_for_change(&self, seen: u64, timeout: Duration) -> Result<u64> {
        let segment = self.current();
        let deadline = Instant::now() + timeout;
        let mut state = segment.state.lock();
        while state.generation == seen {
            if segment.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        Ok(state.generation)
    }

    fn destroy(&self) -> Result<()> {
        let segment = self.segment.lock();
        let mut registry = segments().lock();
        if registry
            .get(&self.name)
            .map(|live| Arc::ptr_eq(live, &segment))
            .unwrap_or(false)
        {
            registry.remove(&self.name);
            debug!(instance = %self.name, "Released in-process segment");
        }
        segment.changed.notify_all();
        Ok(())
    }

    fn destroy_if_unused(&self) -> Result<bool> {
        let segment = self.current();
        let state = segment.state.lock();
        if !state.processes.is_empty() {
            return Ok(false);
        }
        let mut registry = segments().lock();
        if registry
            .get(&self.name)
            .map(|live| Arc::ptr_eq(live, &segment))
            .unwrap_or(false)
        {
            registry.remove(&self.name);
            debug!(instance = %self.name, "Released unused in-process segment");
        }
        segment.changed.notify_all();
        Ok(true)
    }
}
