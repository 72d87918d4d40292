//! Named shared instances.
//!
//! An instance is one [`SharedState`] value guarded by a single lock. The lock
//! and the storage are provided by a [`StateBackend`]; [`SharedInstance`] adds
//! generation counting and log forwarding on top, and is the only way the rest
//! of the crate touches shared state.

pub mod file;
pub mod local;
pub mod process;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, VfsError};
use crate::logging::{LogQueue, PendingLog};
use crate::rules::RuleRegistry;
use crate::tree::VirtualTree;
use crate::types::{SharedParameters, StorageKind};

pub use file::FileBackend;
pub use local::LocalBackend;

/// Bookkeeping limit on registered processes per instance.
pub const MAX_PROCESSES: usize = 4096;

/// Everything processes attached to one instance share.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    /// Incremented by every completed mutation
    pub generation: u64,
    pub tree: VirtualTree,
    pub rules: RuleRegistry,
    pub processes: BTreeSet<u32>,
    pub log_queue: LogQueue,
    pub parameters: SharedParameters,
}

impl SharedState {
    /// Empties tree, rules and log queue and installs new parameters.
    ///
    /// Registered processes are kept.
    pub fn reset(&mut self, parameters: SharedParameters) {
        self.tree.clear();
        self.rules = RuleRegistry::default();
        self.log_queue.clear();
        self.parameters = parameters;
    }
}

/// Storage and locking for one named instance.
///
/// Both closures run with the instance lock held. The closure passed to
/// [`StateBackend::write`] returns whether it changed the state; unchanged
/// state does not need to be stored.
pub trait StateBackend: Send + Sync {
    /// Short description of the backend for diagnostics.
    fn kind(&self) -> &'static str;

    fn read(&self, f: &mut dyn FnMut(&SharedState)) -> Result<()>;

    fn write(&self, f: &mut dyn FnMut(&mut SharedState) -> bool) -> Result<()>;

    /// Blocks until the generation differs from `seen` or `timeout` elapses.
    ///
    /// # Returns
    /// The current generation
    fn wait_for_change(&self, seen: u64, timeout: Duration) -> Result<u64>;

    /// Releases the shared state. Handles still open see a fresh state on
    /// their next access.
    fn destroy(&self) -> Result<()>;

    /// Releases the shared state if no process is registered, deciding under
    /// the instance lock.
    ///
    /// # Returns
    /// `true` if the state was released
    fn destroy_if_unused(&self) -> Result<bool>;
}

/// Handle on a named instance.
pub struct SharedInstance {
    name: String,
    backend: Box<dyn StateBackend>,
    pending: Arc<PendingLog>,
}

impl std::fmt::Debug for SharedInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedInstance")
            .field("name", &self.name)
            .field("backend", &self.backend.kind())
            .finish()
    }
}

impl SharedInstance {
    /// Opens (creating if absent) the named instance on the given storage.
    pub fn open(name: &str, storage: &StorageKind) -> Result<Self> {
        let backend: Box<dyn StateBackend> = match storage {
            StorageKind::InProcess => Box::new(LocalBackend::open(name)),
            StorageKind::SharedFile { directory } => Box::new(FileBackend::open(directory, name)?),
        };
        Ok(Self::with_backend(name, backend, PendingLog::global()))
    }

    /// Wraps an already opened backend.
    pub fn with_backend(name: &str, backend: Box<dyn StateBackend>, pending: Arc<PendingLog>) -> Self {
        Self {
            name: name.to_string(),
            backend,
            pending,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    /// Runs `f` against the shared state under the instance lock.
    ///
    /// Pending log records are forwarded only once [`PendingLog::flush_due`]
    /// says so; [`SharedInstance::flush_logs`] forwards them right away.
    pub fn read<R>(&self, f: impl FnOnce(&SharedState) -> R) -> Result<R> {
        if self.pending.flush_due() {
            return self.transact(|state| (Ok(f(&*state)), false));
        }
        let mut f = Some(f);
        let mut out = None;
        self.backend.read(&mut |state| {
            if let Some(f) = f.take() {
                out = Some(f(state));
            }
        })?;
        out.ok_or_else(|| self.not_run())
    }

    /// Runs a mutation under the instance lock.
    ///
    /// `f` must validate before it mutates: when it returns an error the state
    /// is expected to be unchanged. Pending log records of this process are
    /// forwarded in the same critical section.
    pub fn update<R>(&self, f: impl FnOnce(&mut SharedState) -> Result<R>) -> Result<R> {
        self.transact(|state| {
            let result = f(state);
            let changed = result.is_ok();
            (result, changed)
        })
    }

    /// Runs `f` under the instance lock; `f` reports whether it changed the
    /// state, and only changes advance the generation.
    pub fn update_if<R>(&self, f: impl FnOnce(&mut SharedState) -> (R, bool)) -> Result<R> {
        self.transact(|state| {
            let (result, changed) = f(state);
            (Ok(result), changed)
        })
    }

    fn transact<R>(&self, f: impl FnOnce(&mut SharedState) -> (Result<R>, bool)) -> Result<R> {
        let mut f = Some(f);
        let mut out = None;
        let pending = &self.pending;
        self.backend.write(&mut |state| {
            let Some(f) = f.take() else {
                return false;
            };
            let (result, mutated) = f(state);
            let forwarded = pending.drain_into(&mut state.log_queue);
            let changed = forwarded > 0 || mutated;
            if changed {
                state.generation = state.generation.wrapping_add(1);
            }
            out = Some(result);
            changed
        })?;
        out.unwrap_or_else(|| Err(self.not_run()))
    }

    fn not_run(&self) -> VfsError {
        VfsError::CorruptState {
            instance: self.name.clone(),
            reason: "state closure was not invoked".to_string(),
        }
    }

    /// Forwards this process's pending log records to the shared queue.
    pub fn flush_logs(&self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.transact(|_| (Ok(()), false))
    }

    pub fn generation(&self) -> Result<u64> {
        self.read(|state| state.generation)
    }

    pub fn wait_for_change(&self, seen: u64, timeout: Duration) -> Result<u64> {
        self.backend.wait_for_change(seen, timeout)
    }

    /// Releases the shared state of this instance.
    pub fn destroy(&self) -> Result<()> {
        self.backend.destroy()
    }

    /// Removes `process_id` from the registered processes and releases the
    /// shared state if it was the last one.
    ///
    /// # Returns
    /// `true` if the instance was torn down
    pub fn release(&self, process_id: u32) -> Result<bool> {
        let now_unused = self.update(|state| {
            state.processes.remove(&process_id);
            Ok(state.processes.is_empty())
        })?;
        if !now_unused {
            return Ok(false);
        }
        self.backend.destroy_if_unused()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogRecord;
    use crate::types::{LogLevel, VirtualPath};

    fn instance(name: &str) -> SharedInstance {
        SharedInstance::with_backend(name, Box::new(LocalBackend::open(name)), Arc::new(PendingLog::new()))
    }

    #[test]
    fn test_update_bumps_generation() {
        let shared = instance("instance-mod-generation");
        let before = shared.generation().unwrap();
        shared
            .update(|state| {
                state.processes.insert(7);
                Ok(())
            })
            .unwrap();
        assert_eq!(shared.generation().unwrap(), before + 1);

        let failed: Result<()> = shared.update(|_| Err(VfsError::NotConnected));
        assert!(failed.is_err());
        assert_eq!(shared.generation().unwrap(), before + 1);
        shared.destroy().unwrap();
    }

    #[test]
    fn test_pending_logs_forwarded_on_read_when_due() {
        let pending = Arc::new(PendingLog::new());
        let name = "instance-mod-logs";
        let shared = SharedInstance::with_backend(name, Box::new(LocalBackend::open(name)), pending.clone());

        pending.push(LogRecord::new(LogLevel::Info, "test", "hello"));
        assert_eq!(shared.read(|state| state.log_queue.len()).unwrap(), 0);
        assert!(!pending.is_empty());

        let mut stale = LogRecord::new(LogLevel::Info, "test", "stale");
        stale.timestamp_ms -= 60_000;
        let fresh = PendingLog::new();
        fresh.push(stale);
        assert!(fresh.flush_due());

        for i in 0..64 {
            pending.push(LogRecord::new(LogLevel::Debug, "test", format!("burst {}", i)));
        }
        let queued = shared.read(|state| state.log_queue.len()).unwrap();
        assert_eq!(queued, 65);
        assert!(pending.is_empty());
        assert_eq!(shared.generation().unwrap(), 1);

        pending.push(LogRecord::new(LogLevel::Info, "test", "flushed"));
        shared.flush_logs().unwrap();
        assert_eq!(shared.read(|state| state.log_queue.len()).unwrap(), 66);
        shared.destroy().unwrap();
    }

    #[test]
    fn test_release_last_process_tears_down() {
        let name = "instance-mod-release";
        let first = instance(name);
        let second = instance(name);
        for (shared, pid) in [(&first, 1), (&second, 2)] {
            shared
                .update(|state| {
                    state.processes.insert(pid);
                    Ok(())
                })
                .unwrap();
        }

        assert!(!first.release(1).unwrap());
        assert!(LocalBackend::exists(name));
        assert!(second.release(2).unwrap());
        assert!(!LocalBackend::exists(name));
    }

    #[test]
    fn test_update_if_unchanged_keeps_generation() {
        let shared = instance("instance-mod-update-if");
        let value = shared.update_if(|state| (state.processes.len(), false)).unwrap();
        assert_eq!(value, 0);
        assert_eq!(shared.generation().unwrap(), 0);
        shared.destroy().unwrap();
    }

    #[test]
    fn test_reset_keeps_processes() {
        let mut state = SharedState::default();
        state.processes.insert(1);
        state.rules.add_skip_directory(".git");
        state
            .tree
            .ensure_virtual_directory(&VirtualPath::parse("/a").unwrap())
            .unwrap();

        state.reset(SharedParameters::default());
        assert!(state.tree.is_empty());
        assert_eq!(state.rules, RuleRegistry::default());
        assert!(state.processes.contains(&1));
    }
}
