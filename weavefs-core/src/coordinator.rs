//! The explicit API surface of a process attached to an instance.
//!
//! A [`Vfs`] is one process's view of the virtual filesystem: it holds at most
//! one connection to a named instance and routes every operation through that
//! instance's lock. Controllers create an instance, link sources into it and
//! spawn hooked processes; hooked processes connect to the same name and query
//! it.

use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Result, VfsError};
use crate::instance::{process, SharedInstance, SharedState, MAX_PROCESSES};
use crate::link;
use crate::logging::{self, LogQueue, LogRecord};
use crate::monitor::DirectoryMonitor;
use crate::spawn::{self, InjectionRequest, Injector};
use crate::stats::{StatsSnapshot, VfsStats};
use crate::tree::{dump, AccessIntent, NodeInfo};
use crate::types::{LinkFlags, VfsParameters, VirtualPath};

const LOG_POLL_SLICE: Duration = Duration::from_millis(100);

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Static version string.
pub fn version_string() -> String {
    format!("weavefs {}", VERSION)
}

/// How a log read waits for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogWait {
    /// Return immediately when the queue is empty
    NonBlocking,
    /// Wait for a record, up to `timeout` if given, or until cancelled
    Blocking { timeout: Option<Duration> },
}

/// Wakes up a blocked log read from another thread.
#[derive(Debug, Clone, Default)]
pub struct LogCancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl LogCancelHandle {
    /// Makes the current (or next) blocking log read return without a record.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.cancelled.swap(false, Ordering::AcqRel)
    }
}

/// Outcome of [`Vfs::dump_into`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpSize {
    /// No buffer, or a buffer too small: this many bytes are needed
    Required(usize),
    /// The dump was written; this many bytes were used
    Written(usize),
}

enum LogTake<R> {
    Taken(R),
    Empty,
    /// The head record did not fit and was dropped
    Rejected { needed: usize },
}

struct Connection {
    instance: Arc<SharedInstance>,
    parameters: VfsParameters,
    monitors: Vec<DirectoryMonitor>,
}

/// A process's handle on the virtual filesystem.
pub struct Vfs {
    process_id: u32,
    connection: Option<Connection>,
    stats: Arc<VfsStats>,
    log_cancel: LogCancelHandle,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("process_id", &self.process_id)
            .field("instance", &self.current_instance_name())
            .finish()
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    /// Creates an unconnected handle for the calling process.
    pub fn new() -> Self {
        Self::with_process_id(std::process::id())
    }

    /// Creates an unconnected handle registering under `process_id`.
    ///
    /// Lets one OS process act for several attached processes, as tests and
    /// brokers do.
    pub fn with_process_id(process_id: u32) -> Self {
        Self {
            process_id,
            connection: None,
            stats: Arc::new(VfsStats::new()),
            log_cancel: LogCancelHandle::default(),
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    fn connection(&self) -> Result<&Connection> {
        self.connection.as_ref().ok_or(VfsError::NotConnected)
    }

    fn instance(&self) -> Result<&SharedInstance> {
        Ok(&self.connection()?.instance)
    }

    // ---- lifecycle ----

    /// Attaches to the named instance, creating it if absent.
    ///
    /// Any previous connection is closed first. A newly created instance takes
    /// the shared settings from `parameters`; an existing one keeps its own.
    pub fn connect(&mut self, parameters: &VfsParameters) -> Result<()> {
        self.attach(parameters, false)
    }

    /// Attaches to the named instance and empties its tree, rules and log
    /// queue. Processes still registered stay registered.
    pub fn create(&mut self, parameters: &VfsParameters) -> Result<()> {
        self.attach(parameters, true)
    }

    fn attach(&mut self, parameters: &VfsParameters, fresh: bool) -> Result<()> {
        parameters
            .validate()
            .map_err(|errors| VfsError::invalid_parameters(errors.join("; ")))?;
        self.disconnect()?;

        let instance = Arc::new(SharedInstance::open(&parameters.instance_name, &parameters.storage)?);
        let process_id = self.process_id;
        let requested = parameters.shared();
        let effective = instance.update(|state| {
            register(state, process_id)?;
            if fresh {
                state.reset(requested.clone());
            } else if state.generation == 0 {
                state.parameters = requested.clone();
            }
            Ok(state.parameters.clone())
        })?;

        let mut local = parameters.clone();
        local.apply_shared(&effective);
        logging::set_max_level(effective.log_level);
        info!(
            instance = %parameters.instance_name,
            process_id,
            backend = instance.backend_kind(),
            fresh,
            "Attached to instance"
        );

        self.connection = Some(Connection {
            instance,
            parameters: local,
            monitors: Vec::new(),
        });
        Ok(())
    }

    /// Detaches from the current instance, if any.
    ///
    /// Monitors started by this handle stop. When no registered process is
    /// left the instance's shared state is released.
    pub fn disconnect(&mut self) -> Result<()> {
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        let Connection {
            instance, monitors, ..
        } = connection;
        for mut monitor in monitors {
            monitor.stop();
        }

        let torn_down = instance.release(self.process_id)?;
        if torn_down {
            info!(instance = %instance.name(), "Last process detached, instance released");
        } else {
            debug!(instance = %instance.name(), process_id = self.process_id, "Detached from instance");
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Name of the connected instance.
    pub fn current_instance_name(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.instance.name())
    }

    /// Current parameters, with the shared settings as the instance has them.
    pub fn parameters(&self) -> Result<VfsParameters> {
        let connection = self.connection()?;
        let shared = connection.instance.read(|state| state.parameters.clone())?;
        let mut parameters = connection.parameters.clone();
        parameters.apply_shared(&shared);
        Ok(parameters)
    }

    /// Replaces the shared settings of the instance. The instance name and
    /// the storage stay as they are.
    pub fn update_parameters(&mut self, parameters: &VfsParameters) -> Result<()> {
        let shared = parameters.shared();
        let connection = self.connection.as_mut().ok_or(VfsError::NotConnected)?;
        let mut checked = parameters.clone();
        checked.instance_name = connection.parameters.instance_name.clone();
        checked
            .validate()
            .map_err(|errors| VfsError::invalid_parameters(errors.join("; ")))?;

        connection.instance.update(|state| {
            state.parameters = shared.clone();
            Ok(())
        })?;
        connection.parameters.apply_shared(&shared);
        logging::set_max_level(shared.log_level);
        info!(log_level = %shared.log_level, debug_mode = shared.debug_mode, "Updated instance parameters");
        Ok(())
    }

    // ---- mapping mutation ----

    /// Links the real file `source` to the virtual path `destination`.
    pub fn link_file(&self, source: impl AsRef<Path>, destination: &str, flags: LinkFlags) -> Result<()> {
        let source = source.as_ref();
        let destination = VirtualPath::parse(destination)?;
        if flags.contains(LinkFlags::MONITOR_CHANGES) {
            debug!(destination = %destination, "Change monitoring only applies to directory links");
        }

        let result = self.instance()?.update(|state| {
            let plan = link::plan_file_link(&state.tree, source, &destination, flags)?;
            link::apply(&mut state.tree, &plan)
        });
        self.finish_link(result, source, &destination, flags).map(|_| ())
    }

    /// Links every entry of the real directory `source` below `destination`.
    ///
    /// Skip rules are applied while enumerating. With `MONITOR_CHANGES` the
    /// source stays watched for as long as this handle stays connected.
    pub fn link_directory_static(
        &mut self,
        source: impl AsRef<Path>,
        destination: &str,
        flags: LinkFlags,
    ) -> Result<()> {
        let source = source.as_ref();
        let destination = VirtualPath::parse(destination)?;
        let connection = self.connection.as_mut().ok_or(VfsError::NotConnected)?;
        let instance = Arc::clone(&connection.instance);

        let rules = instance.read(|state| state.rules.clone())?;
        let scan = match link::scan_source(source, flags.contains(LinkFlags::RECURSIVE), &rules) {
            Ok(scan) => scan,
            Err(e) => {
                self.stats.record_failed_link();
                warn!(source = %source.display(), destination = %destination, error = %e, "Link failed");
                return Err(e);
            }
        };

        let monitor = if flags.contains(LinkFlags::MONITOR_CHANGES) {
            Some(DirectoryMonitor::attach(
                Arc::clone(&instance),
                Arc::clone(&self.stats),
                source,
                destination.clone(),
                flags,
                rules,
                scan.listing.clone(),
            )?)
        } else {
            None
        };

        let result = instance.update(|state| {
            let plan = link::plan_directory_link(&state.tree, source, &scan, &destination, flags)?;
            link::apply(&mut state.tree, &plan)
        });
        let stats = Arc::clone(&self.stats);
        finish_link(&stats, result, source, &destination, flags)?;

        if let Some(monitor) = monitor {
            monitor.activate();
            connection.monitors.push(monitor);
        }
        Ok(())
    }

    fn finish_link(
        &self,
        result: Result<link::ApplyOutcome>,
        source: &Path,
        destination: &VirtualPath,
        flags: LinkFlags,
    ) -> Result<link::ApplyOutcome> {
        finish_link(&self.stats, result, source, destination, flags)
    }

    /// Empties the tree. Rules and registered processes are untouched and
    /// monitors started by this handle stop.
    pub fn clear_virtual_mappings(&mut self) -> Result<()> {
        let connection = self.connection.as_mut().ok_or(VfsError::NotConnected)?;
        connection.monitors.clear();
        connection.instance.update(|state| {
            state.tree.clear();
            Ok(())
        })?;
        info!(instance = %connection.instance.name(), "Cleared virtual mappings");
        Ok(())
    }

    /// Applies pending source changes of every monitor now and drops the
    /// monitors that detached.
    ///
    /// # Returns
    /// Number of monitors still active
    pub fn sync_monitors(&mut self) -> Result<usize> {
        let connection = self.connection.as_mut().ok_or(VfsError::NotConnected)?;
        for monitor in &connection.monitors {
            monitor.sync_now()?;
        }
        connection.monitors.retain(|monitor| !monitor.is_detached());
        Ok(connection.monitors.len())
    }

    // ---- rule configuration ----

    fn update_rules(&self, f: impl FnOnce(&mut crate::rules::RuleRegistry)) -> Result<()> {
        self.instance()?.update(|state| {
            f(&mut state.rules);
            Ok(())
        })
    }

    pub fn add_skip_file_suffix(&self, suffix: &str) -> Result<()> {
        self.update_rules(|rules| rules.add_skip_file_suffix(suffix))
    }

    pub fn clear_skip_file_suffixes(&self) -> Result<()> {
        self.update_rules(|rules| rules.clear_skip_file_suffixes())
    }

    pub fn add_skip_directory(&self, name: &str) -> Result<()> {
        self.update_rules(|rules| rules.add_skip_directory(name))
    }

    pub fn clear_skip_directories(&self) -> Result<()> {
        self.update_rules(|rules| rules.clear_skip_directories())
    }

    pub fn blacklist_executable(&self, executable: &str) -> Result<()> {
        self.update_rules(|rules| rules.blacklist_executable(executable))
    }

    pub fn clear_executable_blacklist(&self) -> Result<()> {
        self.update_rules(|rules| rules.clear_executable_blacklist())
    }

    pub fn force_load_library(&self, process_name: &str, library: impl AsRef<Path>) -> Result<()> {
        let library = library.as_ref().to_path_buf();
        self.update_rules(|rules| rules.force_load_library(process_name, library))
    }

    pub fn clear_library_force_loads(&self) -> Result<()> {
        self.update_rules(|rules| rules.clear_library_force_loads())
    }

    /// Copy of the instance's rule lists.
    pub fn rules(&self) -> Result<crate::rules::RuleRegistry> {
        self.instance()?.read(|state| state.rules.clone())
    }

    // ---- processes ----

    /// Point-in-time snapshot of the registered process ids.
    pub fn process_list(&self) -> Result<Vec<u32>> {
        self.instance()?.read(|state| {
            let count = state.processes.len();
            if count > MAX_PROCESSES {
                return Err(VfsError::TooManyInstancesOrProcesses {
                    count,
                    limit: MAX_PROCESSES,
                });
            }
            let mut list = Vec::new();
            list.try_reserve_exact(count)
                .map_err(|e| VfsError::ResourceExhaustion {
                    message: e.to_string(),
                })?;
            list.extend(state.processes.iter().copied());
            Ok(list)
        })?
    }

    /// Registers another process with the instance.
    pub fn register_process(&self, process_id: u32) -> Result<()> {
        self.instance()?.update(|state| register(state, process_id))
    }

    /// Removes a process from the instance.
    ///
    /// # Returns
    /// `true` if the process was registered
    pub fn unregister_process(&self, process_id: u32) -> Result<bool> {
        self.instance()?.update_if(|state| {
            let removed = state.processes.remove(&process_id);
            (removed, removed)
        })
    }

    /// Unregisters processes that no longer run.
    ///
    /// # Returns
    /// The ids that were removed
    pub fn reap_exited_processes(&self) -> Result<Vec<u32>> {
        let registered = self.process_list()?;
        let exited: Vec<u32> = registered
            .into_iter()
            .filter(|pid| *pid != self.process_id && !process::is_process_alive(*pid))
            .collect();
        if exited.is_empty() {
            return Ok(exited);
        }
        self.instance()?.update(|state| {
            for pid in &exited {
                state.processes.remove(pid);
            }
            Ok(())
        })?;
        info!(count = exited.len(), "Removed exited processes");
        Ok(exited)
    }

    // ---- queries ----

    /// Resolves a virtual path for a hooked filesystem call.
    ///
    /// # Returns
    /// The real path to use, or `None` if the path is not virtualized
    pub fn resolve(&self, path: &str, intent: AccessIntent) -> Result<Option<PathBuf>> {
        let path = VirtualPath::parse(path)?;
        let resolved = self
            .instance()?
            .read(|state| state.tree.resolve(&path, intent))?;
        self.stats.record_resolve(intent, resolved.is_some());
        Ok(resolved)
    }

    /// Snapshot of the node at `path`.
    pub fn lookup(&self, path: &str) -> Result<Option<NodeInfo>> {
        let path = VirtualPath::parse(path)?;
        self.instance()?
            .read(|state| state.tree.lookup(&path).map(NodeInfo::from))
    }

    /// Virtual children of the directory at `path`.
    pub fn list_directory(&self, path: &str) -> Result<Option<Vec<NodeInfo>>> {
        let path = VirtualPath::parse(path)?;
        self.instance()?.read(|state| state.tree.list_directory(&path))
    }

    /// The innermost create-target that applies to `path`.
    pub fn create_target_for(&self, path: &str) -> Result<Option<PathBuf>> {
        let path = VirtualPath::parse(path)?;
        self.instance()?.read(|state| {
            state
                .tree
                .create_target_for(&path)
                .map(|(_, target)| target.to_path_buf())
        })
    }

    /// Textual dump of the whole tree.
    pub fn dump(&self) -> Result<String> {
        self.instance()?.read(|state| dump::render(&state.tree))
    }

    /// Dump with a size query before the fill.
    ///
    /// Without a buffer, or with one too small, the required size is returned
    /// and nothing is written.
    pub fn dump_into(&self, buffer: Option<&mut [u8]>) -> Result<DumpSize> {
        self.instance()?.read(|state| match buffer {
            None => DumpSize::Required(dump::measure(&state.tree)),
            Some(buffer) => match dump::write_into(&state.tree, buffer) {
                Ok(written) => DumpSize::Written(written),
                Err(required) => DumpSize::Required(required),
            },
        })
    }

    /// Logs the state of the instance and this handle at info level.
    pub fn print_debug_info(&self) -> Result<()> {
        let connection = self.connection()?;
        let (generation, processes, rules, text) = connection.instance.read(|state| {
            (
                state.generation,
                state.processes.iter().copied().collect::<Vec<_>>(),
                state.rules.clone(),
                dump::render(&state.tree),
            )
        })?;

        info!(
            instance = %connection.instance.name(),
            backend = connection.instance.backend_kind(),
            generation,
            process_id = self.process_id,
            "Instance state"
        );
        info!(processes = ?processes, "Registered processes");
        info!(
            skip_suffixes = ?rules.skip_file_suffixes().collect::<Vec<_>>(),
            skip_directories = ?rules.skip_directories().collect::<Vec<_>>(),
            blacklist = ?rules.executable_blacklist().collect::<Vec<_>>(),
            forced_libraries = ?rules.forced_libraries(),
            "Rules"
        );
        info!(monitors = connection.monitors.len(), stats = %self.stats.snapshot(), "Statistics");
        for line in text.lines() {
            info!("{}", line);
        }
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // ---- logging ----

    /// Handle that interrupts blocking log reads of this `Vfs`.
    pub fn log_cancel_handle(&self) -> LogCancelHandle {
        self.log_cancel.clone()
    }

    /// Takes the next record from the shared log queue.
    pub fn next_log_record(&self, wait: LogWait) -> Result<Option<LogRecord>> {
        self.take_log(wait, |queue| match queue.pop() {
            Some(record) => LogTake::Taken(record),
            None => LogTake::Empty,
        })
    }

    /// Writes the next formatted record, NUL terminated, into `buffer`.
    ///
    /// # Returns
    /// `false` if no record was produced: the queue stayed empty, the read was
    /// cancelled or timed out, or the buffer is too small (the record is then
    /// dropped so it cannot stall later readers)
    pub fn get_log_message(&self, buffer: &mut [u8], wait: LogWait) -> Result<bool> {
        let capacity = buffer.len();
        let taken = self.take_log(wait, |queue| {
            let Some(record) = queue.front() else {
                return LogTake::Empty;
            };
            let text = record.to_string();
            if text.len() + 1 > capacity {
                queue.pop();
                return LogTake::Rejected {
                    needed: text.len() + 1,
                };
            }
            queue.pop();
            LogTake::Taken(text)
        })?;

        match taken {
            Some(text) => {
                buffer[..text.len()].copy_from_slice(text.as_bytes());
                buffer[text.len()] = 0;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn take_log<R>(&self, wait: LogWait, mut take: impl FnMut(&mut LogQueue) -> LogTake<R>) -> Result<Option<R>> {
        let instance = self.instance()?;
        let deadline = match wait {
            LogWait::Blocking { timeout: Some(timeout) } => Some(Instant::now() + timeout),
            _ => None,
        };

        loop {
            instance.flush_logs()?;
            let (taken, generation) = instance.update_if(|state| {
                let taken = take(&mut state.log_queue);
                let changed = !matches!(taken, LogTake::Empty);
                ((taken, state.generation), changed)
            })?;
            match taken {
                LogTake::Taken(value) => return Ok(Some(value)),
                LogTake::Rejected { needed } => {
                    warn!(needed, "Log record larger than the caller's buffer, dropped");
                    return Ok(None);
                }
                LogTake::Empty => {}
            }

            if wait == LogWait::NonBlocking || self.log_cancel.take() {
                return Ok(None);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    LOG_POLL_SLICE.min(deadline - now)
                }
                None => LOG_POLL_SLICE,
            };
            instance.wait_for_change(generation, slice)?;
        }
    }

    // ---- process spawning ----

    /// Spawns `command` and hooks it into the connected instance.
    ///
    /// The child is registered before the injector runs. Blacklisted
    /// executables are spawned without registration or injection. If the
    /// injector fails, the child is killed and unregistered.
    pub fn create_process_hooked(&self, command: &mut Command, injector: &dyn Injector) -> Result<Child> {
        let connection = self.connection()?;
        let instance = &connection.instance;
        let program = PathBuf::from(command.get_program());
        let image = spawn::image_name(command);

        let (blacklisted, libraries, parameters) = instance.read(|state| {
            (
                state.rules.is_executable_blacklisted(&program),
                state.rules.libraries_for(&image),
                state.parameters.clone(),
            )
        })?;

        let mut child = command.spawn()?;
        let process_id = child.id();
        if blacklisted {
            info!(program = %program.display(), process_id, "Spawned blacklisted executable without hooks");
            return Ok(child);
        }

        if let Err(e) = instance.update(|state| register(state, process_id)) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        let request = InjectionRequest {
            process_id,
            instance_name: instance.name().to_string(),
            parameters,
            libraries,
        };
        if let Err(e) = injector.inject(&request) {
            warn!(process_id, error = %e, "Injection failed, terminating process");
            let _ = child.kill();
            let _ = child.wait();
            instance.update_if(|state| ((), state.processes.remove(&process_id)))?;
            return Err(VfsError::Injection {
                process_id,
                message: e.to_string(),
            });
        }

        info!(program = %program.display(), process_id, libraries = request.libraries.len(), "Spawned hooked process");
        Ok(child)
    }
}

impl Drop for Vfs {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!(error = %e, "Failed to detach from instance");
        }
    }
}

fn register(state: &mut SharedState, process_id: u32) -> Result<()> {
    if !state.processes.contains(&process_id) && state.processes.len() >= MAX_PROCESSES {
        return Err(VfsError::TooManyInstancesOrProcesses {
            count: state.processes.len() + 1,
            limit: MAX_PROCESSES,
        });
    }
    state.processes.insert(process_id);
    Ok(())
}

fn finish_link(
    stats: &VfsStats,
    result: Result<link::ApplyOutcome>,
    source: &Path,
    destination: &VirtualPath,
    flags: LinkFlags,
) -> Result<link::ApplyOutcome> {
    match result {
        Ok(outcome) => {
            stats.record_link(outcome.linked);
            info!(
                source = %source.display(),
                destination = %destination,
                flags = %flags,
                linked = outcome.linked,
                replaced = outcome.replaced,
                "Linked"
            );
            Ok(outcome)
        }
        Err(e) => {
            stats.record_failed_link();
            warn!(source = %source.display(), destination = %destination, error = %e, "Link failed");
            Err(e)
        }
    }
}
