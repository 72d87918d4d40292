//! Configuration types for WeaveFS instances.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Log level for records forwarded to an instance's shared log queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    /// Only log errors
    Error,
    /// Log errors and warnings
    Warn,
    /// Log errors, warnings, and informational messages
    Info,
    /// Log errors, warnings, info, and debug messages
    Debug,
    /// Log everything including trace-level details
    Trace,
}

impl LogLevel {
    /// Returns the string representation of the log level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Single-letter tag used in formatted log records.
    pub fn tag(&self) -> char {
        match self {
            LogLevel::Error => 'E',
            LogLevel::Warn => 'W',
            LogLevel::Info => 'I',
            LogLevel::Debug => 'D',
            LogLevel::Trace => 'T',
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            LogLevel::Error => 0,
            LogLevel::Warn => 1,
            LogLevel::Info => 2,
            LogLevel::Debug => 3,
            LogLevel::Trace => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::TRACE => LogLevel::Trace,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// How crash dumps of hooked processes are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CrashDumpsType {
    /// No crash dumps
    #[default]
    None,
    /// One dump file per crashing process
    PerProcess,
    /// All processes of the instance write to a combined dump location
    Combined,
}

impl std::str::FromStr for CrashDumpsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(CrashDumpsType::None),
            "per-process" | "perprocess" => Ok(CrashDumpsType::PerProcess),
            "combined" => Ok(CrashDumpsType::Combined),
            _ => Err(format!("Unknown crash dump type: {}", s)),
        }
    }
}

/// Where the shared state of an instance lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    /// Named segment visible to every connection inside this OS process.
    InProcess,
    /// Named segment backed by files in `directory`, visible to every process
    /// on the machine that uses the same directory.
    SharedFile { directory: PathBuf },
}

impl StorageKind {
    /// The default machine-wide segment directory.
    pub fn default_shared() -> Self {
        StorageKind::SharedFile {
            directory: std::env::temp_dir().join("weavefs"),
        }
    }
}

impl Default for StorageKind {
    fn default() -> Self {
        Self::default_shared()
    }
}

/// Settings shared by every process attached to an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedParameters {
    pub debug_mode: bool,
    pub log_level: LogLevel,
    pub crash_dumps_type: CrashDumpsType,
    pub crash_dumps_path: PathBuf,
}

impl Default for SharedParameters {
    fn default() -> Self {
        Self {
            debug_mode: false,
            log_level: LogLevel::Info,
            crash_dumps_type: CrashDumpsType::None,
            crash_dumps_path: PathBuf::new(),
        }
    }
}

/// Parameters for creating or connecting to an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VfsParameters {
    /// Name of the shared instance
    pub instance_name: String,

    /// Whether hooked processes wait for a debugger on start
    pub debug_mode: bool,

    /// Minimum level of records forwarded to the shared log queue
    pub log_level: LogLevel,

    /// Crash dump mode for hooked processes
    pub crash_dumps_type: CrashDumpsType,

    /// Directory crash dumps are written to
    pub crash_dumps_path: PathBuf,

    /// Backing storage of the shared state (local to this process)
    #[serde(default)]
    pub storage: StorageKind,
}

impl VfsParameters {
    /// Creates parameters for the named instance with default settings.
    pub fn new(instance_name: impl Into<String>) -> Self {
        let shared = SharedParameters::default();
        Self {
            instance_name: instance_name.into(),
            debug_mode: shared.debug_mode,
            log_level: shared.log_level,
            crash_dumps_type: shared.crash_dumps_type,
            crash_dumps_path: shared.crash_dumps_path,
            storage: StorageKind::default(),
        }
    }

    /// Sets debug mode.
    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    /// Sets the log level.
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Sets the crash dump type.
    pub fn with_crash_dumps_type(mut self, dumps_type: CrashDumpsType) -> Self {
        self.crash_dumps_type = dumps_type;
        self
    }

    /// Sets the crash dump directory.
    pub fn with_crash_dumps_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.crash_dumps_path = path.into();
        self
    }

    /// Sets the backing storage.
    pub fn with_storage(mut self, storage: StorageKind) -> Self {
        self.storage = storage;
        self
    }

    /// Extracts the settings shared with other processes.
    pub fn shared(&self) -> SharedParameters {
        SharedParameters {
            debug_mode: self.debug_mode,
            log_level: self.log_level,
            crash_dumps_type: self.crash_dumps_type,
            crash_dumps_path: self.crash_dumps_path.clone(),
        }
    }

    /// Copies the shared settings into these parameters, keeping name and storage.
    pub fn apply_shared(&mut self, shared: &SharedParameters) {
        self.debug_mode = shared.debug_mode;
        self.log_level = shared.log_level;
        self.crash_dumps_type = shared.crash_dumps_type;
        self.crash_dumps_path = shared.crash_dumps_path.clone();
    }

    /// Validates the parameters.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.instance_name.trim().is_empty() {
            errors.push("Instance name must not be empty".to_string());
        }

        if self.instance_name.contains('\0') {
            errors.push("Instance name must not contain NUL characters".to_string());
        }

        if self.crash_dumps_type != CrashDumpsType::None
            && self.crash_dumps_path.as_os_str().is_empty()
        {
            errors.push("Crash dump path must be specified when crash dumps are enabled".to_string());
        }

        if let StorageKind::SharedFile { directory } = &self.storage {
            if directory.as_os_str().is_empty() {
                errors.push("Shared storage directory must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
