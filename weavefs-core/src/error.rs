//! Error types for the WeaveFS system.

use std::path::PathBuf;
use thiserror::Error;

/// Win32 error codes reported through the boundary's "last error" channel.
pub mod codes {
    pub const ERROR_FILE_NOT_FOUND: u32 = 2;
    pub const ERROR_PATH_NOT_FOUND: u32 = 3;
    pub const ERROR_TOO_MANY_OPEN_FILES: u32 = 4;
    pub const ERROR_ACCESS_DENIED: u32 = 5;
    pub const ERROR_NOT_ENOUGH_MEMORY: u32 = 8;
    pub const ERROR_INVALID_DATA: u32 = 13;
    pub const ERROR_NOT_READY: u32 = 21;
    pub const ERROR_INVALID_PARAMETER: u32 = 87;
    pub const ERROR_INVALID_NAME: u32 = 123;
    pub const ERROR_ALREADY_EXISTS: u32 = 183;
    pub const ERROR_DIRECTORY: u32 = 267;
    pub const ERROR_CANCELLED: u32 = 1223;
    pub const ERROR_GEN_FAILURE: u32 = 31;
}

/// Comprehensive error type for all WeaveFS operations.
#[derive(Debug, Error)]
pub enum VfsError {
    /// A link destination's parent (or a link source) does not exist.
    #[error("Path not found: {path}")]
    PathNotFound {
        path: String,
    },

    /// Destination collision while `FAIL_IF_EXISTS` was set.
    #[error("Path already exists: {path}")]
    AlreadyExists {
        path: String,
    },

    /// A directory link was aborted because an entry matched a skip rule
    /// while `FAIL_IF_SKIPPED` was set.
    #[error("Linking aborted, entry matched a skip rule: {}", path.display())]
    SkippedEntry {
        path: PathBuf,
    },

    /// Malformed or missing arguments at the boundary.
    #[error("Invalid parameters: {message}")]
    InvalidParameters {
        message: String,
    },

    /// A path that cannot be normalized.
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath {
        path: String,
        reason: String,
    },

    /// A file node sits where a directory is required.
    #[error("Not a directory: {path}")]
    NotADirectory {
        path: String,
    },

    /// Allocation failure while building lists or buffers.
    #[error("Resource exhaustion: {message}")]
    ResourceExhaustion {
        message: String,
    },

    /// Internal bookkeeping limit exceeded.
    #[error("Too many instances or processes: {count} exceeds limit {limit}")]
    TooManyInstancesOrProcesses {
        count: usize,
        limit: usize,
    },

    /// The calling process is not attached to any instance.
    #[error("Not connected to a virtual filesystem instance")]
    NotConnected,

    /// The shared state of an instance could not be decoded.
    #[error("Shared state of instance '{instance}' is corrupt: {reason}")]
    CorruptState {
        instance: String,
        reason: String,
    },

    /// Attaching a change watcher failed.
    #[error("Failed to watch {}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// The injection collaborator refused or failed to hook a process.
    #[error("Failed to hook process {process_id}: {message}")]
    Injection {
        process_id: u32,
        message: String,
    },

    /// I/O error from the underlying system.
    #[error("I/O error")]
    Io {
        #[from]
        #[source]
        source: std::io::Error,
    },
}

impl VfsError {
    /// Returns the Win32 error code the boundary reports for this error.
    pub fn code(&self) -> u32 {
        use codes::*;
        match self {
            VfsError::PathNotFound { .. } => ERROR_PATH_NOT_FOUND,
            VfsError::AlreadyExists { .. } => ERROR_ALREADY_EXISTS,
            VfsError::SkippedEntry { .. } => ERROR_CANCELLED,
            VfsError::InvalidParameters { .. } => ERROR_INVALID_PARAMETER,
            VfsError::InvalidPath { .. } => ERROR_INVALID_NAME,
            VfsError::NotADirectory { .. } => ERROR_DIRECTORY,
            VfsError::ResourceExhaustion { .. } => ERROR_NOT_ENOUGH_MEMORY,
            VfsError::TooManyInstancesOrProcesses { .. } => ERROR_TOO_MANY_OPEN_FILES,
            VfsError::NotConnected => ERROR_NOT_READY,
            VfsError::CorruptState { .. } => ERROR_INVALID_DATA,
            VfsError::Watch { .. } => ERROR_GEN_FAILURE,
            VfsError::Injection { .. } => ERROR_GEN_FAILURE,
            VfsError::Io { source } => io_code(source),
        }
    }

    pub(crate) fn invalid_parameters(message: impl Into<String>) -> Self {
        VfsError::InvalidParameters {
            message: message.into(),
        }
    }
}

#[cfg(windows)]
fn io_code(error: &std::io::Error) -> u32 {
    match error.raw_os_error() {
        Some(code) if code > 0 => code as u32,
        _ => io_kind_code(error.kind()),
    }
}

/// Outside Windows the raw value is an `errno`, so only the kind is reported.
#[cfg(not(windows))]
fn io_code(error: &std::io::Error) -> u32 {
    io_kind_code(error.kind())
}

fn io_kind_code(kind: std::io::ErrorKind) -> u32 {
    use codes::*;
    use std::io::ErrorKind;
    match kind {
        ErrorKind::NotFound => ERROR_FILE_NOT_FOUND,
        ErrorKind::PermissionDenied => ERROR_ACCESS_DENIED,
        ErrorKind::AlreadyExists => ERROR_ALREADY_EXISTS,
        ErrorKind::InvalidInput => ERROR_INVALID_PARAMETER,
        ErrorKind::InvalidData => ERROR_INVALID_DATA,
        ErrorKind::OutOfMemory => ERROR_NOT_ENOUGH_MEMORY,
        _ => ERROR_GEN_FAILURE,
    }
}

/// Result type alias for WeaveFS operations.
pub type Result<T> = std::result::Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VfsError::PathNotFound { path: "/mnt/missing".to_string() };
        assert_eq!(err.to_string(), "Path not found: /mnt/missing");

        let err = VfsError::AlreadyExists { path: "/dest/file.txt".to_string() };
        assert_eq!(err.to_string(), "Path already exists: /dest/file.txt");

        let err = VfsError::SkippedEntry { path: PathBuf::from("lib/.git") };
        assert_eq!(err.to_string(), "Linking aborted, entry matched a skip rule: lib/.git");

        let err = VfsError::InvalidPath {
            path: "/a/../..".to_string(),
            reason: "escapes the root".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid path '/a/../..': escapes the root");

        let err = VfsError::TooManyInstancesOrProcesses { count: 5000, limit: 4096 };
        assert_eq!(err.to_string(), "Too many instances or processes: 5000 exceeds limit 4096");

        let err = VfsError::NotConnected;
        assert_eq!(err.to_string(), "Not connected to a virtual filesystem instance");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(VfsError::PathNotFound { path: String::new() }.code(), 3);
        assert_eq!(VfsError::AlreadyExists { path: String::new() }.code(), 183);
        assert_eq!(VfsError::invalid_parameters("count is null").code(), 87);
        assert_eq!(
            VfsError::ResourceExhaustion { message: String::new() }.code(),
            codes::ERROR_NOT_ENOUGH_MEMORY
        );
        assert_eq!(
            VfsError::TooManyInstancesOrProcesses { count: 1, limit: 0 }.code(),
            codes::ERROR_TOO_MANY_OPEN_FILES
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let vfs_err: VfsError = io_err.into();
        assert!(matches!(vfs_err, VfsError::Io { .. }));
        assert_eq!(vfs_err.code(), codes::ERROR_FILE_NOT_FOUND);
    }

    #[cfg(unix)]
    #[test]
    fn test_errno_mapped_to_win32_codes() {
        let cases = [
            (libc::ENOENT, codes::ERROR_FILE_NOT_FOUND),
            (libc::EACCES, codes::ERROR_ACCESS_DENIED),
            (libc::EEXIST, codes::ERROR_ALREADY_EXISTS),
            (libc::EIO, codes::ERROR_GEN_FAILURE),
        ];
        for (errno, expected) in cases {
            let err = VfsError::from(std::io::Error::from_raw_os_error(errno));
            assert_eq!(err.code(), expected, "errno {}", errno);
        }
    }
}
