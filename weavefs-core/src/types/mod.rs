// Module declarations
pub mod path;
pub mod flags;
pub mod config;

// Re-export all types from submodules
pub use path::{fold_name, PathSegment, VirtualPath};
pub use flags::LinkFlags;
pub use config::{CrashDumpsType, LogLevel, SharedParameters, StorageKind, VfsParameters};
