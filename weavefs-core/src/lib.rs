//! # WeaveFS Core
//!
//! The core library for WeaveFS - a virtual filesystem overlay that lets a set
//! of cooperating processes see files from several real locations as if they
//! lived under one directory, without copying or moving anything on disk.
//!
//! ## Overview
//!
//! A controller creates a named instance, links real files and directories
//! into the instance's virtual tree and spawns processes hooked into it. The
//! interception layer inside those processes asks the instance where a path
//! really lives:
//!
//! - Reads of a linked path go to the real source
//! - Creates below a directory with a create-target land in that target
//! - Everything else falls through to the real filesystem
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use weavefs_core::{AccessIntent, LinkFlags, Vfs, VfsParameters};
//!
//! fn example() -> weavefs_core::Result<()> {
//!     let mut vfs = Vfs::new();
//!     vfs.create(&VfsParameters::new("game"))?;
//!     vfs.add_skip_directory(".git")?;
//!     vfs.link_directory_static("/mods/textures", "/game/data", LinkFlags::RECURSIVE)?;
//!
//!     let real = vfs.resolve("/game/data/sky.dds", AccessIntent::Read)?;
//!     println!("{:?}", real);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`types`]: Path normalization, link flags and instance parameters
//! - [`rules`]: Skip lists, executable blacklist and forced library loads
//! - [`tree`]: The virtual tree and its textual dump
//! - [`link`]: Planning and applying file and directory links
//! - [`monitor`]: Keeping linked directories in sync with their source
//! - [`instance`]: Named shared state and its storage backends
//! - [`coordinator`]: The [`Vfs`] handle every process works through
//! - [`logging`]: Forwarding `tracing` events to the shared log queue
//! - [`spawn`]: The process injection seam
//! - [`stats`]: Resolution and linking statistics

pub mod coordinator;
pub mod error;
pub mod instance;
pub mod link;
pub mod logging;
pub mod monitor;
pub mod rules;
pub mod spawn;
pub mod stats;
pub mod tree;
pub mod types;

pub use coordinator::{version_string, DumpSize, LogCancelHandle, LogWait, Vfs, VERSION};
pub use error::{Result, VfsError};
pub use logging::{init_logging, LogRecord};
pub use rules::RuleRegistry;
pub use spawn::{InjectionRequest, Injector, NullInjector};
pub use stats::StatsSnapshot;
pub use tree::{AccessIntent, NodeInfo, NodeKind};
pub use types::{
    CrashDumpsType, LinkFlags, LogLevel, SharedParameters, StorageKind, VfsParameters, VirtualPath,
};
