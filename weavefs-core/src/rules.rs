//! Skip lists, executable blacklist and forced library loads.
//!
//! The registry is part of an instance's shared state. It is consulted when a
//! link is applied and when a process is spawned; changing it never rewrites
//! a tree that was already built.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::types::fold_name;

/// Rule lists shared by every process attached to an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleRegistry {
    skip_file_suffixes: BTreeSet<String>,
    skip_directories: BTreeSet<String>,
    executable_blacklist: BTreeSet<String>,
    forced_libraries: BTreeMap<String, Vec<PathBuf>>,
}

impl RuleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file suffix to skip during linking.
    ///
    /// `.txt` and `some_file.txt` are both valid suffixes; matching is a
    /// case-insensitive "name ends with" test, not an extension comparison.
    pub fn add_skip_file_suffix(&mut self, suffix: &str) {
        if !suffix.is_empty() {
            self.skip_file_suffixes.insert(fold_name(suffix));
        }
    }

    /// Clears the file suffix skip list.
    pub fn clear_skip_file_suffixes(&mut self) {
        self.skip_file_suffixes.clear();
    }

    /// Adds a directory name to skip during directory linking, at any depth.
    pub fn add_skip_directory(&mut self, name: &str) {
        if !name.is_empty() {
            self.skip_directories.insert(fold_name(name));
        }
    }

    /// Clears the directory skip list.
    pub fn clear_skip_directories(&mut self) {
        self.skip_directories.clear();
    }

    /// Adds an executable that must not be exposed to the virtual filesystem.
    pub fn blacklist_executable(&mut self, executable: &str) {
        if !executable.is_empty() {
            self.executable_blacklist.insert(fold_name(executable));
        }
    }

    /// Clears the executable blacklist.
    pub fn clear_executable_blacklist(&mut self) {
        self.executable_blacklist.clear();
    }

    /// Registers a library to load when a process with the given image name
    /// is hooked. Several libraries per process are kept in insertion order.
    pub fn force_load_library(&mut self, process_name: &str, library: impl Into<PathBuf>) {
        let library = library.into();
        let entry = self.forced_libraries.entry(fold_name(process_name)).or_default();
        if !entry.contains(&library) {
            entry.push(library);
        }
    }

    /// Clears all forced library loads.
    pub fn clear_library_force_loads(&mut self) {
        self.forced_libraries.clear();
    }

    /// Returns true if a file with this name is excluded from linking.
    pub fn should_skip_file(&self, file_name: &str) -> bool {
        if self.skip_file_suffixes.is_empty() {
            return false;
        }
        let folded = fold_name(file_name);
        self.skip_file_suffixes
            .iter()
            .any(|suffix| folded.ends_with(suffix.as_str()))
    }

    /// Returns true if a directory with this name is excluded from linking.
    pub fn should_skip_directory(&self, dir_name: &str) -> bool {
        !self.skip_directories.is_empty() && self.skip_directories.contains(&fold_name(dir_name))
    }

    /// Returns true if the executable is blacklisted.
    ///
    /// An entry matches either the executable's file name or a trailing part
    /// of its full path, so both `game.exe` and `bin/game.exe` work.
    pub fn is_executable_blacklisted(&self, executable: &Path) -> bool {
        if self.executable_blacklist.is_empty() {
            return false;
        }
        let full = fold_name(&executable.to_string_lossy()).replace('\\', "/");
        let file_name = executable
            .file_name()
            .map(|name| fold_name(&name.to_string_lossy()))
            .unwrap_or_default();

        self.executable_blacklist.iter().any(|entry| {
            let entry = entry.replace('\\', "/");
            entry == file_name || full.ends_with(&format!("/{}", entry)) || full == entry
        })
    }

    /// Libraries to force-load into a process with this image name.
    pub fn libraries_for(&self, process_name: &str) -> Vec<PathBuf> {
        self.forced_libraries
            .get(&fold_name(process_name))
            .cloned()
            .unwrap_or_default()
    }

    /// Registered skip suffixes, folded.
    pub fn skip_file_suffixes(&self) -> impl Iterator<Item = &str> {
        self.skip_file_suffixes.iter().map(String::as_str)
    }

    /// Registered skip directory names, folded.
    pub fn skip_directories(&self) -> impl Iterator<Item = &str> {
        self.skip_directories.iter().map(String::as_str)
    }

    /// Blacklisted executables, folded.
    pub fn executable_blacklist(&self) -> impl Iterator<Item = &str> {
        self.executable_blacklist.iter().map(String::as_str)
    }

    /// All forced library loads keyed by folded process name.
    pub fn forced_libraries(&self) -> &BTreeMap<String, Vec<PathBuf>> {
        &self.forced_libraries
    }
}
