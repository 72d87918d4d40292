//! Process injection seam.
//!
//! Loading the interception layer into a new process is platform specific and
//! lives outside this crate. [`crate::Vfs::create_process_hooked`] spawns the
//! process, registers it with the instance and hands an [`InjectionRequest`] to
//! an [`Injector`].

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::Result;
use crate::types::SharedParameters;

/// Everything an injector needs to hook one process.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectionRequest {
    pub process_id: u32,
    /// Instance the hooked process has to connect to
    pub instance_name: String,
    pub parameters: SharedParameters,
    /// Libraries to force-load, in registration order
    pub libraries: Vec<PathBuf>,
}

/// Loads the interception layer into a freshly spawned process.
pub trait Injector: Send + Sync {
    /// Hooks the process described by `request`.
    ///
    /// An error makes the caller terminate the process and unregister it.
    fn inject(&self, request: &InjectionRequest) -> Result<()>;
}

/// Injector that does nothing, for controllers that only need registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullInjector;

impl Injector for NullInjector {
    fn inject(&self, _request: &InjectionRequest) -> Result<()> {
        Ok(())
    }
}

/// File name of the program a command runs, used for blacklist and forced
/// library lookups.
pub fn image_name(command: &Command) -> String {
    program_name(command.get_program())
}

fn program_name(program: &OsStr) -> String {
    Path::new(program)
        .file_name()
        .unwrap_or(program)
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_name() {
        assert_eq!(image_name(&Command::new("/usr/bin/game")), "game");
        assert_eq!(image_name(&Command::new("launcher.exe")), "launcher.exe");
    }

    #[test]
    fn test_null_injector_accepts() {
        let request = InjectionRequest {
            process_id: 1,
            instance_name: "t1".to_string(),
            parameters: SharedParameters::default(),
            libraries: Vec::new(),
        };
        assert!(NullInjector.inject(&request).is_ok());
    }
}
