#![cfg(unix)]

use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Command;
use weavefs_core::{
    InjectionRequest, Injector, StorageKind, Vfs, VfsError, VfsParameters,
};

#[derive(Default)]
struct RecordingInjector {
    requests: Mutex<Vec<InjectionRequest>>,
}

impl Injector for RecordingInjector {
    fn inject(&self, request: &InjectionRequest) -> weavefs_core::Result<()> {
        self.requests.lock().push(request.clone());
        Ok(())
    }
}

struct RefusingInjector;

impl Injector for RefusingInjector {
    fn inject(&self, _request: &InjectionRequest) -> weavefs_core::Result<()> {
        Err(VfsError::InvalidParameters {
            message: "architecture mismatch".to_string(),
        })
    }
}

fn controller(name: &str) -> Vfs {
    let mut vfs = Vfs::with_process_id(std::process::id());
    vfs.create(&VfsParameters::new(name).with_storage(StorageKind::InProcess))
        .unwrap();
    vfs
}

fn sleeper() -> Command {
    let mut command = Command::new("sleep");
    command.arg("5");
    command
}

#[test]
fn test_hooked_process_is_registered_and_injected() {
    let vfs = controller("spawn-hooked");
    vfs.force_load_library("sleep", "/opt/hooks/libweave.so").unwrap();
    let injector = RecordingInjector::default();

    let mut child = vfs.create_process_hooked(&mut sleeper(), &injector).unwrap();
    let pid = child.id();
    assert!(vfs.process_list().unwrap().contains(&pid));

    let requests = injector.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].process_id, pid);
    assert_eq!(requests[0].instance_name, "spawn-hooked");
    assert_eq!(requests[0].libraries, vec![PathBuf::from("/opt/hooks/libweave.so")]);

    child.kill().unwrap();
    child.wait().unwrap();
    assert_eq!(vfs.reap_exited_processes().unwrap(), vec![pid]);
}

#[test]
fn test_blacklisted_executable_runs_unhooked() {
    let vfs = controller("spawn-blacklist");
    vfs.blacklist_executable("SLEEP").unwrap();
    let injector = RecordingInjector::default();

    let mut child = vfs.create_process_hooked(&mut sleeper(), &injector).unwrap();
    assert!(!vfs.process_list().unwrap().contains(&child.id()));
    assert!(injector.requests.lock().is_empty());

    child.kill().unwrap();
    child.wait().unwrap();
}

#[test]
fn test_failed_injection_terminates_process() {
    let vfs = controller("spawn-refused");

    let result = vfs.create_process_hooked(&mut sleeper(), &RefusingInjector);
    let Err(VfsError::Injection { process_id, message }) = result else {
        panic!("expected an injection error");
    };
    assert!(message.contains("architecture mismatch"));
    assert!(!vfs.process_list().unwrap().contains(&process_id));
}
