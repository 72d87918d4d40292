use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use weavefs_core::instance::FileBackend;
use weavefs_core::{
    AccessIntent, LinkFlags, LogLevel, StorageKind, Vfs, VfsError, VfsParameters,
};

fn file_params(name: &str, dir: &Path) -> VfsParameters {
    VfsParameters::new(name).with_storage(StorageKind::SharedFile {
        directory: dir.to_path_buf(),
    })
}

#[test]
fn test_two_handles_share_file_backed_state() {
    let storage = TempDir::new().unwrap();
    let lib = TempDir::new().unwrap();
    fs::write(lib.path().join("a.txt"), "a").unwrap();

    let mut controller = Vfs::with_process_id(10);
    controller
        .create(&file_params("shared-file", storage.path()).with_log_level(LogLevel::Debug))
        .unwrap();
    controller
        .link_directory_static(lib.path(), "/mnt", LinkFlags::RECURSIVE)
        .unwrap();

    let mut hooked = Vfs::with_process_id(11);
    hooked
        .connect(&file_params("shared-file", storage.path()))
        .unwrap();
    assert_eq!(
        hooked.resolve("/mnt/a.txt", AccessIntent::Read).unwrap(),
        Some(lib.path().join("a.txt"))
    );
    assert_eq!(hooked.parameters().unwrap().log_level, LogLevel::Debug);
    assert_eq!(controller.process_list().unwrap(), vec![10, 11]);

    hooked.add_skip_directory(".git").unwrap();
    assert!(controller.rules().unwrap().should_skip_directory(".git"));
    assert_eq!(hooked.dump().unwrap(), controller.dump().unwrap());

    let state_path = FileBackend::open(storage.path(), "shared-file")
        .unwrap()
        .state_path()
        .to_path_buf();
    assert!(state_path.exists());

    controller.disconnect().unwrap();
    assert_eq!(hooked.process_list().unwrap(), vec![11]);
    assert!(hooked.lookup("/mnt").unwrap().is_some());

    hooked.disconnect().unwrap();
    assert!(!state_path.exists());
}

#[test]
fn test_create_resets_existing_instance_but_keeps_processes() {
    let storage = TempDir::new().unwrap();
    let lib = TempDir::new().unwrap();
    fs::write(lib.path().join("a.txt"), "a").unwrap();

    let mut first = Vfs::with_process_id(20);
    first.create(&file_params("shared-reset", storage.path())).unwrap();
    first.add_skip_file_suffix(".tmp").unwrap();
    first
        .link_directory_static(lib.path(), "/mnt", LinkFlags::RECURSIVE)
        .unwrap();

    let mut second = Vfs::with_process_id(21);
    second.create(&file_params("shared-reset", storage.path())).unwrap();

    assert_eq!(first.dump().unwrap(), "/\n");
    assert!(!first.rules().unwrap().should_skip_file("x.tmp"));
    assert_eq!(second.process_list().unwrap(), vec![20, 21]);
}

#[test]
fn test_readers_never_see_partial_link() {
    let lib = TempDir::new().unwrap();
    const ENTRIES: usize = 64;
    for i in 0..ENTRIES {
        fs::write(lib.path().join(format!("f{:03}.txt", i)), "x").unwrap();
    }
    let params = VfsParameters::new("shared-concurrent").with_storage(StorageKind::InProcess);

    let mut writer = Vfs::with_process_id(30);
    writer.create(&params).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|i| {
            let params = params.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut reader = Vfs::with_process_id(100 + i);
                reader.connect(&params).unwrap();
                let mut observed = Vec::new();
                while !done.load(Ordering::Acquire) {
                    let count = reader
                        .list_directory("/mods")
                        .unwrap()
                        .map(|children| children.len())
                        .unwrap_or(0);
                    observed.push(count);
                }
                observed
            })
        })
        .collect();

    for _ in 0..20 {
        writer
            .link_directory_static(lib.path(), "/mods", LinkFlags::RECURSIVE)
            .unwrap();
        writer.clear_virtual_mappings().unwrap();
    }
    writer
        .link_directory_static(lib.path(), "/mods", LinkFlags::RECURSIVE)
        .unwrap();
    done.store(true, Ordering::Release);

    for reader in readers {
        for count in reader.join().unwrap() {
            assert!(count == 0 || count == ENTRIES, "saw {} entries", count);
        }
    }
}

#[test]
fn test_process_limit() {
    let mut vfs = Vfs::with_process_id(1);
    vfs.create(&VfsParameters::new("shared-limit").with_storage(StorageKind::InProcess))
        .unwrap();

    for pid in 2..=weavefs_core::instance::MAX_PROCESSES as u32 {
        vfs.register_process(pid).unwrap();
    }
    assert_eq!(vfs.process_list().unwrap().len(), weavefs_core::instance::MAX_PROCESSES);
    assert!(matches!(
        vfs.register_process(999_999),
        Err(VfsError::TooManyInstancesOrProcesses { .. })
    ));
    vfs.register_process(2).unwrap();

    assert!(vfs.unregister_process(2).unwrap());
    vfs.register_process(999_999).unwrap();
}
