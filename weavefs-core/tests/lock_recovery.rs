use fs2::FileExt;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use weavefs_core::instance::FileBackend;
use weavefs_core::{StorageKind, Vfs, VfsParameters};

const HOLD_LOCK_ENV: &str = "WEAVEFS_TEST_HOLD_LOCK";
const LOCK_HELD: &str = "weavefs-lock-held";

/// Runs as the lock holder when re-executed by
/// `test_lock_recovers_after_holder_dies`; a no-op otherwise.
#[test]
fn test_hold_lock_in_child() {
    let Ok(path) = std::env::var(HOLD_LOCK_ENV) else {
        return;
    };
    let file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.lock_exclusive().unwrap();
    println!("{}", LOCK_HELD);
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

#[test]
fn test_lock_recovers_after_holder_dies() {
    let storage = TempDir::new().unwrap();
    let params = VfsParameters::new("lock-recovery").with_storage(StorageKind::SharedFile {
        directory: storage.path().to_path_buf(),
    });
    let lock_path: PathBuf = FileBackend::open(storage.path(), "lock-recovery")
        .unwrap()
        .state_path()
        .with_extension("lock");
    assert!(lock_path.exists());

    let mut holder = Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "test_hold_lock_in_child", "--nocapture", "--test-threads=1"])
        .env(HOLD_LOCK_ENV, &lock_path)
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let stdout = holder.stdout.take().unwrap();
    let held = BufReader::new(stdout)
        .lines()
        .map_while(|line| line.ok())
        .any(|line| line.contains(LOCK_HELD));
    assert!(held, "lock holder exited early");

    let (tx, rx) = mpsc::channel();
    let waiter = thread::spawn(move || {
        let mut vfs = Vfs::with_process_id(77);
        let result = vfs
            .connect(&params)
            .and_then(|_| vfs.add_skip_directory(".git"))
            .and_then(|_| vfs.rules());
        tx.send(result.map(|rules| rules.should_skip_directory(".git")))
            .unwrap();
    });

    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    holder.kill().unwrap();
    holder.wait().unwrap();

    let outcome = rx.recv_timeout(Duration::from_secs(10)).expect("lock not released");
    assert!(outcome.unwrap());
    waiter.join().unwrap();
}
