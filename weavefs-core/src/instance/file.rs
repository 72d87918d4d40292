//! File-backed segments shared between OS processes.
//!
//! An instance named `N` in directory `D` uses two files:
//!
//! - `D/<N>.lock` holds the exclusive advisory lock (via `fs2`). The OS
//!   releases it when the holder exits, including when it crashes, so an
//!   abandoned lock is simply acquired by the next caller.
//! - `D/<N>.state` holds the state: a fixed header followed by the bincode
//!   encoded [`SharedState`]. Writers replace it through a temporary file and a
//!   rename, so readers never observe a torn write.

use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{SharedState, StateBackend};
use crate::error::{Result, VfsError};

const MAGIC: [u8; 4] = *b"WVFS";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8 + 4 + 8;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Parsed state file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    generation: u64,
    checksum: u32,
    payload_len: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&MAGIC);
        bytes[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.generation.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.payload_len.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < HEADER_LEN {
            return Err("truncated header".to_string());
        }
        if bytes[0..4] != MAGIC {
            return Err("bad magic".to_string());
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != FORMAT_VERSION {
            return Err(format!("unsupported format version {}", version));
        }
        let mut generation = [0u8; 8];
        generation.copy_from_slice(&bytes[8..16]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[16..20]);
        let mut payload_len = [0u8; 8];
        payload_len.copy_from_slice(&bytes[20..28]);
        Ok(Self {
            generation: u64::from_le_bytes(generation),
            checksum: u32::from_le_bytes(checksum),
            payload_len: u64::from_le_bytes(payload_len),
        })
    }
}

/// Unlocks the lock file when dropped.
struct LockGuard<'a> {
    file: &'a File,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(error = %e, "Failed to release instance lock");
        }
    }
}

struct Cached {
    header: Header,
    state: SharedState,
}

/// Backend storing the state in a directory visible to every process.
pub struct FileBackend {
    name: String,
    directory: PathBuf,
    state_path: PathBuf,
    lock_file: Mutex<File>,
    cache: Mutex<Option<Cached>>,
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("name", &self.name)
            .field("state_path", &self.state_path)
            .finish()
    }
}

impl FileBackend {
    /// Opens the named segment in `directory`, creating the directory and the
    /// lock file as needed.
    pub fn open(directory: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(directory)?;
        let stem = file_stem(name);
        let lock_path = directory.join(format!("{}.lock", stem));
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        debug!(instance = name, path = %lock_path.display(), "Opened file-backed segment");
        Ok(Self {
            name: name.to_string(),
            directory: directory.to_path_buf(),
            state_path: directory.join(format!("{}.state", stem)),
            lock_file: Mutex::new(lock_file),
            cache: Mutex::new(None),
        })
    }

    /// Path of the state file.
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Runs `f` with the cross-process lock held.
    fn locked<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let file = self.lock_file.lock();
        file.lock_exclusive()?;
        let _guard = LockGuard { file: &file };
        f()
    }

    fn read_header(&self) -> Result<Option<Header>> {
        let mut file = match File::open(&self.state_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut bytes = [0u8; HEADER_LEN];
        match file.read_exact(&mut bytes) {
            Ok(()) => Ok(Header::decode(&bytes).ok()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads the state into the cache unless the cache is current.
    /// Must be called with the lock held.
    fn load(&self, cache: &mut Option<Cached>) -> Result<()> {
        let bytes = match fs::read(&self.state_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                *cache = None;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match self.decode(&bytes) {
            Ok((header, state)) => {
                *cache = Some(Cached { header, state });
            }
            Err(reason) => {
                warn!(instance = %self.name, %reason, "Discarding unreadable shared state");
                *cache = None;
            }
        }
        Ok(())
    }

    fn load_if_stale(&self, cache: &mut Option<Cached>) -> Result<()> {
        let on_disk = self.read_header()?;
        let current = cache.as_ref().map(|cached| cached.header);
        if on_disk.is_none() || on_disk != current {
            self.load(cache)?;
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> std::result::Result<(Header, SharedState), String> {
        let header = Header::decode(bytes)?;
        let payload = &bytes[HEADER_LEN..];
        if payload.len() as u64 != header.payload_len {
            return Err("payload length mismatch".to_string());
        }
        if crc32fast::hash(payload) != header.checksum {
            return Err("checksum mismatch".to_string());
        }
        let state: SharedState = bincode::deserialize(payload).map_err(|e| e.to_string())?;
        Ok((header, state))
    }

    fn store(&self, state: &SharedState) -> Result<Header> {
        let payload = bincode::serialize(state).map_err(|e| VfsError::CorruptState {
            instance: self.name.clone(),
            reason: e.to_string(),
        })?;
        let header = Header {
            generation: state.generation,
            checksum: crc32fast::hash(&payload),
            payload_len: payload.len() as u64,
        };

        let temp_path = self
            .directory
            .join(format!(".{}.{}.tmp", file_stem(&self.name), Uuid::new_v4()));
        let result = (|| -> std::io::Result<()> {
            let mut temp = File::create(&temp_path)?;
            temp.write_all(&header.encode())?;
            temp.write_all(&payload)?;
            temp.sync_all()?;
            fs::rename(&temp_path, &self.state_path)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(header)
    }
}

impl StateBackend for FileBackend {
    fn kind(&self) -> &'static str {
        "shared-file"
    }

    fn read(&self, f: &mut dyn FnMut(&SharedState)) -> Result<()> {
        self.locked(|| {
            let mut cache = self.cache.lock();
            self.load_if_stale(&mut cache)?;
            match cache.as_ref() {
                Some(cached) => f(&cached.state),
                None => f(&SharedState::default()),
            }
            Ok(())
        })
    }

    fn write(&self, f: &mut dyn FnMut(&mut SharedState) -> bool) -> Result<()> {
        self.locked(|| {
            let mut cache = self.cache.lock();
            self.load_if_stale(&mut cache)?;
            let (header, mut state) = match cache.take() {
                Some(cached) => (Some(cached.header), cached.state),
                None => (None, SharedState::default()),
            };
            if f(&mut state) {
                let header = self.store(&state)?;
                *cache = Some(Cached { header, state });
            } else if let Some(header) = header {
                *cache = Some(Cached { header, state });
            }
            Ok(())
        })
    }

    fn wait_for_change(&self, seen: u64, timeout: Duration) -> Result<u64> {
        let deadline = Instant::now() + timeout;
        loop {
            let generation = self.read_header()?.map(|header| header.generation).unwrap_or(0);
            if generation != seen {
                return Ok(generation);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(generation);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn destroy(&self) -> Result<()> {
        self.locked(|| {
            match fs::remove_file(&self.state_path) {
                Ok(()) => debug!(instance = %self.name, "Removed shared state file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            *self.cache.lock() = None;
            Ok(())
        })
    }

    fn destroy_if_unused(&self) -> Result<bool> {
        self.locked(|| {
            let mut cache = self.cache.lock();
            self.load_if_stale(&mut cache)?;
            let in_use = cache
                .as_ref()
                .map(|cached| !cached.state.processes.is_empty())
                .unwrap_or(false);
            if in_use {
                return Ok(false);
            }
            match fs::remove_file(&self.state_path) {
                Ok(()) => debug!(instance = %self.name, "Removed unused shared state file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            *cache = None;
            Ok(true)
        })
    }
}

/// File name stem for an instance name: safe characters kept, everything else
/// replaced, plus a checksum of the full name so distinct names never collide.
fn file_stem(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect();
    format!("{}-{:08x}", safe, crc32fast::hash(name.as_bytes()))
}
