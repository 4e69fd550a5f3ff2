//! File identity and timestamp state.
//!
//! Every file a build touches is interned to a small FileId, and the last
//! write time of each file is stat()ed at most once per run unless an
//! operation rewrites it.

use crate::canon::absolutize;
use crate::densemap::{DenseMap, Index};
use dashmap::DashMap;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Dense handle for an interned absolute path, unique within one
/// FileSystemState.  Zero is reserved as the invalid id.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);

impl FileId {
    pub fn from_raw(raw: u32) -> FileId {
        FileId(raw)
    }
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl Index for FileId {
    fn from_index(index: usize) -> Self {
        FileId(index as u32 + 1)
    }
    fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

/// Ticks since the Unix epoch at 100ns resolution.  Totally ordered and
/// comparable across arbitrary files.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Timestamp(i64);

const TICKS_PER_NANO: u128 = 100;

impl Timestamp {
    pub fn from_ticks(ticks: i64) -> Timestamp {
        Timestamp(ticks)
    }

    pub fn ticks(self) -> i64 {
        self.0
    }

    pub fn now() -> Timestamp {
        Timestamp::from(SystemTime::now())
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Timestamp {
        match time.duration_since(UNIX_EPOCH) {
            Ok(after) => Timestamp((after.as_nanos() / TICKS_PER_NANO) as i64),
            Err(err) => Timestamp(-((err.duration().as_nanos() / TICKS_PER_NANO) as i64)),
        }
    }
}

impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> SystemTime {
        let nanos = (ts.0.unsigned_abs() as u128 * TICKS_PER_NANO) as u64;
        if ts.0 >= 0 {
            UNIX_EPOCH + Duration::from_nanos(nanos)
        } else {
            UNIX_EPOCH - Duration::from_nanos(nanos)
        }
    }
}

/// MTime info gathered for a file.  This also models "file is absent",
/// which is an ordinary, cacheable observation and not an error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MTime {
    Missing,
    Stamp(Timestamp),
}

#[derive(Debug, Error)]
pub enum FsError {
    #[error("unknown file id {0}")]
    UnknownFileId(u32),
    #[error("stat {path:?}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The source of last-write-time observations, injected so tests can
/// substitute a fake for the real disk.
pub trait FileSystem: Send + Sync {
    /// stat() an on-disk path, producing its MTime.
    fn stat(&self, path: &Path) -> std::io::Result<MTime>;
}

pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn stat(&self, path: &Path) -> std::io::Result<MTime> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(MTime::Stamp(Timestamp::from(meta.modified()?))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(MTime::Missing),
            Err(err) => Err(err),
        }
    }
}

/// Owns the bijection between absolute paths and FileIds, plus a lazy
/// per-id cache of last write times.  Created once per invocation and not
/// itself persisted; serialized files carry paths and re-intern on load.
pub struct FileSystemState {
    fs: Box<dyn FileSystem>,
    paths: DenseMap<FileId, PathBuf>,
    ids: FxHashMap<PathBuf, FileId>,
    // Concurrently readable so parallel stat passes can fill it through
    // a shared reference; overrides go through &mut self.
    mtimes: DashMap<FileId, MTime>,
}

impl FileSystemState {
    pub fn new() -> Self {
        FileSystemState::with_fs(Box::new(RealFileSystem))
    }

    pub fn with_fs(fs: Box<dyn FileSystem>) -> Self {
        FileSystemState {
            fs,
            paths: DenseMap::default(),
            ids: FxHashMap::default(),
            mtimes: DashMap::new(),
        }
    }

    /// Intern a path, resolving relative paths against `working_dir`.
    /// Returns the existing id when the normalized path is already known;
    /// never fails.
    pub fn to_file_id(&mut self, path: &Path, working_dir: &Path) -> FileId {
        let canon = absolutize(path, working_dir);
        match self.ids.get(&canon) {
            Some(&id) => id,
            None => {
                let id = self.paths.push(canon.clone());
                self.ids.insert(canon, id);
                id
            }
        }
    }

    /// The path a FileId was interned from.
    pub fn path(&self, id: FileId) -> Result<&Path, FsError> {
        if id.raw() == 0 {
            return Err(FsError::UnknownFileId(0));
        }
        self.paths
            .lookup(id)
            .map(|p| p.as_path())
            .ok_or_else(|| FsError::UnknownFileId(id.raw()))
    }

    pub fn file_count(&self) -> usize {
        self.paths.len()
    }

    /// Last write time of a file, queried from the filesystem once and
    /// memoized.  Timestamps do not refresh within one run unless
    /// `set_mtime` or `restat` is called.
    pub fn stat(&self, id: FileId) -> Result<MTime, FsError> {
        if let Some(mtime) = self.mtimes.get(&id) {
            return Ok(*mtime);
        }
        let path = self.path(id)?;
        let mtime = self.fs.stat(path).map_err(|source| FsError::Stat {
            path: path.to_owned(),
            source,
        })?;
        self.mtimes.insert(id, mtime);
        Ok(mtime)
    }

    /// Explicitly override the cached mtime of a file.
    pub fn set_mtime(&mut self, id: FileId, mtime: MTime) -> Result<(), FsError> {
        self.path(id)?;
        self.mtimes.insert(id, mtime);
        Ok(())
    }

    /// Re-query the filesystem for a file, replacing the cached value.
    /// Used right after an operation completes so the cache reflects the
    /// outputs it just wrote.
    pub fn restat(&mut self, id: FileId) -> Result<MTime, FsError> {
        let path = self.path(id)?;
        let mtime = self.fs.stat(path).map_err(|source| FsError::Stat {
            path: path.to_owned(),
            source,
        })?;
        self.mtimes.insert(id, mtime);
        Ok(mtime)
    }

    /// Warm the mtime cache for a batch of files in parallel.
    pub fn prestat(&self, ids: &[FileId]) -> Result<(), FsError> {
        ids.par_iter().try_for_each(|&id| self.stat(id).map(|_| ()))
    }
}

impl Default for FileSystemState {
    fn default() -> Self {
        FileSystemState::new()
    }
}

/// Test doubles shared by the unit tests of several modules.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Fake filesystem with preset mtimes; counts stat calls.
    pub struct FakeFileSystem {
        files: Mutex<FxHashMap<PathBuf, MTime>>,
        stats: AtomicUsize,
    }

    impl FakeFileSystem {
        pub fn new() -> Self {
            FakeFileSystem {
                files: Mutex::new(FxHashMap::default()),
                stats: AtomicUsize::new(0),
            }
        }

        pub fn set(&self, path: &str, ticks: i64) {
            self.files.lock().unwrap().insert(
                PathBuf::from(path),
                MTime::Stamp(Timestamp::from_ticks(ticks)),
            );
        }

        pub fn remove(&self, path: &str) {
            self.files.lock().unwrap().remove(Path::new(path));
        }

        pub fn stat_count(&self) -> usize {
            self.stats.load(Ordering::SeqCst)
        }
    }

    impl FileSystem for FakeFileSystem {
        fn stat(&self, path: &Path) -> std::io::Result<MTime> {
            self.stats.fetch_add(1, Ordering::SeqCst);
            Ok(*self
                .files
                .lock()
                .unwrap()
                .get(path)
                .unwrap_or(&MTime::Missing))
        }
    }

    // Lets a test hold on to the fake while the state owns it too.
    impl FileSystem for Arc<FakeFileSystem> {
        fn stat(&self, path: &Path) -> std::io::Result<MTime> {
            (**self).stat(path)
        }
    }
}
