//
// The process-wide storage lock.
//
// Readers (GET, PROPFIND, REPORT, ...) share the lock; writers (PUT,
// DELETE, MKCOL, MOVE, PROPPATCH and hook execution) take it
// exclusively. Within the process this is a tokio RwLock; across
// processes it is backed by an advisory flock on `.Radicale.lock`
// inside the storage folder.
//
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

pub struct StorageLock {
    rw: Arc<RwLock<()>>,
    lock_path: PathBuf,
}

enum RwGuard {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Held for the duration of one request. Dropping releases both the
/// in-process lock and the file lock.
pub struct LockGuard {
    _rw: RwGuard,
    _file: Option<fs::File>,
}

impl StorageLock {
    pub fn new(folder: &Path) -> io::Result<StorageLock> {
        fs::create_dir_all(folder)?;
        let lock_path = folder.join(".Radicale.lock");
        // make sure the lock file exists.
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&lock_path)?;
        Ok(StorageLock {
            rw: Arc::new(RwLock::new(())),
            lock_path,
        })
    }

    pub async fn acquire(&self, exclusive: bool) -> io::Result<LockGuard> {
        let rw = if exclusive {
            RwGuard::Write(self.rw.clone().write_owned().await)
        } else {
            RwGuard::Read(self.rw.clone().read_owned().await)
        };
        let path = self.lock_path.clone();
        // flock may block on other processes; keep it off the runtime.
        let file = tokio::task::spawn_blocking(move || flock_file(&path, exclusive))
            .await
            .map_err(|e| io::Error::other(e))??;
        Ok(LockGuard { _rw: rw, _file: file })
    }
}

#[cfg(unix)]
fn flock_file(path: &Path, exclusive: bool) -> io::Result<Option<fs::File>> {
    use std::os::unix::io::AsRawFd;
    let file = fs::OpenOptions::new().read(true).open(path)?;
    let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
    let ret = unsafe { libc::flock(file.as_raw_fd(), op) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Some(file))
}

#[cfg(not(unix))]
fn flock_file(_path: &Path, _exclusive: bool) -> io::Result<Option<fs::File>> {
    Ok(None)
}
