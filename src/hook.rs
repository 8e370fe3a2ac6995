//
// The storage hook: an external command spawned after every successful
// write, with the storage folder as working directory and the
// authenticated user in the environment. It runs while the exclusive
// lock is still held. Failures are logged, never surfaced to the
// client. Process groups are tracked so shutdown can kill stragglers.
//
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::process::Command;

pub struct Hook {
    command: String,
    cwd: PathBuf,
    pgids: Arc<Mutex<HashSet<i32>>>,
}

impl Hook {
    /// `None` when no hook is configured.
    pub fn new(command: &str, storage_folder: &str) -> Option<Arc<Hook>> {
        if command.trim().is_empty() {
            return None;
        }
        Some(Arc::new(Hook {
            command: command.to_string(),
            cwd: PathBuf::from(storage_folder),
            pgids: Arc::new(Mutex::new(HashSet::new())),
        }))
    }

    /// Run the hook and wait for it. Must be called with the exclusive
    /// storage lock held.
    pub async fn run(&self, user: &str) {
        debug!("running storage hook for user {:?}", user);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&self.cwd)
            .env("CARILLON_USER", user);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!("storage hook failed to start: {}", e);
                return;
            }
        };
        let pgid = child.id().map(|id| id as i32);
        if let Some(pgid) = pgid {
            self.pgids.lock().insert(pgid);
        }
        match child.wait().await {
            Ok(status) if status.success() => debug!("storage hook finished"),
            Ok(status) => warn!("storage hook exited with {}", status),
            Err(e) => warn!("storage hook failed: {}", e),
        }
        if let Some(pgid) = pgid {
            self.pgids.lock().remove(&pgid);
        }
    }

    /// Kill every hook process group still running (server shutdown).
    pub fn kill_all(&self) {
        let pgids: Vec<i32> = self.pgids.lock().drain().collect();
        for pgid in pgids {
            warn!("killing storage hook process group {}", pgid);
            #[cfg(unix)]
            unsafe {
                libc::kill(-pgid, libc::SIGTERM);
            }
        }
    }
}
