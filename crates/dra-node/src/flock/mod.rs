//! The lock manager serializing hardware-mutating sections.
//!
//! Two layers: a per-name async mutex serializes tasks within this
//! process, and an advisory `flock(2)` on a lock file serializes against
//! other processes (a concurrently invoked kubelet plugin, a debugging
//! CLI). The in-process mutex is taken first so only one task per name
//! ever contends for the OS lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dra_core::OpContext;
use tracing::trace;

#[cfg(target_family = "unix")]
use nix::fcntl::{Flock, FlockArg};

/// Holds a named lock until dropped.
pub struct LockGuard {
    #[cfg(target_family = "unix")]
    _flock: Flock<std::fs::File>,
    _permit: tokio::sync::OwnedMutexGuard<()>,
}

/// Process-wide and cross-process lock manager keyed by name.
pub struct FileLocker {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileLocker {
    /// A locker placing its lock files under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileLocker {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquires the named lock, waiting as long as it takes. Cancellation
    /// is honored before acquisition, not while blocked on the OS lock.
    pub async fn lock(&self, ctx: &OpContext, name: &str) -> anyhow::Result<LockGuard> {
        ctx.err_if_cancelled()?;
        let mutex = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let permit = mutex.lock_owned().await;
        ctx.err_if_cancelled()?;
        trace!(name, "acquired in-process lock");

        #[cfg(target_family = "unix")]
        {
            let path = self.dir.join(format!("{}.lock", name));
            let flock = tokio::task::spawn_blocking(move || -> anyhow::Result<Flock<std::fs::File>> {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(&path)?;
                Flock::lock(file, FlockArg::LockExclusive)
                    .map_err(|(_, errno)| anyhow::anyhow!("flock {}: {}", path.display(), errno))
            })
            .await??;
            trace!(name, "acquired file lock");
            Ok(LockGuard {
                _flock: flock,
                _permit: permit,
            })
        }

        #[cfg(not(target_family = "unix"))]
        {
            Ok(LockGuard { _permit: permit })
        }
    }
}
