use crate::SpawnError;
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Diagnostic payload stored inside the lock marker.
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    created_at: String,
}

/// Marker path for a root directory: `<dir>/../.burrow.<basename>.lock`.
pub fn lock_path_for(root: &Path) -> PathBuf {
    let parent = root.parent().unwrap_or_else(|| Path::new("/"));
    let basename = root
        .file_name()
        .map_or_else(|| "root".to_owned(), |n| n.to_string_lossy().into_owned());
    parent.join(format!(".burrow.{basename}.lock"))
}

/// Advisory per-root lock held for the lifetime of one invocation.
///
/// This is a marker-file convention, not an OS lock: the marker outlives a
/// crashed holder on purpose, so leftovers are visible and `--unlock` can
/// clear them.
#[derive(Debug)]
pub struct LockToken {
    path: PathBuf,
    released: bool,
}

impl LockToken {
    /// Create the marker, failing with `LockConflict` if it already exists.
    pub fn acquire(root: &Path) -> Result<Self, SpawnError> {
        let path = lock_path_for(root);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let info = LockInfo {
                    pid: std::process::id(),
                    created_at: chrono::Utc::now().to_rfc3339(),
                };
                if let Ok(payload) = serde_json::to_string(&info) {
                    let _ = file.write_all(payload.as_bytes());
                }
                debug!("acquired lock {}", path.display());
                Ok(Self {
                    path,
                    released: false,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|raw| serde_json::from_str::<LockInfo>(&raw).ok());
                let detail = match holder {
                    Some(info) => format!(" (held by pid {} since {})", info.pid, info.created_at),
                    None => String::new(),
                };
                Err(SpawnError::LockConflict(format!(
                    "root '{}' is already locked{detail}; use --unlock if the holder is gone",
                    root.display()
                )))
            }
            Err(e) => Err(SpawnError::Io(e)),
        }
    }

    /// Remove the marker. Removing an already-removed marker is success.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("released lock {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("could not remove lock {}: {e}", self.path.display()),
        }
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Unconditionally release the lock for `root`; a missing marker is success.
pub fn release_root(root: &Path) -> Result<(), SpawnError> {
    let path = lock_path_for(root);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            debug!("removed lock {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SpawnError::Io(e)),
    }
}
