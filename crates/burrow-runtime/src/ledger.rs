use crate::privilege::Elevator;
use crate::SpawnError;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One mount created by this invocation, appended the instant the mount
/// command succeeds and never before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub path: PathBuf,
    pub created_by: &'static str,
}

/// Check if a path is currently a mount point by inspecting /proc/mounts.
fn is_mounted(path: &Path) -> bool {
    let canonical = match std::fs::canonicalize(path) {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => path.to_string_lossy().to_string(),
    };
    match std::fs::read_to_string("/proc/mounts") {
        Ok(mounts) => mounts
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(&canonical)),
        Err(_) => false,
    }
}

fn unmount(elevator: &Elevator, path: &Path) {
    if !elevator.is_dry_run() && !is_mounted(path) {
        debug!("{} not mounted, skipping", path.display());
        return;
    }
    match elevator.run_captured("umount", &[path.to_string_lossy().into_owned()]) {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // A mount that disappeared between the check and the call is
            // success, not an error.
            if !stderr.contains("not mounted") {
                warn!("umount {} failed: {}", path.display(), stderr.trim());
            }
        }
        Err(e) => warn!("umount {}: {e}", path.display()),
    }
}

/// The single source of truth for what this invocation must unwind.
///
/// Built incrementally during setup and drained exactly once during
/// teardown; draining twice is a no-op.
#[derive(Debug, Default)]
pub struct Ledger {
    mounts: Vec<MountRecord>,
    runtime_dir: Option<PathBuf>,
    drained: bool,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_mount(&mut self, path: impl Into<PathBuf>, created_by: &'static str) {
        let record = MountRecord {
            path: path.into(),
            created_by,
        };
        debug!("ledger: {} ({})", record.path.display(), record.created_by);
        self.mounts.push(record);
    }

    pub fn mounts(&self) -> &[MountRecord] {
        &self.mounts
    }

    /// Create (or return) the invocation's private runtime directory, used
    /// to stage sockets, cookies, and the Xauthority copy.
    pub fn stage_runtime_dir(&mut self) -> Result<PathBuf, SpawnError> {
        if let Some(dir) = &self.runtime_dir {
            return Ok(dir.clone());
        }
        let base = std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        #[allow(deprecated)]
        let dir = tempfile::Builder::new()
            .prefix("burrow.")
            .tempdir_in(base)?
            .into_path();
        debug!("staged runtime dir {}", dir.display());
        self.runtime_dir = Some(dir.clone());
        Ok(dir)
    }

    pub fn runtime_dir(&self) -> Option<&Path> {
        self.runtime_dir.as_deref()
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    /// Unwind everything: unmount recorded paths most-recently-created
    /// first, then remove the runtime directory. Idempotent.
    pub fn drain(&mut self, elevator: &Elevator) {
        if self.drained {
            return;
        }
        self.drained = true;

        for record in self.mounts.drain(..).rev() {
            unmount(elevator, &record.path);
        }

        if let Some(dir) = self.runtime_dir.take() {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => debug!("removed runtime dir {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("could not remove runtime dir {}: {e}", dir.display()),
            }
        }
    }
}

/// Scoped finalizer guaranteeing the ledger drains on every exit path.
#[derive(Debug)]
pub struct CleanupGuard {
    pub ledger: Ledger,
    elevator: Elevator,
}

impl CleanupGuard {
    pub fn new(elevator: Elevator) -> Self {
        Self {
            ledger: Ledger::new(),
            elevator,
        }
    }

    pub fn drain_now(&mut self) {
        self.ledger.drain(&self.elevator);
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.drain_now();
    }
}

/// The well-known mountpoints a crashed invocation can leave under a root,
/// in unmount order (nested before their parents).
const STALE_MOUNTPOINTS: &[&str] = &[
    "dev/pts",
    "dev/shm",
    "dev",
    "proc",
    "sys",
    "tmp/.X11-unix",
    "etc/resolv.conf",
    "etc/localtime",
    "run/burrow",
];

/// Unmount leftovers of a previous, abnormally-terminated invocation.
///
/// Works without the original ledger: every mountpoint under `root` found in
/// /proc/mounts is unmounted deepest-first, then the conventional paths are
/// swept as a fallback for when /proc/mounts is unavailable.
pub fn sweep_stale(root: &Path, elevator: &Elevator) {
    let root_str = root.to_string_lossy();
    let prefix = format!("{}/", root_str.trim_end_matches('/'));

    let mut live: Vec<PathBuf> = std::fs::read_to_string("/proc/mounts")
        .map(|mounts| {
            mounts
                .lines()
                .filter_map(|line| line.split_whitespace().nth(1))
                .filter(|mp| mp.starts_with(&prefix))
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default();
    // Deepest first, so nested mounts unwind before their parents.
    live.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

    for path in &live {
        unmount(elevator, path);
    }

    for rel in STALE_MOUNTPOINTS {
        let path = root.join(rel);
        if !live.contains(&path) {
            unmount(elevator, &path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::{Elevation, Elevator};

    fn dry() -> Elevator {
        Elevator::new(Elevation::DryRun)
    }

    #[test]
    fn drain_is_idempotent() {
        let mut ledger = Ledger::new();
        ledger.record_mount("/srv/root/proc", "proc");
        ledger.drain(&dry());
        assert!(ledger.is_drained());
        assert!(ledger.mounts().is_empty());
        // Second drain is a no-op, never an error.
        ledger.drain(&dry());
    }

    #[test]
    fn drain_removes_runtime_dir() {
        let _env = crate::testenv::lock();
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("XDG_RUNTIME_DIR", tmp.path());
        let mut ledger = Ledger::new();
        let dir = ledger.stage_runtime_dir().unwrap();
        assert!(dir.exists());
        assert!(dir.starts_with(tmp.path()));

        ledger.drain(&dry());
        assert!(!dir.exists());
    }

    #[test]
    fn stage_runtime_dir_is_memoized() {
        let _env = crate::testenv::lock();
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("XDG_RUNTIME_DIR", tmp.path());
        let mut ledger = Ledger::new();
        let first = ledger.stage_runtime_dir().unwrap();
        let second = ledger.stage_runtime_dir().unwrap();
        assert_eq!(first, second);
        ledger.drain(&dry());
    }

    #[test]
    fn records_keep_creation_order() {
        let mut ledger = Ledger::new();
        ledger.record_mount("/r/proc", "proc");
        ledger.record_mount("/r/dev", "devices");
        ledger.record_mount("/r/dev/pts", "devices");
        let paths: Vec<_> = ledger.mounts().iter().map(|m| m.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/r/proc"),
                PathBuf::from("/r/dev"),
                PathBuf::from("/r/dev/pts")
            ]
        );
        ledger.drain(&dry());
    }

    #[test]
    fn guard_drains_on_drop() {
        let _env = crate::testenv::lock();
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("XDG_RUNTIME_DIR", tmp.path());
        let dir;
        {
            let mut guard = CleanupGuard::new(dry());
            dir = guard.ledger.stage_runtime_dir().unwrap();
            assert!(dir.exists());
        }
        assert!(!dir.exists());
    }

    #[test]
    fn guard_explicit_drain_then_drop() {
        let mut guard = CleanupGuard::new(dry());
        guard.ledger.record_mount("/r/proc", "proc");
        guard.drain_now();
        assert!(guard.ledger.is_drained());
        // Drop runs drain again; idempotence makes it a no-op.
    }

    #[test]
    fn is_mounted_false_for_plain_dir() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!is_mounted(tmp.path()));
    }

    #[test]
    fn sweep_stale_survives_unmounted_root() {
        let tmp = tempfile::tempdir().unwrap();
        // Nothing is mounted; the sweep must not error or touch anything.
        sweep_stale(tmp.path(), &dry());
    }
}
