//! Ephemeral isolated-environment orchestration for burrow.
//!
//! This crate implements the execution layer: backend selection and the three
//! `BackendDriver` variants (docker, systemd-nspawn, raw chroot), host
//! integration binders (SSH agent, X11, PulseAudio, home remap, directory
//! binds), the mount ledger with guaranteed reverse-order teardown, the
//! per-root advisory lock, and the privilege-elevation strategy.

pub mod backend;
pub mod bundle;
pub mod chroot;
pub mod command;
pub mod docker;
pub mod host;
pub mod identity;
pub mod ledger;
pub mod lock;
pub mod nspawn;
pub mod prereq;
pub mod privilege;
pub mod signal;
pub mod spawn;
pub mod target;
pub mod terminal;
pub mod xauth;

pub use backend::{driver_for, BackendDriver, RunRequest};
pub use bundle::{BindSpec, Bundle, EnvEntry};
pub use identity::Identity;
pub use ledger::{CleanupGuard, Ledger, MountRecord};
pub use lock::LockToken;
pub use prereq::{check_backend, format_missing, MissingPrereq};
pub use privilege::{Elevation, Elevator};
pub use signal::{install_signal_handler, shutdown_requested};
pub use spawn::{cleanup_root, spawn, unlock, SpawnOptions};
pub use target::{BackendKind, SpawnTarget};

use thiserror::Error;


#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Validation(String),
    #[error("required host resource missing: {0}")]
    ResourceMissing(String),
    #[error("{0}")]
    LockConflict(String),
    #[error("backend not available: {0}")]
    BackendNotFound(String),
    #[error("privileged command failed: {0}")]
    PrivilegedCommand(String),
}
