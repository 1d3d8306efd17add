use crate::backend::{driver_for, RunRequest};
use crate::bundle::Bundle;
use crate::host::BinderOptions;
use crate::identity::resolve_identity;
use crate::ledger::{sweep_stale, CleanupGuard};
use crate::lock::{release_root, LockToken};
use crate::prereq::{check_backend, command_exists, format_missing};
use crate::privilege::Elevator;
use crate::target::{resolve_target, BackendKind, ResolvedTarget, TargetFlags};
use crate::{host, terminal, SpawnError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One full invocation, as handed over by the CLI layer.
#[derive(Debug, Default)]
pub struct SpawnOptions {
    /// Explicit `--using-*` driver choice.
    pub backend: Option<BackendKind>,
    pub image: Option<String>,
    pub dir: Option<PathBuf>,
    /// Positional name: image, root directory, or first command word.
    pub name: Option<String>,
    /// Command to run inside the environment; empty means a login shell.
    pub command: Vec<String>,
    pub user: Option<String>,
    pub arch: Option<String>,
    pub binders: BinderOptions,
    pub share_devices: bool,
    /// Raw backend arguments passed through verbatim.
    pub backend_args: Vec<String>,
    pub dry_run: bool,
    pub batch: bool,
}

/// Construct the environment, execute the command inside it, and tear
/// everything down. Returns the in-environment exit code.
///
/// The flow is strictly sequential: resolve target → resolve identity →
/// feature binders → lock (directory backends) → driver → drain ledger →
/// release lock. The cleanup guard drains on every exit path, including
/// failures raised mid-setup.
pub fn spawn(opts: &SpawnOptions) -> Result<i32, SpawnError> {
    let flags = TargetFlags {
        backend: opts.backend,
        image: opts.image.as_deref(),
        dir: opts.dir.as_deref(),
        positional: opts.name.as_deref(),
    };
    let ResolvedTarget {
        target,
        positional_consumed,
    } = resolve_target(&flags, command_exists("systemd-nspawn"))?;
    debug!("target: {} via {}", target.display_name(), target.kind.as_str());

    // A positional that did not become the target is the first command word.
    let mut command = Vec::new();
    if !positional_consumed {
        if let Some(name) = &opts.name {
            command.push(name.clone());
        }
    }
    command.extend(opts.command.iter().cloned());

    let elevator = Elevator::detect(opts.batch, opts.dry_run);
    let missing = check_backend(target.kind, elevator.uses_sudo());
    if !missing.is_empty() {
        return Err(SpawnError::BackendNotFound(format_missing(&missing)));
    }

    let identity = resolve_identity(opts.user.as_deref(), &target)?;
    debug!("identity: {} (uid {:?})", identity.name, identity.uid);

    let mut guard = CleanupGuard::new(elevator.clone());
    let mut bundle = Bundle::new();
    host::apply_binders(&opts.binders, &identity, &mut guard.ledger, &mut bundle)?;

    let lock = match target.root() {
        Some(root) if target.is_directory_backend() => Some(LockToken::acquire(root)?),
        _ => None,
    };

    terminal::print_enter_banner(&target.display_name(), target.kind.as_str());

    let driver = driver_for(target.kind);
    let req = RunRequest {
        target: &target,
        identity: &identity,
        bundle: &bundle,
        command: &command,
        arch: opts.arch.as_deref(),
        extra_args: &opts.backend_args,
        share_devices: opts.share_devices,
        elevator: &elevator,
    };
    let result = driver.run(&req, &mut guard.ledger);

    // Unwind in the reverse of setup order: mounts first, lock last.
    guard.drain_now();
    if let Some(lock) = lock {
        lock.release();
    }
    terminal::print_exit_banner(&target.display_name());

    result
}

/// Release the lock for `root` and do nothing else.
pub fn unlock(root: &Path) -> Result<(), SpawnError> {
    release_root(root)?;
    info!("unlocked {}", root.display());
    Ok(())
}

/// Unmount leftovers of a previous, abnormally-terminated invocation under
/// `root`, then release its lock. No environment is started.
pub fn cleanup_root(root: &Path, elevator: &Elevator) -> Result<(), SpawnError> {
    sweep_stale(root, elevator);
    release_root(root)?;
    info!("cleaned up {}", root.display());
    Ok(())
}
