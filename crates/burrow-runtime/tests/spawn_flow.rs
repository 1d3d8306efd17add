//! End-to-end dry-run flows through the public API.
//!
//! Dry-run keeps the exact control flow and ledger bookkeeping of a real
//! invocation while substituting prints for privileged commands, so the
//! whole spawn lifecycle is exercisable without root.

use burrow_runtime::host::BinderOptions;
use burrow_runtime::lock::lock_path_for;
use burrow_runtime::{
    cleanup_root, spawn, unlock, BackendKind, Elevation, Elevator, SpawnError, SpawnOptions,
};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

fn chroot_opts(root: &Path) -> SpawnOptions {
    SpawnOptions {
        backend: Some(BackendKind::Chroot),
        dir: Some(root.to_path_buf()),
        user: Some("root".to_owned()),
        dry_run: true,
        ..SpawnOptions::default()
    }
}

#[test]
fn full_dry_run_with_binds_and_home_remap() {
    let _env = env_lock();
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("XDG_RUNTIME_DIR", tmp.path());

    let root = tmp.path().join("rootfs");
    std::fs::create_dir(&root).unwrap();
    let work = tmp.path().join("project");
    std::fs::create_dir(&work).unwrap();
    let home = tmp.path().join("fakehome");
    std::fs::create_dir(&home).unwrap();

    let mut opts = chroot_opts(&root);
    opts.binders = BinderOptions {
        bind_home: Some(home.to_string_lossy().into_owned()),
        bind_dirs: vec![format!("{}:/work", work.display())],
        ..BinderOptions::default()
    };
    opts.command = vec!["make".to_owned(), "check".to_owned()];

    let code = spawn(&opts).unwrap();
    assert_eq!(code, 0);

    // Idempotent teardown: lock released, nothing left behind.
    assert!(!lock_path_for(&root).exists());
}

#[test]
fn second_invocation_against_locked_root_fails_without_mutation() {
    let _env = env_lock();
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("XDG_RUNTIME_DIR", tmp.path());
    let root = tmp.path().join("rootfs");
    std::fs::create_dir(&root).unwrap();

    std::fs::write(lock_path_for(&root), "{}").unwrap();

    let err = spawn(&chroot_opts(&root)).unwrap_err();
    assert!(matches!(err, SpawnError::LockConflict(_)));
    // The first invocation's marker survives.
    assert!(lock_path_for(&root).exists());
}

#[test]
fn unlock_then_spawn_succeeds() {
    let _env = env_lock();
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("XDG_RUNTIME_DIR", tmp.path());
    let root = tmp.path().join("rootfs");
    std::fs::create_dir(&root).unwrap();

    std::fs::write(lock_path_for(&root), "{}").unwrap();
    unlock(&root).unwrap();

    let code = spawn(&chroot_opts(&root)).unwrap();
    assert_eq!(code, 0);
    assert!(!lock_path_for(&root).exists());
}

#[test]
fn cleanup_sweeps_and_releases_without_spawning() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("rootfs");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(lock_path_for(&root), "{}").unwrap();

    let elevator = Elevator::new(Elevation::DryRun);
    cleanup_root(&root, &elevator).unwrap();
    assert!(!lock_path_for(&root).exists());
    // The root's own contents are untouched.
    assert!(root.exists());
}
