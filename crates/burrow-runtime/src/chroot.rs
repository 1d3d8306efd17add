use crate::backend::{BackendDriver, RunRequest};
use crate::bundle::{BindSpec, EnvEntry};
use crate::command::{assemble, login_shell_for_root, shell_quote};
use crate::ledger::Ledger;
use crate::prereq::command_exists;
use crate::privilege::Elevator;
use crate::SpawnError;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Character devices of the minimal private tree, with conventional
/// major/minor numbers and modes.
const DEVICE_NODES: &[(&str, &str, &str, &str)] = &[
    ("null", "666", "1", "3"),
    ("zero", "666", "1", "5"),
    ("random", "666", "1", "8"),
    ("urandom", "666", "1", "9"),
    ("tty", "666", "5", "0"),
    ("console", "600", "5", "1"),
];

/// Standard-stream and terminal-multiplexer symlinks inside /dev.
const DEVICE_LINKS: &[(&str, &str)] = &[
    ("/proc/self/fd", "fd"),
    ("/proc/self/fd/0", "stdin"),
    ("/proc/self/fd/1", "stdout"),
    ("/proc/self/fd/2", "stderr"),
    ("pts/ptmx", "ptmx"),
];

/// Host files bound into the root so name resolution and timezones work.
const BIND_FILES: &[(&str, &str)] = &[("/etc/resolv.conf", "dns"), ("/etc/localtime", "time")];

/// The fallback driver: the only one that constructs isolation by hand.
///
/// Every privileged step goes through the elevator as a discrete external
/// command, and every successful mount is recorded in the ledger before the
/// next step runs, so a failure at any point unwinds cleanly.
pub struct ChrootDriver;

fn in_root(root: &Path, dest: &Path) -> PathBuf {
    root.join(dest.strip_prefix("/").unwrap_or(dest))
}

fn ensure_dir(elevator: &Elevator, path: &Path) -> Result<(), SpawnError> {
    if path.is_dir() {
        return Ok(());
    }
    elevator.run("mkdir", &["-p".to_owned(), path.to_string_lossy().into_owned()])
}

fn mount(
    elevator: &Elevator,
    ledger: &mut Ledger,
    args: Vec<String>,
    mountpoint: &Path,
    created_by: &'static str,
) -> Result<(), SpawnError> {
    elevator.run("mount", &args)?;
    ledger.record_mount(mountpoint, created_by);
    Ok(())
}

impl ChrootDriver {
    fn mount_proc(
        elevator: &Elevator,
        ledger: &mut Ledger,
        root: &Path,
    ) -> Result<(), SpawnError> {
        let proc = root.join("proc");
        ensure_dir(elevator, &proc)?;
        mount(
            elevator,
            ledger,
            vec![
                "-t".to_owned(),
                "proc".to_owned(),
                "proc".to_owned(),
                proc.to_string_lossy().into_owned(),
            ],
            &proc,
            "proc",
        )
    }

    /// Share the host's device and system trees, marked slave so mount
    /// events inside the environment never propagate back to the host.
    fn share_host_devices(
        elevator: &Elevator,
        ledger: &mut Ledger,
        root: &Path,
    ) -> Result<(), SpawnError> {
        for (host, name) in [("/dev", "dev"), ("/sys", "sys")] {
            let dest = root.join(name);
            ensure_dir(elevator, &dest)?;
            let dest_str = dest.to_string_lossy().into_owned();
            mount(
                elevator,
                ledger,
                vec!["--rbind".to_owned(), host.to_owned(), dest_str.clone()],
                &dest,
                "devices",
            )?;
            elevator.run("mount", &["--make-rslave".to_owned(), dest_str])?;
        }
        Ok(())
    }

    /// Construct the minimal private device tree from scratch.
    fn build_device_tree(
        elevator: &Elevator,
        ledger: &mut Ledger,
        root: &Path,
    ) -> Result<(), SpawnError> {
        let dev = root.join("dev");
        ensure_dir(elevator, &dev)?;
        mount(
            elevator,
            ledger,
            vec![
                "-t".to_owned(),
                "tmpfs".to_owned(),
                "-o".to_owned(),
                "mode=755,nosuid".to_owned(),
                "tmpfs".to_owned(),
                dev.to_string_lossy().into_owned(),
            ],
            &dev,
            "devices",
        )?;

        let pts = dev.join("pts");
        ensure_dir(elevator, &pts)?;
        mount(
            elevator,
            ledger,
            vec![
                "-t".to_owned(),
                "devpts".to_owned(),
                "-o".to_owned(),
                "newinstance,ptmxmode=0666,mode=0620".to_owned(),
                "devpts".to_owned(),
                pts.to_string_lossy().into_owned(),
            ],
            &pts,
            "devices",
        )?;

        let shm = dev.join("shm");
        ensure_dir(elevator, &shm)?;
        mount(
            elevator,
            ledger,
            vec![
                "-t".to_owned(),
                "tmpfs".to_owned(),
                "-o".to_owned(),
                "mode=1777,nosuid,nodev".to_owned(),
                "tmpfs".to_owned(),
                shm.to_string_lossy().into_owned(),
            ],
            &shm,
            "devices",
        )?;

        for (target, link) in DEVICE_LINKS {
            elevator.run(
                "ln",
                &[
                    "-sf".to_owned(),
                    (*target).to_owned(),
                    dev.join(link).to_string_lossy().into_owned(),
                ],
            )?;
        }

        for (name, mode, major, minor) in DEVICE_NODES {
            elevator.run(
                "mknod",
                &[
                    "-m".to_owned(),
                    (*mode).to_owned(),
                    dev.join(name).to_string_lossy().into_owned(),
                    "c".to_owned(),
                    (*major).to_owned(),
                    (*minor).to_owned(),
                ],
            )?;
        }

        let sys = root.join("sys");
        ensure_dir(elevator, &sys)?;
        mount(
            elevator,
            ledger,
            vec![
                "-t".to_owned(),
                "sysfs".to_owned(),
                "sysfs".to_owned(),
                sys.to_string_lossy().into_owned(),
            ],
            &sys,
            "sysfs",
        )
    }

    fn bind_host_files(
        elevator: &Elevator,
        ledger: &mut Ledger,
        root: &Path,
    ) -> Result<(), SpawnError> {
        for (host, created_by) in BIND_FILES {
            if !Path::new(host).exists() {
                continue;
            }
            let dest = in_root(root, Path::new(host));
            if let Some(parent) = dest.parent() {
                ensure_dir(elevator, parent)?;
            }
            elevator.run("touch", &[dest.to_string_lossy().into_owned()])?;
            mount(
                elevator,
                ledger,
                vec![
                    "--bind".to_owned(),
                    (*host).to_owned(),
                    dest.to_string_lossy().into_owned(),
                ],
                &dest,
                created_by,
            )?;
        }
        Ok(())
    }

    /// Materialize the bundle's binds as direct mounts. There are no native
    /// bind arguments here, so the ledger takes the place of BindSpecs.
    fn materialize_binds(
        elevator: &Elevator,
        ledger: &mut Ledger,
        root: &Path,
        binds: &[&BindSpec],
    ) -> Result<(), SpawnError> {
        for bind in binds {
            let dest = in_root(root, &bind.dest);
            if bind.source.is_dir() {
                ensure_dir(elevator, &dest)?;
            } else {
                if let Some(parent) = dest.parent() {
                    ensure_dir(elevator, parent)?;
                }
                elevator.run("touch", &[dest.to_string_lossy().into_owned()])?;
            }
            let dest_str = dest.to_string_lossy().into_owned();
            mount(
                elevator,
                ledger,
                vec![
                    "--bind".to_owned(),
                    bind.source.to_string_lossy().into_owned(),
                    dest_str.clone(),
                ],
                &dest,
                "bind",
            )?;
            if bind.is_read_only() {
                elevator.run(
                    "mount",
                    &["-o".to_owned(), "remount,ro,bind".to_owned(), dest_str],
                )?;
            }
        }
        Ok(())
    }
}

fn env_exports(bundle_vars: impl Iterator<Item = (String, String)>) -> String {
    let mut exports = String::new();
    for (key, value) in bundle_vars {
        if !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            continue;
        }
        let _ = write!(exports, "export {}={}; ", key, shell_quote(&value));
    }
    exports
}

impl BackendDriver for ChrootDriver {
    fn name(&self) -> &'static str {
        "chroot"
    }

    fn available(&self) -> bool {
        command_exists("unshare") && command_exists("chroot") && command_exists("mount")
    }

    fn translate_env(&self, key: &str, value: &str, argv: &mut Vec<String>) {
        // No flag syntax exists; assignments become shell exports in the
        // setup script.
        argv.push(format!("export {}={};", key, shell_quote(value)));
    }

    fn translate_bind(&self, _bind: &BindSpec, _argv: &mut Vec<String>) {
        // Binds are performed directly and recorded in the ledger; see
        // materialize_binds.
    }

    fn run(&self, req: &RunRequest<'_>, ledger: &mut Ledger) -> Result<i32, SpawnError> {
        let root = req.target.root().ok_or_else(|| {
            SpawnError::Validation("chroot backend selected without a root directory".to_owned())
        })?;
        let userspec = req.identity.uid_gid_spec().ok_or_else(|| {
            SpawnError::Validation(format!(
                "cannot chroot as user '{}' without numeric uid/gid",
                req.identity.name
            ))
        })?;
        // Supplementary groups are not initialized for the target user;
        // only the primary gid crosses the chroot boundary.
        debug!("chroot userspec {userspec}");

        let elevator = req.elevator;

        Self::mount_proc(elevator, ledger, root)?;
        if req.share_devices {
            Self::share_host_devices(elevator, ledger, root)?;
        } else {
            Self::build_device_tree(elevator, ledger, root)?;
        }
        Self::bind_host_files(elevator, ledger, root)?;

        let binds: Vec<&BindSpec> = req.bundle.binds().collect();
        Self::materialize_binds(elevator, ledger, root, &binds)?;

        let assembled = assemble(req.command, req.bundle.workdir(), login_shell_for_root(root));
        let exports = env_exports(
            req.bundle
                .env_vars()
                .map(|(k, v)| (k.to_owned(), v.to_owned())),
        );
        let script = format!("{exports}{}", assembled.script);

        if assembled.interactive {
            warn!(
                "job control crosses a PID namespace here; a job stopped in the \
                 background may stay stopped until resumed in the foreground"
            );
        }

        let mut argv = vec![
            "--mount".to_owned(),
            "--pid".to_owned(),
            "--fork".to_owned(),
            "--kill-child=SIGTERM".to_owned(),
        ];
        if let Some(arch) = req.arch {
            argv.push("setarch".to_owned());
            argv.push(arch.to_owned());
        }
        argv.push("chroot".to_owned());
        argv.push(format!("--userspec={userspec}"));
        argv.push(root.to_string_lossy().into_owned());
        argv.push("/bin/sh".to_owned());
        argv.push("-c".to_owned());
        argv.push(script);

        debug!("chroot into {}", root.display());
        elevator.run_interactive("unshare", &argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Bundle;
    use crate::identity::Identity;
    use crate::privilege::{Elevation, Elevator};
    use crate::target::{BackendKind, SpawnTarget};

    fn dir_target(root: &Path) -> SpawnTarget {
        SpawnTarget {
            kind: BackendKind::Chroot,
            image: None,
            root: Some(root.to_path_buf()),
        }
    }

    fn dry_request<'a>(
        target: &'a SpawnTarget,
        identity: &'a Identity,
        bundle: &'a Bundle,
        elevator: &'a Elevator,
        share_devices: bool,
    ) -> RunRequest<'a> {
        RunRequest {
            target,
            identity,
            bundle,
            command: &[],
            arch: None,
            extra_args: &[],
            share_devices,
            elevator,
        }
    }

    #[test]
    fn dry_run_records_proc_and_private_device_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let target = dir_target(tmp.path());
        let identity = Identity::root();
        let bundle = Bundle::new();
        let elevator = Elevator::new(Elevation::DryRun);
        let req = dry_request(&target, &identity, &bundle, &elevator, false);

        let mut ledger = Ledger::new();
        let code = ChrootDriver.run(&req, &mut ledger).unwrap();
        assert_eq!(code, 0);

        let created: Vec<&str> = ledger.mounts().iter().map(|m| m.created_by).collect();
        assert!(created.contains(&"proc"));
        assert!(created.contains(&"devices"));
        assert!(created.contains(&"sysfs"));
        // proc is always the first mount.
        assert_eq!(ledger.mounts()[0].path, tmp.path().join("proc"));

        ledger.drain(&elevator);
        assert!(ledger.mounts().is_empty());
    }

    #[test]
    fn shared_devices_skip_the_private_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let target = dir_target(tmp.path());
        let identity = Identity::root();
        let bundle = Bundle::new();
        let elevator = Elevator::new(Elevation::DryRun);
        let req = dry_request(&target, &identity, &bundle, &elevator, true);

        let mut ledger = Ledger::new();
        ChrootDriver.run(&req, &mut ledger).unwrap();

        // rbinds of /dev and /sys, no private devpts/shm mounts.
        let paths: Vec<_> = ledger.mounts().iter().map(|m| m.path.clone()).collect();
        assert!(paths.contains(&tmp.path().join("dev")));
        assert!(paths.contains(&tmp.path().join("sys")));
        assert!(!paths.contains(&tmp.path().join("dev/pts")));
        ledger.drain(&elevator);
    }

    #[test]
    fn bundle_binds_become_ledger_records() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let target = dir_target(tmp.path());
        let identity = Identity::root();
        let mut bundle = Bundle::new();
        bundle.push_bind(BindSpec::new(src.path(), "/work"));
        bundle.push_bind(BindSpec::new(src.path(), "/data"));
        let elevator = Elevator::new(Elevation::DryRun);
        let req = dry_request(&target, &identity, &bundle, &elevator, false);

        let mut ledger = Ledger::new();
        ChrootDriver.run(&req, &mut ledger).unwrap();

        // The same source under two destinations yields two records, in
        // creation order.
        let bind_paths: Vec<_> = ledger
            .mounts()
            .iter()
            .filter(|m| m.created_by == "bind")
            .map(|m| m.path.clone())
            .collect();
        assert_eq!(
            bind_paths,
            vec![tmp.path().join("work"), tmp.path().join("data")]
        );
        ledger.drain(&elevator);
    }

    #[test]
    fn unknown_identity_cannot_chroot() {
        let tmp = tempfile::tempdir().unwrap();
        let target = dir_target(tmp.path());
        let identity = Identity {
            name: "ghost".to_owned(),
            uid: None,
            gid: None,
            home: None,
        };
        let bundle = Bundle::new();
        let elevator = Elevator::new(Elevation::DryRun);
        let req = dry_request(&target, &identity, &bundle, &elevator, false);

        let mut ledger = Ledger::new();
        let err = ChrootDriver.run(&req, &mut ledger).unwrap_err();
        assert!(matches!(err, SpawnError::Validation(_)));
        // Validation fails closed: nothing was mounted.
        assert!(ledger.mounts().is_empty());
    }

    #[test]
    fn env_exports_skip_unsafe_keys() {
        let vars = vec![
            ("DISPLAY".to_owned(), ":0".to_owned()),
            ("BAD-KEY".to_owned(), "x".to_owned()),
            ("PULSE_SERVER".to_owned(), "unix:/run/burrow/pulse/native".to_owned()),
        ];
        let exports = env_exports(vars.into_iter());
        assert!(exports.contains("export DISPLAY=':0';"));
        assert!(exports.contains("export PULSE_SERVER="));
        assert!(!exports.contains("BAD-KEY"));
    }

    #[test]
    fn device_nodes_use_conventional_numbers() {
        let null = DEVICE_NODES.iter().find(|(n, ..)| *n == "null").unwrap();
        assert_eq!((null.2, null.3), ("1", "3"));
        let urandom = DEVICE_NODES.iter().find(|(n, ..)| *n == "urandom").unwrap();
        assert_eq!((urandom.2, urandom.3), ("1", "9"));
        let console = DEVICE_NODES.iter().find(|(n, ..)| *n == "console").unwrap();
        assert_eq!(console.1, "600");
    }
}
