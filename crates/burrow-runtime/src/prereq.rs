use crate::target::BackendKind;
use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

pub fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check the external tools the selected backend will actually invoke.
///
/// `needs_sudo` is false when the invocation runs as root or in dry-run mode,
/// where no elevation wrapper is ever executed.
pub fn check_backend(kind: BackendKind, needs_sudo: bool) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    match kind {
        BackendKind::Docker => {
            if !command_exists("docker") {
                missing.push(MissingPrereq {
                    name: "docker",
                    purpose: "container backend",
                    install_hint: "zypper install docker | apt install docker.io | dnf install docker | pacman -S docker",
                });
            }
        }
        BackendKind::Nspawn => {
            if !command_exists("systemd-nspawn") {
                missing.push(MissingPrereq {
                    name: "systemd-nspawn",
                    purpose: "namespace-root backend",
                    install_hint: "zypper install systemd-container | apt install systemd-container | dnf install systemd-container",
                });
            }
        }
        BackendKind::Chroot => {
            if !command_exists("unshare") {
                missing.push(MissingPrereq {
                    name: "unshare",
                    purpose: "mount/PID namespace entry for the chroot backend",
                    install_hint: "part of util-linux (usually pre-installed)",
                });
            }
            if !command_exists("chroot") {
                missing.push(MissingPrereq {
                    name: "chroot",
                    purpose: "root-directory switch for the chroot backend",
                    install_hint: "part of coreutils (usually pre-installed)",
                });
            }
            if !command_exists("mount") {
                missing.push(MissingPrereq {
                    name: "mount",
                    purpose: "pseudo-filesystem and bind mounts",
                    install_hint: "part of util-linux (usually pre-installed)",
                });
            }
        }
    }

    if needs_sudo && !command_exists("sudo") {
        missing.push(MissingPrereq {
            name: "sudo",
            purpose: "privilege elevation for mounts and namespace entry",
            install_hint: "zypper install sudo | apt install sudo | dnf install sudo | pacman -S sudo",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nburrow requires these tools for the selected backend.");
    msg
}
