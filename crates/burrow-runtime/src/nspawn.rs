use crate::backend::{BackendDriver, RunRequest};
use crate::bundle::{BindSpec, EnvEntry};
use crate::command::{assemble, login_shell_for_root};
use crate::ledger::Ledger;
use crate::prereq::command_exists;
use crate::SpawnError;
use tracing::debug;

/// Namespace-root driver. Mount/PID/user namespace construction, the device
/// tree, and process isolation are all delegated to systemd-nspawn; the
/// driver translates the bundle and passes raw extra arguments verbatim.
pub struct NspawnDriver;

impl BackendDriver for NspawnDriver {
    fn name(&self) -> &'static str {
        "nspawn"
    }

    fn available(&self) -> bool {
        command_exists("systemd-nspawn")
    }

    fn translate_env(&self, key: &str, value: &str, argv: &mut Vec<String>) {
        argv.push(format!("--setenv={key}={value}"));
    }

    fn translate_bind(&self, bind: &BindSpec, argv: &mut Vec<String>) {
        let flag = if bind.is_read_only() {
            "--bind-ro"
        } else {
            "--bind"
        };
        argv.push(format!(
            "{flag}={}:{}",
            bind.source.display(),
            bind.dest.display()
        ));
    }

    fn run(&self, req: &RunRequest<'_>, _ledger: &mut Ledger) -> Result<i32, SpawnError> {
        let root = req.target.root().ok_or_else(|| {
            SpawnError::Validation("nspawn backend selected without a root directory".to_owned())
        })?;

        let assembled = assemble(req.command, req.bundle.workdir(), login_shell_for_root(root));

        let mut argv = vec![
            "-D".to_owned(),
            root.to_string_lossy().into_owned(),
            "--quiet".to_owned(),
        ];

        if req.identity.name != "root" {
            argv.push(format!("--user={}", req.identity.name));
        }

        if let Some(workdir) = req.bundle.workdir() {
            argv.push(format!("--chdir={}", workdir.display()));
        }

        for entry in req.bundle.entries() {
            match entry {
                EnvEntry::Env { key, value } => self.translate_env(key, value, &mut argv),
                EnvEntry::Bind(bind) => self.translate_bind(bind, &mut argv),
            }
        }

        argv.extend(req.extra_args.iter().cloned());

        argv.push("/bin/sh".to_owned());
        argv.push("-c".to_owned());
        argv.push(assembled.script);

        debug!("systemd-nspawn into {}", root.display());
        match req.arch {
            Some(arch) => {
                // Personality set on nspawn is inherited by the container.
                let mut wrapped = vec![arch.to_owned(), "systemd-nspawn".to_owned()];
                wrapped.extend(argv);
                req.elevator.run_interactive("setarch", &wrapped)
            }
            None => req.elevator.run_interactive("systemd-nspawn", &argv),
        }
    }
}
