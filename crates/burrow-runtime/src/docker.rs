use crate::backend::{BackendDriver, RunRequest};
use crate::bundle::{BindSpec, EnvEntry};
use crate::command::assemble;
use crate::ledger::Ledger;
use crate::prereq::command_exists;
use crate::terminal::stdin_is_tty;
use crate::SpawnError;
use tracing::debug;

/// Container-engine driver. Isolation, device trees, and namespaces all
/// belong to the engine; this driver only translates the bundle into
/// `docker run` arguments and removes the container afterward.
pub struct DockerDriver;

impl BackendDriver for DockerDriver {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn available(&self) -> bool {
        command_exists("docker")
    }

    fn translate_env(&self, key: &str, value: &str, argv: &mut Vec<String>) {
        argv.push("--env".to_owned());
        argv.push(format!("{key}={value}"));
    }

    fn translate_bind(&self, bind: &BindSpec, argv: &mut Vec<String>) {
        let mut volume = format!("{}:{}", bind.source.display(), bind.dest.display());
        if let Some(options) = &bind.options {
            volume.push(':');
            volume.push_str(options);
        }
        argv.push("--volume".to_owned());
        argv.push(volume);
    }

    fn run(&self, req: &RunRequest<'_>, _ledger: &mut Ledger) -> Result<i32, SpawnError> {
        let image = req.target.image.as_deref().ok_or_else(|| {
            SpawnError::Validation("docker backend selected without an image".to_owned())
        })?;

        let assembled = assemble(req.command, req.bundle.workdir(), "/bin/sh");

        let mut argv = vec!["run".to_owned(), "--rm".to_owned(), "-i".to_owned()];
        if assembled.interactive && stdin_is_tty() {
            argv.push("-t".to_owned());
        }

        if let Some(spec) = req.identity.uid_gid_spec() {
            argv.push("--user".to_owned());
            argv.push(spec);
        } else if req.identity.name != "root" {
            argv.push("--user".to_owned());
            argv.push(req.identity.name.clone());
        }

        if let Some(arch) = req.arch {
            argv.push("--platform".to_owned());
            argv.push(format!("linux/{arch}"));
        }

        for entry in req.bundle.entries() {
            match entry {
                EnvEntry::Env { key, value } => self.translate_env(key, value, &mut argv),
                EnvEntry::Bind(bind) => self.translate_bind(bind, &mut argv),
            }
        }

        if let Some(workdir) = req.bundle.workdir() {
            argv.push("--workdir".to_owned());
            argv.push(workdir.to_string_lossy().into_owned());
        }

        argv.extend(req.extra_args.iter().cloned());

        argv.push(image.to_owned());
        argv.push("/bin/sh".to_owned());
        argv.push("-c".to_owned());
        argv.push(assembled.script);

        debug!("docker run for image {image}");
        req.elevator.run_interactive("docker", &argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Bundle;
    use crate::identity::Identity;
    use crate::privilege::{Elevation, Elevator};
    use crate::target::{BackendKind, SpawnTarget};

    #[test]
    fn env_translates_to_env_flag() {
        let mut argv = Vec::new();
        DockerDriver.translate_env("DISPLAY", ":0", &mut argv);
        assert_eq!(argv, vec!["--env", "DISPLAY=:0"]);
    }

    #[test]
    fn bind_translates_to_volume_flag() {
        let mut argv = Vec::new();
        DockerDriver.translate_bind(&BindSpec::new("/src", "/dst"), &mut argv);
        assert_eq!(argv, vec!["--volume", "/src:/dst"]);

        argv.clear();
        DockerDriver.translate_bind(&BindSpec::read_only("/src", "/dst"), &mut argv);
        assert_eq!(argv, vec!["--volume", "/src:/dst:ro"]);
    }

    #[test]
    fn run_without_image_is_a_validation_error() {
        let target = SpawnTarget {
            kind: BackendKind::Docker,
            image: None,
            root: None,
        };
        let bundle = Bundle::new();
        let elevator = Elevator::new(Elevation::DryRun);
        let req = RunRequest {
            target: &target,
            identity: &Identity::root(),
            bundle: &bundle,
            command: &[],
            arch: None,
            extra_args: &[],
            share_devices: false,
            elevator: &elevator,
        };
        let mut ledger = Ledger::new();
        assert!(matches!(
            DockerDriver.run(&req, &mut ledger),
            Err(SpawnError::Validation(_))
        ));
    }

    #[test]
    fn dry_run_executes_nothing_and_succeeds() {
        let target = SpawnTarget {
            kind: BackendKind::Docker,
            image: Some("app:latest".to_owned()),
            root: None,
        };
        let mut bundle = Bundle::new();
        bundle.push_env("DISPLAY", ":0");
        let elevator = Elevator::new(Elevation::DryRun);
        let command = vec!["true".to_owned()];
        let req = RunRequest {
            target: &target,
            identity: &Identity::root(),
            bundle: &bundle,
            command: &command,
            arch: Some("arm64"),
            extra_args: &[],
            share_devices: false,
            elevator: &elevator,
        };
        let mut ledger = Ledger::new();
        let code = DockerDriver.run(&req, &mut ledger).unwrap();
        assert_eq!(code, 0);
        // The container backend never touches the mount ledger.
        assert!(ledger.mounts().is_empty());
    }
}
