use crate::SpawnError;
use std::process::{Command, Output, Stdio};
use tracing::debug;

/// How privileged operations are executed.
///
/// Injected into every component that mounts, unmounts, or enters namespaces
/// so the whole privileged surface is swappable for tests and `--dry-run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    /// Interactive `sudo` (may prompt for a password).
    Sudo,
    /// Non-interactive `sudo -n` (fails instead of prompting).
    SudoBatch,
    /// Already root; run commands directly.
    Direct,
    /// Print every command instead of running it.
    DryRun,
}

#[derive(Debug, Clone)]
pub struct Elevator {
    mode: Elevation,
}

/// Safe wrapper around libc::getuid().
#[allow(unsafe_code)]
pub(crate) fn current_uid() -> u32 {
    // SAFETY: getuid() is always safe — no arguments, no side effects, cannot fail.
    unsafe { libc::getuid() }
}

impl Elevator {
    pub fn new(mode: Elevation) -> Self {
        Self { mode }
    }

    /// Pick the elevation mode for this invocation.
    pub fn detect(batch: bool, dry_run: bool) -> Self {
        let mode = if dry_run {
            Elevation::DryRun
        } else if current_uid() == 0 {
            Elevation::Direct
        } else if batch {
            Elevation::SudoBatch
        } else {
            Elevation::Sudo
        };
        Self::new(mode)
    }

    pub fn mode(&self) -> Elevation {
        self.mode
    }

    pub fn is_dry_run(&self) -> bool {
        self.mode == Elevation::DryRun
    }

    /// True when this elevator will actually invoke the `sudo` wrapper.
    pub fn uses_sudo(&self) -> bool {
        matches!(self.mode, Elevation::Sudo | Elevation::SudoBatch)
    }

    fn render(program: &str, args: &[String]) -> String {
        let mut line = String::from(program);
        for a in args {
            line.push(' ');
            line.push_str(a);
        }
        line
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        match self.mode {
            Elevation::Sudo => {
                let mut cmd = Command::new("sudo");
                cmd.arg(program).args(args);
                cmd
            }
            Elevation::SudoBatch => {
                let mut cmd = Command::new("sudo");
                cmd.arg("-n").arg(program).args(args);
                cmd
            }
            Elevation::Direct | Elevation::DryRun => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        }
    }

    /// Run a privileged command to completion, discarding its output.
    pub fn run(&self, program: &str, args: &[String]) -> Result<(), SpawnError> {
        let line = Self::render(program, args);
        if self.is_dry_run() {
            println!("burrow: would run: {line}");
            return Ok(());
        }
        debug!("running: {line}");
        let status = self
            .command(program, args)
            .stdout(Stdio::null())
            .status()
            .map_err(|e| SpawnError::PrivilegedCommand(format!("{line}: {e}")))?;
        if !status.success() {
            return Err(SpawnError::PrivilegedCommand(format!(
                "{line}: exited with {status}"
            )));
        }
        Ok(())
    }

    /// Run a privileged command, capturing stdout and stderr.
    ///
    /// In dry-run mode the command is printed and an empty successful output
    /// is fabricated so callers keep their normal control flow.
    pub fn run_captured(&self, program: &str, args: &[String]) -> Result<Output, SpawnError> {
        let line = Self::render(program, args);
        if self.is_dry_run() {
            println!("burrow: would run: {line}");
            return Ok(Output {
                status: success_status(),
                stdout: Vec::new(),
                stderr: Vec::new(),
            });
        }
        debug!("running: {line}");
        self.command(program, args)
            .output()
            .map_err(|e| SpawnError::PrivilegedCommand(format!("{line}: {e}")))
    }

    /// Run the backend's final in-environment invocation with inherited stdio
    /// and return its exit code.
    pub fn run_interactive(&self, program: &str, args: &[String]) -> Result<i32, SpawnError> {
        let line = Self::render(program, args);
        if self.is_dry_run() {
            println!("burrow: would run: {line}");
            return Ok(0);
        }
        debug!("running: {line}");
        let status = self
            .command(program, args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| SpawnError::PrivilegedCommand(format!("{line}: {e}")))?;
        Ok(status.code().unwrap_or(1))
    }
}

fn success_status() -> std::process::ExitStatus {
    // Create a real success ExitStatus portably.
    Command::new("true").status().unwrap_or_else(|_| {
        Command::new("/bin/true")
            .status()
            .expect("cannot execute /bin/true")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_never_executes() {
        let elevator = Elevator::new(Elevation::DryRun);
        // A command that would fail loudly if actually run.
        let result = elevator.run("mount", &["-t".into(), "proc".into(), "/nonexistent".into()]);
        assert!(result.is_ok());
    }

    #[test]
    fn dry_run_interactive_reports_success() {
        let elevator = Elevator::new(Elevation::DryRun);
        let code = elevator.run_interactive("chroot", &["/nonexistent".into()]).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn direct_runs_unprivileged_commands() {
        let elevator = Elevator::new(Elevation::Direct);
        assert!(elevator.run("true", &[]).is_ok());
        assert!(elevator.run("false", &[]).is_err());
    }

    #[test]
    fn direct_captures_output() {
        let elevator = Elevator::new(Elevation::Direct);
        let out = elevator.run_captured("echo", &["hello".into()]).unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello");
    }

    #[test]
    fn detect_dry_run_wins() {
        let elevator = Elevator::detect(true, true);
        assert_eq!(elevator.mode(), Elevation::DryRun);
        assert!(!elevator.uses_sudo());
    }

    #[test]
    fn render_joins_program_and_args() {
        let line = Elevator::render("mount", &["-t".into(), "proc".into()]);
        assert_eq!(line, "mount -t proc");
    }
}
