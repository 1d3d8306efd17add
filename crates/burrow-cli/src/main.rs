use burrow_runtime::host::BinderOptions;
use burrow_runtime::{
    cleanup_root, install_signal_handler, spawn, unlock, BackendKind, Elevator, SpawnError,
    SpawnOptions,
};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "burrow",
    version,
    about = "Spawn a command inside an ephemeral isolated environment",
    after_help = "Flags must precede the target; everything after it is the command."
)]
struct Cli {
    /// Container image or root directory; anything after it is the command.
    name: Option<String>,

    /// Command to run inside the environment (default: login shell).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Container image to spawn.
    #[arg(long)]
    image: Option<String>,

    /// Root directory to spawn into.
    #[arg(long)]
    dir: Option<PathBuf>,

    /// User to run as: name, uid, or uid:gid.
    #[arg(short, long)]
    user: Option<String>,

    /// Execution architecture (e.g. i686, arm64).
    #[arg(long)]
    arch: Option<String>,

    /// Substitute home directory: source[:dest].
    #[arg(long)]
    bind_home: Option<String>,

    /// Bind a directory: source[:dest[:options]] (repeatable; escape colons in paths as \:).
    #[arg(long = "bind-dir")]
    bind_dir: Vec<String>,

    /// Bind ~/.ssh read-only into the environment.
    #[arg(long)]
    bind_ssh: bool,

    /// Share the host's ssh-agent socket.
    #[arg(long)]
    with_ssh_agent: bool,

    /// Share the host's X11 display.
    #[arg(long)]
    with_x11: bool,

    /// Share the host's PulseAudio server.
    #[arg(long)]
    with_pulseaudio: bool,

    /// Share the host's /dev and /sys trees (chroot backend).
    #[arg(long)]
    share_devices: bool,

    /// Force the docker backend.
    #[arg(long, conflicts_with_all = ["using_nspawn", "using_chroot"])]
    using_docker: bool,

    /// Force the systemd-nspawn backend.
    #[arg(long, conflicts_with = "using_chroot")]
    using_nspawn: bool,

    /// Force the raw chroot backend.
    #[arg(long)]
    using_chroot: bool,

    /// Extra argument passed to the backend verbatim (repeatable).
    #[arg(long = "backend-arg")]
    backend_arg: Vec<String>,

    /// Release the root directory's lock and exit.
    #[arg(long, conflicts_with = "cleanup")]
    unlock: bool,

    /// Unmount leftovers of a crashed invocation, release the lock, and exit.
    #[arg(long)]
    cleanup: bool,

    /// Print privileged commands instead of running them.
    #[arg(long)]
    dry_run: bool,

    /// Non-interactive elevation (sudo -n); fail instead of prompting.
    #[arg(long)]
    batch: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long)]
    trace: bool,
}

impl Cli {
    fn backend(&self) -> Option<BackendKind> {
        if self.using_docker {
            Some(BackendKind::Docker)
        } else if self.using_nspawn {
            Some(BackendKind::Nspawn)
        } else if self.using_chroot {
            Some(BackendKind::Chroot)
        } else {
            None
        }
    }
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BURROW_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    // --unlock and --cleanup bypass the spawn flow entirely.
    if cli.unlock || cli.cleanup {
        return run_maintenance(&cli);
    }

    let opts = SpawnOptions {
        backend: cli.backend(),
        image: cli.image,
        dir: cli.dir,
        name: cli.name,
        command: cli.command,
        user: cli.user,
        arch: cli.arch,
        binders: BinderOptions {
            ssh_agent: cli.with_ssh_agent,
            bind_ssh: cli.bind_ssh,
            x11: cli.with_x11,
            pulseaudio: cli.with_pulseaudio,
            bind_home: cli.bind_home,
            bind_dirs: cli.bind_dir,
        },
        share_devices: cli.share_devices,
        backend_args: cli.backend_arg,
        dry_run: cli.dry_run,
        batch: cli.batch,
    };

    match spawn(&opts) {
        // The in-environment exit code passes through.
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(EXIT_FAILURE)),
        Err(e) => fail(&e),
    }
}

fn run_maintenance(cli: &Cli) -> ExitCode {
    let root = cli
        .dir
        .clone()
        .or_else(|| cli.name.clone().map(PathBuf::from));
    let Some(root) = root else {
        eprintln!("burrow: --unlock and --cleanup need a root directory");
        return ExitCode::from(EXIT_FAILURE);
    };

    let result = if cli.unlock {
        unlock(&root)
    } else {
        let elevator = Elevator::detect(cli.batch, cli.dry_run);
        cleanup_root(&root, &elevator)
    };
    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => fail(&e),
    }
}

fn fail(e: &SpawnError) -> ExitCode {
    eprintln!("burrow: {e}");
    ExitCode::from(EXIT_FAILURE)
}
