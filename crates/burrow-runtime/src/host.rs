use crate::bundle::{parse_bind_spec, parse_home_spec, BindSpec, Bundle};
use crate::identity::Identity;
use crate::ledger::Ledger;
use crate::privilege::current_uid;
use crate::{xauth, SpawnError};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Fixed in-environment path the staged runtime directory is published at.
pub const RUNTIME_DEST: &str = "/run/burrow";

/// The optional host-integration features of one invocation.
#[derive(Debug, Default, Clone)]
pub struct BinderOptions {
    pub ssh_agent: bool,
    pub bind_ssh: bool,
    pub x11: bool,
    pub pulseaudio: bool,
    pub bind_home: Option<String>,
    pub bind_dirs: Vec<String>,
}

/// Run every enabled feature binder against the shared bundle.
///
/// Each binder validates its host-side preconditions, stages ephemeral
/// artifacts into the invocation's runtime directory, and appends the env
/// and bind entries the backends need. A disabled feature appends nothing.
pub fn apply_binders(
    opts: &BinderOptions,
    identity: &Identity,
    ledger: &mut Ledger,
    bundle: &mut Bundle,
) -> Result<(), SpawnError> {
    // Staged artifacts live under the runtime directory, which is published
    // first so the nested socket binds below land inside it.
    if opts.ssh_agent || opts.x11 || opts.pulseaudio {
        let staged = ledger.stage_runtime_dir()?;
        bundle.push_bind(BindSpec::new(staged, RUNTIME_DEST));
    }

    if opts.ssh_agent {
        bind_ssh_agent(bundle, identity)?;
    }
    if opts.bind_ssh {
        bind_ssh_dir(bundle, identity)?;
    }
    if opts.x11 {
        bind_x11(bundle, ledger)?;
    }
    if opts.pulseaudio {
        bind_pulseaudio(bundle, ledger)?;
    }
    if let Some(spec) = opts.bind_home.as_deref() {
        bind_home(bundle, spec, identity)?;
    }
    bind_dirs(bundle, &opts.bind_dirs)?;

    Ok(())
}

fn bind_ssh_agent(bundle: &mut Bundle, identity: &Identity) -> Result<(), SpawnError> {
    let sock = std::env::var("SSH_AUTH_SOCK").map_err(|_| {
        SpawnError::ResourceMissing("SSH_AUTH_SOCK is not set; is an ssh-agent running?".to_owned())
    })?;
    let sock_path = PathBuf::from(&sock);
    if !sock_path.exists() {
        return Err(SpawnError::ResourceMissing(format!(
            "ssh-agent socket '{sock}' does not exist"
        )));
    }

    if identity.uid.is_some() && identity.uid != Some(current_uid()) {
        // The socket stays owned by the invoking user; the mapped identity
        // can only reach it if everyone can.
        warn!("widening permissions on {sock} so uid {:?} can use the agent", identity.uid);
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(&sock_path, std::fs::Permissions::from_mode(0o777))
        {
            warn!("could not widen {sock}: {e}");
        }
    }

    let dest = format!("{RUNTIME_DEST}/ssh-agent.sock");
    bundle.push_bind(BindSpec::new(sock_path, &dest));
    bundle.push_env("SSH_AUTH_SOCK", dest);
    Ok(())
}

fn bind_ssh_dir(bundle: &mut Bundle, identity: &Identity) -> Result<(), SpawnError> {
    let host_home = std::env::var("HOME").map_err(|_| {
        SpawnError::ResourceMissing("HOME is not set; cannot locate ~/.ssh".to_owned())
    })?;
    let source = Path::new(&host_home).join(".ssh");
    if !source.is_dir() {
        return Err(SpawnError::ResourceMissing(format!(
            "'{}' does not exist",
            source.display()
        )));
    }
    let Some(home) = &identity.home else {
        return Err(SpawnError::Validation(
            "cannot determine the in-environment home for --bind-ssh; pass --user or --bind-home"
                .to_owned(),
        ));
    };
    bundle.push_bind(BindSpec::read_only(source, home.join(".ssh")));
    Ok(())
}

fn bind_x11(bundle: &mut Bundle, ledger: &mut Ledger) -> Result<(), SpawnError> {
    let display = std::env::var("DISPLAY").map_err(|_| {
        SpawnError::ResourceMissing("DISPLAY is not set; no X server to share".to_owned())
    })?;
    let socket_dir = Path::new("/tmp/.X11-unix");
    if !socket_dir.exists() {
        return Err(SpawnError::ResourceMissing(
            "/tmp/.X11-unix does not exist; no X socket directory to share".to_owned(),
        ));
    }

    let staged = ledger.stage_runtime_dir()?;
    xauth::stage_wildcard_cookie(&display, &staged.join("Xauthority"))?;

    bundle.push_bind(BindSpec::read_only(socket_dir, socket_dir));
    bundle.push_env("DISPLAY", display);
    bundle.push_env("XAUTHORITY", format!("{RUNTIME_DEST}/Xauthority"));
    Ok(())
}

/// Parse the socket path out of `pactl info` output.
fn parse_pactl_server(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let value = line.strip_prefix("Server String:")?.trim();
        Some(value.strip_prefix("unix:").unwrap_or(value).to_owned())
    })
}

fn discover_pulse_socket() -> Result<PathBuf, SpawnError> {
    if let Ok(server) = std::env::var("PULSE_SERVER") {
        let path = server.strip_prefix("unix:").unwrap_or(&server).to_owned();
        return Ok(PathBuf::from(path));
    }
    let output = Command::new("pactl").arg("info").output().map_err(|e| {
        SpawnError::ResourceMissing(format!("pactl not runnable: {e}; is PulseAudio installed?"))
    })?;
    if !output.status.success() {
        return Err(SpawnError::ResourceMissing(
            "pactl info failed; is the PulseAudio server running?".to_owned(),
        ));
    }
    parse_pactl_server(&String::from_utf8_lossy(&output.stdout))
        .map(PathBuf::from)
        .ok_or_else(|| {
            SpawnError::ResourceMissing("pactl info did not report a server string".to_owned())
        })
}

fn find_pulse_cookie() -> Result<PathBuf, SpawnError> {
    if let Ok(cookie) = std::env::var("PULSE_COOKIE") {
        let path = PathBuf::from(cookie);
        if path.exists() {
            return Ok(path);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        for candidate in [".config/pulse/cookie", ".pulse-cookie"] {
            let path = Path::new(&home).join(candidate);
            if path.exists() {
                return Ok(path);
            }
        }
    }
    Err(SpawnError::ResourceMissing(
        "no PulseAudio cookie found (PULSE_COOKIE, ~/.config/pulse/cookie, ~/.pulse-cookie)"
            .to_owned(),
    ))
}

fn bind_pulseaudio(bundle: &mut Bundle, ledger: &mut Ledger) -> Result<(), SpawnError> {
    let socket = discover_pulse_socket()?;
    if !socket.exists() {
        return Err(SpawnError::ResourceMissing(format!(
            "PulseAudio socket '{}' does not exist",
            socket.display()
        )));
    }
    let cookie = find_pulse_cookie()?;

    let staged = ledger.stage_runtime_dir()?;
    std::fs::copy(&cookie, staged.join("pulse-cookie"))?;
    debug!("staged pulse cookie from {}", cookie.display());

    let dest = format!("{RUNTIME_DEST}/pulse/native");
    bundle.push_bind(BindSpec::new(socket, &dest));
    bundle.push_env("PULSE_SERVER", format!("unix:{dest}"));
    bundle.push_env("PULSE_COOKIE", format!("{RUNTIME_DEST}/pulse-cookie"));
    Ok(())
}

fn bind_home(bundle: &mut Bundle, spec: &str, identity: &Identity) -> Result<(), SpawnError> {
    let (source, dest) = parse_home_spec(spec)?;
    if !source.is_dir() {
        return Err(SpawnError::ResourceMissing(format!(
            "home source '{}' does not exist",
            source.display()
        )));
    }
    let dest = match dest.or_else(|| identity.home.clone()) {
        Some(d) => d,
        None => {
            return Err(SpawnError::Validation(format!(
                "cannot determine the home destination for user '{}'; use --bind-home src:dest",
                identity.name
            )))
        }
    };
    bundle.push_bind(BindSpec::new(source, &dest));
    bundle.push_env("HOME", dest.to_string_lossy().into_owned());
    Ok(())
}

fn bind_dirs(bundle: &mut Bundle, specs: &[String]) -> Result<(), SpawnError> {
    for (index, raw) in specs.iter().enumerate() {
        let bind = parse_bind_spec(raw)?;
        if !bind.source.exists() {
            return Err(SpawnError::ResourceMissing(format!(
                "bind source '{}' does not exist",
                bind.source.display()
            )));
        }
        let workdir = (index == 0).then(|| bind.dest.clone());
        bundle.push_bind(bind);
        if let Some(dir) = workdir {
            // The first bind's destination doubles as the working directory.
            bundle.set_workdir(&dir);
            bundle.push_env("BURROW_WORKDIR", dir.to_string_lossy().into_owned());
        }
    }
    Ok(())
}
