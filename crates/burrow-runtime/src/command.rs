use std::fmt::Write as _;
use std::path::Path;

/// Single-quoting in POSIX shell: replace ' with '\'' then wrap in '.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Shell-escape a Path for safe interpolation.
pub fn shell_quote_path(p: &Path) -> String {
    shell_quote(&p.to_string_lossy())
}

/// The literal command to run inside the spawned environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledCommand {
    /// A `/bin/sh -c` script. Every user-supplied token is individually
    /// quote-escaped, so the script survives one additional interpretation
    /// layer (the raw-chroot driver embeds it inside an outer script).
    pub script: String,
    /// True when no literal command was given and a login shell runs.
    pub interactive: bool,
}

/// Build the in-environment invocation: change into the bind-established
/// working directory when one exists, then exec either the literal command
/// or an interactive login shell.
pub fn assemble(command: &[String], workdir: Option<&Path>, shell: &str) -> AssembledCommand {
    let mut script = String::new();
    if let Some(dir) = workdir {
        let _ = write!(script, "cd {} && ", shell_quote_path(dir));
    }

    if command.is_empty() {
        let _ = write!(script, "exec {shell} -l");
        return AssembledCommand {
            script,
            interactive: true,
        };
    }

    script.push_str("exec");
    for token in command {
        script.push(' ');
        script.push_str(&shell_quote(token));
    }
    AssembledCommand {
        script,
        interactive: false,
    }
}

/// Pick the login shell for a directory-backed root: bash when the root
/// ships it, plain sh otherwise.
pub fn login_shell_for_root(root: &Path) -> &'static str {
    if root.join("bin/bash").exists() || root.join("usr/bin/bash").exists() {
        "/bin/bash"
    } else {
        "/bin/sh"
    }
}
