use crate::SpawnError;
use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

/// Rewrite the address family of each `xauth nlist` entry to the ffff
/// wildcard, so the cookie authenticates from any hostname.
///
/// The spawned environment's hostname differs from the host's, which makes
/// hostname-bound cookie entries useless inside it. An nlist line starts
/// with four hex digits of connection family; `ffff` is the FamilyWild
/// encoding and the rest of the line is preserved verbatim.
pub fn wildcard_entries(nlist: &str) -> String {
    let mut out = String::with_capacity(nlist.len());
    for line in nlist.lines() {
        if line.len() >= 4 && line.as_bytes()[..4].iter().all(u8::is_ascii_hexdigit) {
            out.push_str("ffff");
            out.push_str(&line[4..]);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// Extract the host cookie for `display` and merge a wildcard-family copy
/// into the private authority file at `out`.
pub fn stage_wildcard_cookie(display: &str, out: &Path) -> Result<(), SpawnError> {
    let listing = Command::new("xauth")
        .args(["nlist", display])
        .output()
        .map_err(|e| SpawnError::ResourceMissing(format!("xauth not runnable: {e}")))?;
    if !listing.status.success() {
        return Err(SpawnError::ResourceMissing(format!(
            "xauth nlist {display} failed: {}",
            String::from_utf8_lossy(&listing.stderr).trim()
        )));
    }
    let entries = wildcard_entries(&String::from_utf8_lossy(&listing.stdout));
    if entries.trim().is_empty() {
        return Err(SpawnError::ResourceMissing(format!(
            "no X authority cookie found for display {display}"
        )));
    }

    // The file must exist before nmerge writes into it.
    std::fs::write(out, b"")?;

    let mut merge = Command::new("xauth")
        .args(["-f", &out.to_string_lossy(), "nmerge", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SpawnError::ResourceMissing(format!("xauth not runnable: {e}")))?;
    if let Some(stdin) = merge.stdin.as_mut() {
        stdin.write_all(entries.as_bytes())?;
    }
    let status = merge.wait()?;
    if !status.success() {
        return Err(SpawnError::ResourceMissing(format!(
            "xauth nmerge into {} failed",
            out.display()
        )));
    }
    debug!("staged wildcard X cookie at {}", out.display());
    Ok(())
}
