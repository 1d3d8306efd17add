use crate::privilege::current_uid;
use crate::target::SpawnTarget;
use crate::SpawnError;
use std::path::{Path, PathBuf};

/// Safe wrapper around libc::getgid().
#[allow(unsafe_code)]
fn current_gid() -> u32 {
    // SAFETY: getgid() is always safe — no arguments, no side effects, cannot fail.
    unsafe { libc::getgid() }
}

/// The identity the spawned process runs as, resolved once per invocation.
///
/// uid/gid/home may stay unknown for container backends, where a non-numeric
/// name is trusted to the container's own user database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub home: Option<PathBuf>,
}

impl Identity {
    pub fn root() -> Self {
        Self {
            name: "root".to_owned(),
            uid: Some(0),
            gid: Some(0),
            home: Some(PathBuf::from("/root")),
        }
    }

    /// The invoking host identity.
    pub fn host() -> Self {
        let uid = current_uid();
        if uid == 0 {
            return Self::root();
        }
        let name = std::env::var("USER").unwrap_or_else(|_| uid.to_string());
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(format!("/home/{name}")));
        Self {
            name,
            uid: Some(uid),
            gid: Some(current_gid()),
            home: Some(home),
        }
    }

    /// `uid:gid` form for `chroot --userspec` and `docker --user`, when the
    /// numeric ids are known.
    pub fn uid_gid_spec(&self) -> Option<String> {
        let uid = self.uid?;
        Some(format!("{uid}:{}", self.gid.unwrap_or(uid)))
    }
}

/// `"1000"` → (1000, None); `"1000:100"` → (1000, Some(100)); names → None.
fn parse_numeric_spec(spec: &str) -> Option<(u32, Option<u32>)> {
    match spec.split_once(':') {
        Some((uid, gid)) => {
            let uid = uid.parse().ok()?;
            let gid = gid.parse().ok()?;
            Some((uid, Some(gid)))
        }
        None => spec.parse().ok().map(|uid| (uid, None)),
    }
}

/// One line of an `etc/passwd` database.
fn parse_passwd_line(line: &str) -> Option<(String, u32, u32, PathBuf)> {
    let mut fields = line.split(':');
    let name = fields.next()?.to_owned();
    let _password = fields.next()?;
    let uid = fields.next()?.parse().ok()?;
    let gid = fields.next()?.parse().ok()?;
    let _gecos = fields.next()?;
    let home = PathBuf::from(fields.next()?);
    Some((name, uid, gid, home))
}

fn lookup_in_passwd(root: &Path, spec: &str) -> Option<Identity> {
    let content = std::fs::read_to_string(root.join("etc/passwd")).ok()?;
    let numeric: Option<u32> = spec.parse().ok();
    for line in content.lines() {
        let Some((name, uid, gid, home)) = parse_passwd_line(line) else {
            continue;
        };
        let matches = match numeric {
            Some(wanted) => uid == wanted,
            None => name == spec,
        };
        if matches {
            return Some(Identity {
                name,
                uid: Some(uid),
                gid: Some(gid),
                home: Some(home),
            });
        }
    }
    None
}

/// Resolve a user specifier (`name`, `uid`, or `uid:gid`) against the target.
///
/// uid 0 and the name "root" short-circuit to `{root, 0, 0, /root}` without
/// touching any database. Directory backends consult the *target's*
/// `etc/passwd`; container backends pass numeric ids through and trust other
/// names to the container's own database.
pub fn resolve_identity(
    spec: Option<&str>,
    target: &SpawnTarget,
) -> Result<Identity, SpawnError> {
    let Some(spec) = spec else {
        return Ok(Identity::host());
    };

    if spec == "root" || spec == "0" || spec.starts_with("0:") {
        return Ok(Identity::root());
    }

    let numeric = parse_numeric_spec(spec);

    if let Some(root) = target.root() {
        // Directory backend: the target's user database is authoritative.
        if let Some(mut found) = lookup_in_passwd(root, spec.split(':').next().unwrap_or(spec)) {
            if let Some((_, Some(gid))) = numeric {
                found.gid = Some(gid);
            }
            return Ok(found);
        }
        let Some((uid, gid)) = numeric else {
            return Err(SpawnError::Validation(format!(
                "user '{spec}' not found in {}/etc/passwd",
                root.display()
            )));
        };
        return Ok(Identity {
            name: spec.split(':').next().unwrap_or(spec).to_owned(),
            uid: Some(uid),
            gid: Some(gid.unwrap_or(uid)),
            home: None,
        });
    }

    // Container backend: the image's database is opaque from here.
    if let Some((uid, gid)) = numeric {
        return Ok(Identity {
            name: uid.to_string(),
            uid: Some(uid),
            gid,
            home: None,
        });
    }
    let host = Identity::host();
    if spec == host.name {
        return Ok(host);
    }
    Ok(Identity {
        name: spec.to_owned(),
        uid: None,
        gid: None,
        home: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::BackendKind;

    fn docker_target() -> SpawnTarget {
        SpawnTarget {
            kind: BackendKind::Docker,
            image: Some("app:latest".to_owned()),
            root: None,
        }
    }

    fn dir_target(root: &Path) -> SpawnTarget {
        SpawnTarget {
            kind: BackendKind::Chroot,
            image: None,
            root: Some(root.to_path_buf()),
        }
    }

    fn write_passwd(root: &Path) {
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::write(
            root.join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\n\
             dev:x:1000:100:Developer:/home/dev:/bin/bash\n",
        )
        .unwrap();
    }

    #[test]
    fn root_resolves_without_any_database() {
        let target = dir_target(Path::new("/nonexistent"));
        for spec in ["root", "0", "0:0", "0:5"] {
            let id = resolve_identity(Some(spec), &target).unwrap();
            assert_eq!(id, Identity::root(), "spec {spec}");
        }
    }

    #[test]
    fn no_spec_falls_back_to_host_identity() {
        let id = resolve_identity(None, &docker_target()).unwrap();
        assert!(id.uid.is_some());
        assert!(id.home.is_some());
    }

    #[test]
    fn directory_backend_reads_target_passwd_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        write_passwd(tmp.path());
        let id = resolve_identity(Some("dev"), &dir_target(tmp.path())).unwrap();
        assert_eq!(id.name, "dev");
        assert_eq!(id.uid, Some(1000));
        assert_eq!(id.gid, Some(100));
        assert_eq!(id.home, Some(PathBuf::from("/home/dev")));
    }

    #[test]
    fn directory_backend_reads_target_passwd_by_uid() {
        let tmp = tempfile::tempdir().unwrap();
        write_passwd(tmp.path());
        let id = resolve_identity(Some("1000"), &dir_target(tmp.path())).unwrap();
        assert_eq!(id.name, "dev");
        assert_eq!(id.home, Some(PathBuf::from("/home/dev")));
    }

    #[test]
    fn directory_backend_unknown_name_fails() {
        let tmp = tempfile::tempdir().unwrap();
        write_passwd(tmp.path());
        let err = resolve_identity(Some("ghost"), &dir_target(tmp.path())).unwrap_err();
        assert!(matches!(err, SpawnError::Validation(_)));
    }

    #[test]
    fn directory_backend_numeric_without_entry_passes_through() {
        let tmp = tempfile::tempdir().unwrap();
        write_passwd(tmp.path());
        let id = resolve_identity(Some("4242:4242"), &dir_target(tmp.path())).unwrap();
        assert_eq!(id.uid, Some(4242));
        assert_eq!(id.gid, Some(4242));
        assert!(id.home.is_none());
    }

    #[test]
    fn explicit_gid_overrides_passwd_gid() {
        let tmp = tempfile::tempdir().unwrap();
        write_passwd(tmp.path());
        let id = resolve_identity(Some("1000:9999"), &dir_target(tmp.path())).unwrap();
        assert_eq!(id.gid, Some(9999));
    }

    #[test]
    fn container_numeric_passthrough() {
        let id = resolve_identity(Some("1000"), &docker_target()).unwrap();
        assert_eq!(id.uid, Some(1000));
        assert!(id.gid.is_none());
        assert!(id.home.is_none());
    }

    #[test]
    fn container_foreign_name_trusted_as_is() {
        let id = resolve_identity(Some("appuser"), &docker_target()).unwrap();
        assert_eq!(id.name, "appuser");
        assert!(id.uid.is_none());
        assert!(id.home.is_none());
    }

    #[test]
    fn uid_gid_spec_defaults_gid_to_uid() {
        let id = Identity {
            name: "dev".to_owned(),
            uid: Some(1000),
            gid: None,
            home: None,
        };
        assert_eq!(id.uid_gid_spec().as_deref(), Some("1000:1000"));
        assert!(Identity {
            uid: None,
            ..id
        }
        .uid_gid_spec()
        .is_none());
    }
}
