use crate::SpawnError;
use std::path::{Path, PathBuf};

/// The closed set of isolation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Docker,
    Nspawn,
    Chroot,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Docker => "docker",
            BackendKind::Nspawn => "nspawn",
            BackendKind::Chroot => "chroot",
        }
    }

    pub fn is_directory_backend(self) -> bool {
        matches!(self, BackendKind::Nspawn | BackendKind::Chroot)
    }
}

/// The thing to spawn into, immutable once resolved.
#[derive(Debug, Clone)]
pub struct SpawnTarget {
    pub kind: BackendKind,
    pub image: Option<String>,
    pub root: Option<PathBuf>,
}

impl SpawnTarget {
    pub fn is_directory_backend(&self) -> bool {
        self.kind.is_directory_backend()
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn display_name(&self) -> String {
        match (&self.image, &self.root) {
            (Some(image), _) => image.clone(),
            (None, Some(root)) => root.display().to_string(),
            (None, None) => "<unresolved>".to_owned(),
        }
    }
}

/// The target-related CLI inputs, prior to resolution.
#[derive(Debug, Default)]
pub struct TargetFlags<'a> {
    /// Explicit `--using-*` driver choice.
    pub backend: Option<BackendKind>,
    pub image: Option<&'a str>,
    pub dir: Option<&'a Path>,
    pub positional: Option<&'a str>,
}

#[derive(Debug)]
pub struct ResolvedTarget {
    pub target: SpawnTarget,
    /// Whether the positional name was consumed as the target. When false
    /// the caller must treat it as the first word of the command.
    pub positional_consumed: bool,
}

fn absolutize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn directory_kind(explicit: Option<BackendKind>, nspawn_present: bool) -> BackendKind {
    match explicit {
        Some(kind) => kind,
        None if nspawn_present => BackendKind::Nspawn,
        None => BackendKind::Chroot,
    }
}

/// Resolve a unique `SpawnTarget` from explicit backend flags, explicit
/// target-kind flags, and the positional name.
///
/// Precedence: an explicit `--using-*` flag always wins; otherwise `--image`
/// implies the container backend and `--dir` a directory backend; otherwise
/// a positional name that exists as a directory selects a directory backend
/// and anything else is treated as an image. A directory backend without an
/// explicit driver prefers systemd-nspawn when present, else raw chroot.
///
/// When both `--dir` and a directory-like positional are given, the flag is
/// authoritative and the positional becomes the first word of the command.
pub fn resolve_target(
    flags: &TargetFlags<'_>,
    nspawn_present: bool,
) -> Result<ResolvedTarget, SpawnError> {
    if flags.image.is_some() && flags.dir.is_some() {
        return Err(SpawnError::Validation(
            "both --image and --dir given; pick one target kind".to_owned(),
        ));
    }

    match flags.backend {
        Some(BackendKind::Docker) => {
            if flags.dir.is_some() {
                return Err(SpawnError::Validation(
                    "--using-docker needs an image, not --dir".to_owned(),
                ));
            }
            let (image, consumed) = match (flags.image, flags.positional) {
                (Some(image), _) => (image.to_owned(), false),
                (None, Some(name)) => (name.to_owned(), true),
                (None, None) => {
                    return Err(SpawnError::Validation(
                        "no image given for the docker backend".to_owned(),
                    ))
                }
            };
            Ok(ResolvedTarget {
                target: SpawnTarget {
                    kind: BackendKind::Docker,
                    image: Some(image),
                    root: None,
                },
                positional_consumed: consumed,
            })
        }
        Some(kind @ (BackendKind::Nspawn | BackendKind::Chroot)) => {
            if flags.image.is_some() {
                return Err(SpawnError::Validation(format!(
                    "--using-{} needs a root directory, not --image",
                    kind.as_str()
                )));
            }
            let (root, consumed) = resolve_root_dir(flags)?;
            Ok(ResolvedTarget {
                target: SpawnTarget {
                    kind,
                    image: None,
                    root: Some(root),
                },
                positional_consumed: consumed,
            })
        }
        None => {
            if let Some(image) = flags.image {
                return Ok(ResolvedTarget {
                    target: SpawnTarget {
                        kind: BackendKind::Docker,
                        image: Some(image.to_owned()),
                        root: None,
                    },
                    positional_consumed: false,
                });
            }
            if flags.dir.is_some() {
                let (root, consumed) = resolve_root_dir(flags)?;
                return Ok(ResolvedTarget {
                    target: SpawnTarget {
                        kind: directory_kind(None, nspawn_present),
                        image: None,
                        root: Some(root),
                    },
                    positional_consumed: consumed,
                });
            }
            let Some(name) = flags.positional else {
                return Err(SpawnError::Validation(
                    "no target given; pass an image name, a root directory, --image, or --dir"
                        .to_owned(),
                ));
            };
            if Path::new(name).is_dir() {
                Ok(ResolvedTarget {
                    target: SpawnTarget {
                        kind: directory_kind(None, nspawn_present),
                        image: None,
                        root: Some(absolutize(Path::new(name))),
                    },
                    positional_consumed: true,
                })
            } else {
                Ok(ResolvedTarget {
                    target: SpawnTarget {
                        kind: BackendKind::Docker,
                        image: Some(name.to_owned()),
                        root: None,
                    },
                    positional_consumed: true,
                })
            }
        }
    }
}

fn resolve_root_dir(flags: &TargetFlags<'_>) -> Result<(PathBuf, bool), SpawnError> {
    if let Some(dir) = flags.dir {
        if !dir.is_dir() {
            return Err(SpawnError::Validation(format!(
                "root directory '{}' does not exist",
                dir.display()
            )));
        }
        return Ok((absolutize(dir), false));
    }
    if let Some(name) = flags.positional {
        let path = Path::new(name);
        if !path.is_dir() {
            return Err(SpawnError::Validation(format!(
                "root directory '{name}' does not exist"
            )));
        }
        return Ok((absolutize(path), true));
    }
    Err(SpawnError::Validation(
        "no root directory given for the directory backend".to_owned(),
    ))
}
