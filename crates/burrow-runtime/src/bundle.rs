use crate::SpawnError;
use std::path::{Path, PathBuf};

/// One host path mapped into the spawned environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub options: Option<String>,
}

impl BindSpec {
    pub fn new(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            options: None,
        }
    }

    pub fn read_only(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            options: Some("ro".to_owned()),
            ..Self::new(source, dest)
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.options
            .as_deref()
            .is_some_and(|o| o.split(',').any(|part| part == "ro"))
    }
}

/// One entry of the environment bundle.
///
/// Order is significant: an env assignment may reference the destination of
/// an earlier bind, and nested binds must come after the bind they sit under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvEntry {
    Env { key: String, value: String },
    Bind(BindSpec),
}

/// The ordered environment/bind bundle consumed by a backend driver.
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    entries: Vec<EnvEntry>,
    workdir: Option<PathBuf>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push(EnvEntry::Env {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn push_bind(&mut self, bind: BindSpec) {
        self.entries.push(EnvEntry::Bind(bind));
    }

    pub fn entries(&self) -> &[EnvEntry] {
        &self.entries
    }

    pub fn binds(&self) -> impl Iterator<Item = &BindSpec> {
        self.entries.iter().filter_map(|e| match e {
            EnvEntry::Bind(b) => Some(b),
            EnvEntry::Env { .. } => None,
        })
    }

    pub fn env_vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|e| match e {
            EnvEntry::Env { key, value } => Some((key.as_str(), value.as_str())),
            EnvEntry::Bind(_) => None,
        })
    }

    /// The in-environment working directory, established by the first
    /// `--bind-dir` destination.
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    pub fn set_workdir(&mut self, dir: impl Into<PathBuf>) {
        if self.workdir.is_none() {
            self.workdir = Some(dir.into());
        }
    }
}

/// Split on `:` honoring `\:` escapes inside path components.
fn split_escaped(raw: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in raw.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == ':' {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    if escaped {
        current.push('\\');
    }
    fields.push(current);
    fields
}

/// Parse a `source[:dest[:options]]` specification into a structured record.
///
/// `dest` defaults to `source`. Colons inside a path are written `\:`.
pub fn parse_bind_spec(raw: &str) -> Result<BindSpec, SpawnError> {
    let fields = split_escaped(raw);
    if fields.len() > 3 {
        return Err(SpawnError::Validation(format!(
            "bind spec '{raw}' has too many fields; expected source[:dest[:options]]"
        )));
    }
    let source = &fields[0];
    if source.is_empty() {
        return Err(SpawnError::Validation(format!(
            "bind spec '{raw}' has an empty source"
        )));
    }
    if !source.starts_with('/') {
        return Err(SpawnError::Validation(format!(
            "bind source '{source}' must be an absolute path"
        )));
    }

    let dest = match fields.get(1).map(String::as_str) {
        None | Some("") => source.clone(),
        Some(d) => {
            if !d.starts_with('/') {
                return Err(SpawnError::Validation(format!(
                    "bind destination '{d}' must be an absolute path"
                )));
            }
            d.to_owned()
        }
    };

    let options = fields
        .get(2)
        .filter(|o| !o.is_empty())
        .map(ToOwned::to_owned);

    Ok(BindSpec {
        source: PathBuf::from(source),
        dest: PathBuf::from(dest),
        options,
    })
}

/// Parse a `source[:dest]` home-remap specification.
pub fn parse_home_spec(raw: &str) -> Result<(PathBuf, Option<PathBuf>), SpawnError> {
    let fields = split_escaped(raw);
    if fields.len() > 2 {
        return Err(SpawnError::Validation(format!(
            "home spec '{raw}' has too many fields; expected source[:dest]"
        )));
    }
    let source = &fields[0];
    if source.is_empty() || !source.starts_with('/') {
        return Err(SpawnError::Validation(format!(
            "home source '{source}' must be an absolute path"
        )));
    }
    let dest = match fields.get(1).map(String::as_str) {
        None | Some("") => None,
        Some(d) => {
            if !d.starts_with('/') {
                return Err(SpawnError::Validation(format!(
                    "home destination '{d}' must be an absolute path"
                )));
            }
            Some(PathBuf::from(d))
        }
    };
    Ok((PathBuf::from(source), dest))
}
