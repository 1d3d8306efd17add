use crate::bundle::{BindSpec, Bundle};
use crate::identity::Identity;
use crate::ledger::Ledger;
use crate::privilege::Elevator;
use crate::target::{BackendKind, SpawnTarget};
use crate::SpawnError;

/// Everything a driver needs to translate and execute one invocation.
#[derive(Debug)]
pub struct RunRequest<'a> {
    pub target: &'a SpawnTarget,
    pub identity: &'a Identity,
    pub bundle: &'a Bundle,
    /// Literal command tokens; empty means an interactive login shell.
    pub command: &'a [String],
    pub arch: Option<&'a str>,
    /// Raw backend arguments passed through verbatim.
    pub extra_args: &'a [String],
    pub share_devices: bool,
    pub elevator: &'a Elevator,
}

/// One concrete isolation technology.
///
/// Drivers consume the generic bundle through `translate_env` /
/// `translate_bind` and run the target through `run`; the closed
/// `BackendKind` dispatch below keeps a new backend from silently falling
/// through to wrong behavior.
pub trait BackendDriver {
    fn name(&self) -> &'static str;

    fn available(&self) -> bool;

    /// Append the backend-specific form of one env assignment to `argv`.
    fn translate_env(&self, key: &str, value: &str, argv: &mut Vec<String>);

    /// Append the backend-specific form of one bind mount to `argv`.
    fn translate_bind(&self, bind: &BindSpec, argv: &mut Vec<String>);

    /// Execute the invocation, returning the in-environment exit code.
    fn run(&self, req: &RunRequest<'_>, ledger: &mut Ledger) -> Result<i32, SpawnError>;
}

pub fn driver_for(kind: BackendKind) -> Box<dyn BackendDriver> {
    match kind {
        BackendKind::Docker => Box::new(crate::docker::DockerDriver),
        BackendKind::Nspawn => Box::new(crate::nspawn::NspawnDriver),
        BackendKind::Chroot => Box::new(crate::chroot::ChrootDriver),
    }
}
