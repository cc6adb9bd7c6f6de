//! Launching the build root process under interception.

use std::path::PathBuf;

use quickbuild_shared::env as names;
use quickbuild_shared::errors::{QbError, QbResult};
use tokio::process::{Child, Command};

/// What to run and how to wire it to the supervisor.
pub struct LaunchSpec {
    /// The build command; first element is the program.
    pub command: Vec<String>,
    /// Absolute path of the interceptor library to preload.
    pub interceptor_path: PathBuf,
    /// The `FB_SOCKET` prefix the supervisor bound its socket under.
    pub socket_prefix: PathBuf,
}

/// Spawn the build root with the interceptor preloaded and the supervisor
/// socket announced. Every descendant inherits (or gets re-injected with)
/// these variables and reports in on its own connection.
pub fn launch_build(spec: &LaunchSpec) -> QbResult<Child> {
    let (program, args) = spec
        .command
        .split_first()
        .ok_or_else(|| QbError::Launch("empty build command".into()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env(names::FB_SOCKET, &spec.socket_prefix)
        .env(names::LD_PRELOAD, &spec.interceptor_path);

    tracing::info!(
        program,
        ?args,
        interceptor = %spec.interceptor_path.display(),
        "launching build root"
    );

    cmd.spawn()
        .map_err(|e| QbError::Launch(format!("cannot spawn {}: {}", program, e)))
}
