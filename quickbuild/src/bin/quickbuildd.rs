//! Supervisor driver binary.
//!
//! Binds the control socket, launches the build command under the preloaded
//! interceptor, and runs the event loop until the build root exits. The
//! build's exit status becomes our own.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;
use quickbuild::{launch_build, LaunchSpec, LoggingSink, QbError, QbResult, Supervisor};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Quickbuild supervisor - observes a build via a preloaded interceptor")]
struct Args {
    /// Path of the interceptor shared library to preload into the build.
    #[arg(long)]
    interceptor: PathBuf,

    /// Directory for the control socket; a temporary one by default.
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// The build command to run.
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> QbResult<()> {
    let args = Args::parse();
    init_logging();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| QbError::Internal(format!("runtime: {}", e)))?;

    let status = runtime.block_on(async move {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let socket_dir = match &args.socket_dir {
                    Some(dir) => {
                        std::fs::create_dir_all(dir)?;
                        dir.clone()
                    }
                    None => {
                        let dir = std::env::temp_dir()
                            .join(format!("quickbuild-{}", std::process::id()));
                        std::fs::create_dir_all(&dir)?;
                        dir
                    }
                };
                let prefix = socket_dir.join("sock");

                let sink = Rc::new(RefCell::new(LoggingSink));
                let supervisor = Supervisor::bind(&prefix, sink)?;

                let mut child = launch_build(&LaunchSpec {
                    command: args.command.clone(),
                    interceptor_path: args.interceptor.clone(),
                    socket_prefix: prefix,
                })?;

                tokio::select! {
                    res = supervisor.run() => {
                        res?;
                        Err(QbError::Supervisor("event loop ended early".into()))
                    }
                    status = child.wait() => {
                        let status = status.map_err(|e| {
                            QbError::Launch(format!("waiting for the build: {}", e))
                        })?;
                        tracing::info!(?status, "build root exited");
                        Ok(status.code().unwrap_or(1))
                    }
                }
            })
            .await
    })?;

    std::process::exit(status);
}
