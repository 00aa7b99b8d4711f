//! crogia daemon: session control plane for containerized agent workspaces.

use anyhow::{Context, Result};
use tracing::{error, info};

use cg_core::shutdown::ShutdownSignal;
use cg_daemon::daemon::Daemon;
use cg_daemon::environment;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let env = environment::environment_name();
    let cwd = std::env::current_dir().context("failed to read working directory")?;
    let env_files = environment::load_env_files(&cwd, &env);

    let config = environment::resolve_config()?;
    cg_telemetry::logging::init_from_config("cg-daemon", &config.general);
    for file in &env_files {
        info!(path = %file.display(), "loaded environment file");
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %env,
        pid = std::process::id(),
        "crogia daemon starting"
    );

    let daemon = Daemon::new(config)?;
    tokio::spawn(shutdown_on_signal(daemon.shutdown_handle()));

    if let Err(e) = daemon.run().await {
        error!(error = %e, "daemon execution failed");
        return Err(e);
    }
    Ok(())
}

/// Trigger shutdown on ctrl-c, or SIGTERM on unix.
async fn shutdown_on_signal(shutdown: ShutdownSignal) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received, initiating shutdown"),
        _ = terminate => info!("SIGTERM received, initiating shutdown"),
    }
    shutdown.trigger();
}
