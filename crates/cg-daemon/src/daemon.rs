use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{error, info, warn};

use cg_bridge::http_api::{api_router, ApiState};
use cg_core::config::Config;
use cg_core::shutdown::ShutdownSignal;
use cg_runtime::ContainerRuntime;
use cg_session::{executor, SessionManager};

/// How long background loops get to confirm they stopped.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The crogia daemon.
///
/// Serves the API until the [`ShutdownSignal`] fires, running the idle
/// janitor alongside. On shutdown every shell is closed; containers keep
/// running so sessions survive a restart and are reconciled on the next boot.
pub struct Daemon {
    config: Config,
    manager: Arc<SessionManager>,
    api_state: Arc<ApiState>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Build a daemon with the runtime selected by `runtime.kind`.
    pub fn new(config: Config) -> Result<Self> {
        let runtime = cg_runtime::from_config(&config.runtime)
            .context("failed to initialize container runtime")?;
        Self::with_runtime(config, runtime)
    }

    /// Build a daemon on an explicit runtime.
    pub fn with_runtime(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let executor = executor::by_name(&config.general.executor)
            .ok_or_else(|| anyhow!("unknown executor {:?}", config.general.executor))?;
        let manager = Arc::new(
            SessionManager::new(config.clone(), runtime)
                .context("failed to initialize session manager")?,
        );
        let api_state = Arc::new(ApiState::new(Arc::clone(&manager), executor));
        Ok(Self {
            config,
            manager,
            api_state,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn api_state(&self) -> &Arc<ApiState> {
        &self.api_state
    }

    /// Bind `daemon.host:daemon.port` and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Serve on a pre-bound listener until shutdown (port 0 works for tests).
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        match self.manager.reconcile().await {
            Ok(dropped) => info!(
                sessions = self.manager.store().len(),
                dropped,
                "session store reconciled"
            ),
            Err(e) => warn!(error = %e, "reconcile failed, keeping persisted sessions"),
        }

        let janitor = self.manager.spawn_janitor(self.shutdown.clone());
        let router = api_router(Arc::clone(&self.api_state));

        let bind_addr = listener.local_addr()?;
        info!(
            %bind_addr,
            runtime = self.manager.runtime().name(),
            executor = self.api_state.executor.name(),
            "API server listening"
        );

        let manager = Arc::clone(&self.manager);
        let shutdown = self.shutdown.clone();
        let grace = self.config.terminal.close_grace();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.wait().await;
                // Ends every terminal bridge so in-flight connections finish.
                manager.close_all_shells(grace).await;
            })
            .await;

        if let Err(e) = &served {
            error!(error = %e, "API server error");
            // Stop the janitor too when the server died on its own.
            self.shutdown.trigger();
        }

        if !self
            .shutdown
            .wait_for_drain(1, DRAIN_TIMEOUT)
            .await
            .is_complete()
        {
            janitor.abort();
        }
        info!("daemon stopped");
        served.context("API server failed")
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("manager", &self.manager)
            .field("shutting_down", &self.shutdown.is_shutting_down())
            .finish()
    }
}
