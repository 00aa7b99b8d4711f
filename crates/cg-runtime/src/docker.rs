use std::future::Future;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use cg_core::config::RuntimeConfig;

use crate::{
    CommandSpec, ContainerHandle, ContainerRuntime, ContainerState, ExecOptions, ExecOutput,
    Result, RuntimeError,
};

/// Docker engine adapter.
///
/// Containers run the configured shell with a TTY so they stay up, with the
/// workspace bind-mounted at `container_workdir`. Interactive shells attach
/// through the docker CLI (`docker exec -it`) so they can sit on a PTY.
pub struct DockerRuntime {
    docker: Docker,
    config: RuntimeConfig,
}

impl DockerRuntime {
    pub fn connect(config: RuntimeConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self { docker, config })
    }

    async fn create(
        &self,
        name: &str,
        image: &str,
        workspace: &Path,
    ) -> std::result::Result<String, BollardError> {
        let bind = format!(
            "{}:{}:rw",
            workspace.display(),
            self.config.container_workdir
        );
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec![self.config.shell.clone()]),
            tty: Some(true),
            open_stdin: Some(true),
            working_dir: Some(self.config.container_workdir.clone()),
            host_config: Some(HostConfig {
                binds: Some(vec![bind]),
                network_mode: Some(self.config.network_mode.clone()),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        };
        let response = self.docker.create_container(Some(options), config).await?;
        Ok(response.id)
    }

    async fn pull(&self, image: &str) -> Result<()> {
        info!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    RuntimeError::ImageNotFound(image.to_string())
                } else {
                    classify(e, "image pull")
                }
            })?;
        Ok(())
    }

    async fn remove(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => debug!(container_id = id, "container removed"),
            Err(e) if is_not_found(&e) => {}
            Err(e) => warn!(container_id = id, error = %e, "failed to remove container"),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn start(&self, name: &str, image: &str, workspace: &Path) -> Result<ContainerHandle> {
        let id = create_pulling_once(
            image,
            move || self.create(name, image, workspace),
            move || self.pull(image),
        )
        .await?;

        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove(&id).await;
            return Err(classify(e, "container start"));
        }

        info!(container_id = %id, image, workspace = %workspace.display(), "container started");
        Ok(ContainerHandle::new(id))
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        let options = StopContainerOptions {
            t: self.config.stop_timeout_secs as i64,
        };
        match self.docker.stop_container(&handle.id, Some(options)).await {
            Ok(()) => {}
            // 304: already stopped, 404: already gone.
            Err(BollardError::DockerResponseServerError { status_code, .. })
                if status_code == 304 || status_code == 404 => {}
            Err(e) => return Err(classify(e, "container stop")),
        }
        self.remove(&handle.id).await;
        info!(container_id = %handle.id, "container stopped");
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState> {
        match self
            .docker
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let running = info.state.and_then(|s| s.running).unwrap_or(false);
                Ok(if running {
                    ContainerState::Running
                } else {
                    ContainerState::Exited
                })
            }
            Err(e) if is_not_found(&e) => Ok(ContainerState::Missing),
            Err(e) => Err(classify(e, "container inspect")),
        }
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        command: &str,
        opts: &ExecOptions,
    ) -> Result<ExecOutput> {
        let cmd = if opts.tty {
            vec!["/bin/bash".to_string(), "-lc".to_string(), command.to_string()]
        } else {
            vec!["sh".to_string(), "-c".to_string(), command.to_string()]
        };
        let workdir = opts
            .workdir
            .clone()
            .unwrap_or_else(|| self.config.container_workdir.clone());
        let exec_options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(opts.tty),
            working_dir: Some(workdir),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&handle.id, exec_options)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    RuntimeError::ContainerMissing(handle.id.clone())
                } else {
                    RuntimeError::Exec(e.to_string())
                }
            })?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::Exec(e.to_string()))?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = started {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => {
                        output.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdIn { .. }) => {}
                    Err(e) => {
                        warn!(container_id = %handle.id, error = %e, "exec stream error");
                        break;
                    }
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| RuntimeError::Exec(e.to_string()))?;
        let exit_code = inspect.exit_code.unwrap_or(-1);
        debug!(container_id = %handle.id, exit_code, "exec finished");

        Ok(ExecOutput { exit_code, output })
    }

    fn shell_command(&self, handle: &ContainerHandle, _workspace: &Path) -> CommandSpec {
        CommandSpec::new(self.config.docker_cli.clone())
            .arg("exec")
            .arg("-it")
            .arg("-e")
            .arg("TERM=xterm-256color")
            .arg("-w")
            .arg(self.config.container_workdir.clone())
            .arg(handle.id.clone())
            .arg(self.config.shell.clone())
    }
}

/// Run `create`; if the image is missing, `pull` it once and retry `create`
/// exactly once. A second miss is reported as a provisioning failure.
async fn create_pulling_once<C, CF, P, PF>(image: &str, mut create: C, pull: P) -> Result<String>
where
    C: FnMut() -> CF,
    CF: Future<Output = std::result::Result<String, BollardError>>,
    P: FnOnce() -> PF,
    PF: Future<Output = Result<()>>,
{
    match create().await {
        Ok(id) => Ok(id),
        Err(e) if is_not_found(&e) => {
            warn!(image, "image not found locally");
            pull().await?;
            create().await.map_err(|e| classify(e, "container create"))
        }
        Err(e) => Err(classify(e, "container create")),
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404
    )
}

/// Engine-side rejections are provisioning failures; anything that never got
/// an answer from the engine means the engine is unavailable.
fn classify(err: BollardError, what: &str) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Provisioning(format!("{what}: {message} (status {status_code})")),
        other => RuntimeError::Unavailable(format!("{what}: {other}")),
    }
}
