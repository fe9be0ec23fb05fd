// File: testnet/src/engine/docker.rs
//
// Docker CLI Engine
//
// Drives `docker` and `docker compose` as subprocesses. Every non-zero exit
// goes through `classify_engine_error`; an unreachable daemon always surfaces
// as `EngineUnavailable`.

use async_trait::async_trait;
use log::{debug, info};
use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use tokio::time::Duration;

use super::classify::{classify_engine_error, EngineErrorKind};
use super::process::{CommandOutput, CommandSpec, ScopedProcess};
use super::{BuildOptions, ComposeProject, ContainerEngine, ImageRef};
use crate::config::RegistryAuth;
use crate::error::{TestnetError, TestnetResult};

const UNAVAILABLE_HINT: &str =
    "start the Docker daemon (Docker Desktop or `systemctl start docker`) and check that \
     the current user may access its socket";

/// [`ContainerEngine`] backed by the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    command_timeout: Duration,
    grace_period: Duration,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, command_timeout: Duration, grace_period: Duration) -> Self {
        Self {
            binary: binary.into(),
            command_timeout,
            grace_period,
        }
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.binary)
    }

    fn compose(&self, project: &ComposeProject) -> CommandSpec {
        self.command()
            .arg("compose")
            .arg("--project-name")
            .arg(&project.name)
            .arg("--project-directory")
            .arg(project.directory.display().to_string())
            .arg("--file")
            .arg(project.compose_file.display().to_string())
            .arg("--env-file")
            .arg(project.env_file.display().to_string())
    }

    fn compose_down_spec(&self, project: &ComposeProject) -> CommandSpec {
        self.compose(project).args(["down", "--remove-orphans", "-v"])
    }

    fn build_spec(&self, image: &ImageRef, options: &BuildOptions) -> CommandSpec {
        let mut spec = self
            .command()
            .env("DOCKER_BUILDKIT", "1")
            .arg("build")
            .arg("--tag")
            .arg(image.to_string());
        if options.no_cache {
            spec = spec.arg("--no-cache");
        }
        if let Some(profile) = &options.profile {
            spec = spec.arg("--build-arg").arg(format!("PROFILE={profile}"));
        }
        if let Some(features) = &options.features {
            spec = spec.arg("--build-arg").arg(format!("FEATURES={features}"));
        }
        if let Some(dockerfile) = &options.dockerfile {
            spec = spec.arg("--file").arg(dockerfile.display().to_string());
        }
        spec.arg(options.context.display().to_string())
    }

    /// Runs `spec`, turning failures into typed errors.
    async fn exec(&self, spec: CommandSpec) -> TestnetResult<CommandOutput> {
        let output = spec.run(self.command_timeout).await.map_err(|e| match e {
            TestnetError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                TestnetError::EngineUnavailable(format!(
                    "`{}` is not installed or not on PATH",
                    self.binary
                ))
            }
            other => other,
        })?;
        check(&spec, output)
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(
            crate::config::defaults::ENGINE,
            Duration::from_secs(crate::config::defaults::ENGINE_COMMAND_TIMEOUT_SECS),
            Duration::from_secs(crate::config::defaults::GRACE_PERIOD_SECS),
        )
    }
}

fn check(spec: &CommandSpec, output: CommandOutput) -> TestnetResult<CommandOutput> {
    if output.success() {
        return Ok(output);
    }
    let detail = output.diagnostic();
    match classify_engine_error(&detail) {
        EngineErrorKind::DaemonUnreachable => Err(TestnetError::EngineUnavailable(format!(
            "{detail}\n{UNAVAILABLE_HINT}"
        ))),
        kind => Err(TestnetError::EngineCommand {
            command: spec.to_string(),
            kind,
            detail,
        }),
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn ping(&self) -> TestnetResult<()> {
        let output = self
            .exec(self.command().args(["info", "--format", "{{.ServerVersion}}"]))
            .await
            .map_err(|e| match e {
                TestnetError::EngineCommand { detail, .. } => {
                    TestnetError::EngineUnavailable(format!("{detail}\n{UNAVAILABLE_HINT}"))
                }
                other => other,
            })?;
        debug!("Container engine version {}", output.stdout.trim());
        Ok(())
    }

    async fn image_present(&self, image: &ImageRef) -> TestnetResult<bool> {
        let spec = self
            .command()
            .args(["image", "inspect", "--format", "{{.Id}}"])
            .arg(image.to_string());
        match self.exec(spec).await {
            Ok(_) => Ok(true),
            Err(TestnetError::EngineCommand {
                kind: EngineErrorKind::ImageNotFound,
                ..
            }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn pull(&self, image: &ImageRef) -> TestnetResult<()> {
        info!("Pulling {}", image);
        self.exec(self.command().arg("pull").arg(image.to_string()))
            .await
            .map(|_| ())
    }

    async fn login(&self, auth: &RegistryAuth, password: &str) -> TestnetResult<()> {
        let mut spec = self.command().arg("login");
        if let Some(server) = &auth.server {
            spec = spec.arg(server);
        }
        let spec = spec
            .arg("--username")
            .arg(&auth.username)
            .arg("--password-stdin")
            .stdin(password);
        info!(
            "Logging in to {} as {}",
            auth.server.as_deref().unwrap_or("Docker Hub"),
            auth.username
        );
        self.exec(spec).await.map(|_| ())
    }

    async fn compose_up(&self, project: &ComposeProject) -> TestnetResult<()> {
        self.exec(self.compose(project).args(["up", "-d"]))
            .await
            .map(|_| ())
    }

    async fn compose_down(&self, project: &ComposeProject) -> TestnetResult<()> {
        self.exec(self.compose_down_spec(project)).await.map(|_| ())
    }

    fn compose_down_blocking(&self, project: &ComposeProject) -> TestnetResult<()> {
        let spec = self.compose_down_spec(project);
        let output = spec.run_blocking()?;
        check(&spec, output).map(|_| ())
    }

    async fn build_image(&self, image: &ImageRef, options: &BuildOptions) -> TestnetResult<()> {
        info!("Building {} from {}", image, options.context.display());
        self.exec(self.build_spec(image, options)).await.map(|_| ())
    }

    async fn follow_logs(
        &self,
        project: &ComposeProject,
        output: &Path,
    ) -> TestnetResult<Option<ScopedProcess>> {
        let stdout = File::create(output).map_err(|e| TestnetError::io(output, e))?;
        let stderr = stdout.try_clone().map_err(|e| TestnetError::io(output, e))?;
        let spec = self.compose(project).args(["logs", "--follow", "--no-color"]);
        let process = ScopedProcess::spawn(
            &spec,
            Stdio::from(stdout),
            Stdio::from(stderr),
            self.grace_period,
        )?;
        info!("Streaming container logs to {}", output.display());
        Ok(Some(process))
    }
}
