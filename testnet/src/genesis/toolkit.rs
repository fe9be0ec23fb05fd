// File: testnet/src/genesis/toolkit.rs
//
// Node CLI Genesis Toolkit
//
// Key generation, validator registration and the genesis computation itself
// are delegated to the node's own CLI so the artifacts are exactly what the
// node expects. The CLI runs either from the host PATH or inside a throwaway
// container of the validator image with the work directory mounted.

use async_trait::async_trait;
use log::debug;
use nix::unistd::{getgid, getuid};
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use tokio::time::Duration;

use crate::config::{NodeCliMode, TestnetConfig};
use crate::engine::{classify_engine_error, CommandSpec};
use crate::error::{TestnetError, TestnetResult};

/// Mount point of the work directory inside the CLI container.
const CONTAINER_WORK_DIR: &str = "/work";

/// One validator's entry in the genesis repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorRegistration {
    /// Username listed in the layout, `validator-<i>`.
    pub username: String,
    /// Directory holding the validator's `public-keys.yaml`.
    pub keys_dir: PathBuf,
    /// Address peers dial.
    pub validator_host: SocketAddrV4,
    pub stake_amount: u64,
}

/// The three node CLI operations genesis needs.
#[async_trait]
pub trait GenesisToolkit: Send + Sync {
    /// Writes `private-keys.yaml`, `public-keys.yaml` and
    /// `validator-identity.yaml` into `output_dir`.
    async fn generate_keys(&self, output_dir: &Path) -> TestnetResult<()>;

    /// Records a validator's owner/operator configuration in `repository`.
    async fn set_validator_configuration(
        &self,
        repository: &Path,
        registration: &ValidatorRegistration,
    ) -> TestnetResult<()>;

    /// Folds the repository into `genesis.blob` and `waypoint.txt` in
    /// `output_dir`.
    async fn generate_genesis(&self, repository: &Path, output_dir: &Path) -> TestnetResult<()>;
}

/// [`GenesisToolkit`] backed by the node CLI binary.
#[derive(Debug, Clone)]
pub struct NodeCliToolkit {
    mode: NodeCliMode,
    cli: String,
    engine: String,
    image: String,
    work_dir: PathBuf,
    timeout: Duration,
}

impl NodeCliToolkit {
    pub fn new(config: &TestnetConfig) -> Self {
        Self {
            mode: config.node_cli_mode,
            cli: config.node_cli.clone(),
            engine: config.engine.clone(),
            image: config.image(),
            work_dir: config.work_dir.clone(),
            timeout: config.engine_command_timeout(),
        }
    }

    /// Path as the CLI sees it.
    fn path_arg(&self, path: &Path) -> TestnetResult<String> {
        match self.mode {
            NodeCliMode::Host => Ok(path.display().to_string()),
            NodeCliMode::Container => {
                let relative = path.strip_prefix(&self.work_dir).map_err(|_| {
                    TestnetError::config(
                        "work_dir",
                        format!(
                            "{} is outside the work directory mounted into the CLI container",
                            path.display()
                        ),
                    )
                })?;
                if relative.as_os_str().is_empty() {
                    return Ok(CONTAINER_WORK_DIR.to_string());
                }
                Ok(Path::new(CONTAINER_WORK_DIR)
                    .join(relative)
                    .display()
                    .to_string())
            }
        }
    }

    fn genesis_command(&self) -> CommandSpec {
        let command = match self.mode {
            NodeCliMode::Host => CommandSpec::new(&self.cli),
            NodeCliMode::Container => CommandSpec::new(&self.engine)
                .args(["run", "--rm", "--volume"])
                .arg(format!("{}:{CONTAINER_WORK_DIR}", self.work_dir.display()))
                .arg("--workdir")
                .arg(CONTAINER_WORK_DIR)
                .arg("--user")
                .arg(format!("{}:{}", getuid(), getgid()))
                .arg("--entrypoint")
                .arg(&self.cli)
                .arg(&self.image),
        };
        command.arg("genesis")
    }

    async fn run(&self, spec: CommandSpec) -> TestnetResult<()> {
        let output = spec.run(self.timeout).await?;
        if output.success() {
            if log::log_enabled!(log::Level::Debug) {
                debug!("`{}` succeeded: {}", spec, output.stdout.trim());
            }
            Ok(())
        } else {
            let detail = output.diagnostic();
            Err(TestnetError::EngineCommand {
                command: spec.to_string(),
                kind: classify_engine_error(&detail),
                detail,
            })
        }
    }

    fn generate_keys_spec(&self, output_dir: &Path) -> TestnetResult<CommandSpec> {
        Ok(self
            .genesis_command()
            .args(["generate-keys", "--assume-yes", "--output-dir"])
            .arg(self.path_arg(output_dir)?))
    }

    fn set_validator_configuration_spec(
        &self,
        repository: &Path,
        registration: &ValidatorRegistration,
    ) -> TestnetResult<CommandSpec> {
        Ok(self
            .genesis_command()
            .arg("set-validator-configuration")
            .arg("--local-repository-dir")
            .arg(self.path_arg(repository)?)
            .arg("--username")
            .arg(&registration.username)
            .arg("--owner-public-identity-file")
            .arg(self.path_arg(&registration.keys_dir.join("public-keys.yaml"))?)
            .arg("--validator-host")
            .arg(registration.validator_host.to_string())
            .arg("--stake-amount")
            .arg(registration.stake_amount.to_string()))
    }

    fn generate_genesis_spec(&self, repository: &Path, output_dir: &Path) -> TestnetResult<CommandSpec> {
        Ok(self
            .genesis_command()
            .args(["generate-genesis", "--assume-yes"])
            .arg("--local-repository-dir")
            .arg(self.path_arg(repository)?)
            .arg("--output-dir")
            .arg(self.path_arg(output_dir)?))
    }
}

#[async_trait]
impl GenesisToolkit for NodeCliToolkit {
    async fn generate_keys(&self, output_dir: &Path) -> TestnetResult<()> {
        self.run(self.generate_keys_spec(output_dir)?).await
    }

    async fn set_validator_configuration(
        &self,
        repository: &Path,
        registration: &ValidatorRegistration,
    ) -> TestnetResult<()> {
        self.run(self.set_validator_configuration_spec(repository, registration)?)
            .await
    }

    async fn generate_genesis(&self, repository: &Path, output_dir: &Path) -> TestnetResult<()> {
        self.run(self.generate_genesis_spec(repository, output_dir)?)
            .await
    }
}
