use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{TestnetError, TestnetResult};
use crate::orchestrator::PollSchedule;
use crate::topology::PortScheme;

/// Default values for configuration
pub mod defaults {
    use super::*;

    pub const VALIDATORS: usize = 4;
    pub const MIN_VALIDATORS: usize = 1;
    pub const MAX_VALIDATORS: usize = 7;

    pub const IMAGE_REPOSITORY: &str = "aptoslabs/validator";
    pub const IMAGE_TAG: &str = "devnet";
    pub const LOCAL_IMAGE_TAG: &str = "local";
    pub const WORK_DIR_NAME: &str = "posnet";
    pub const PROJECT_NAME: &str = "posnet";
    pub const CHAIN_ID: u8 = 4;
    pub const ENGINE: &str = "docker";
    pub const NODE_CLI: &str = "aptos";
    pub const NODE_COMMAND: &str = "aptos-node";

    // Port scheme
    pub const API_PORT_BASE: u16 = 8080;
    pub const P2P_PORT_BASE: u16 = 6180;
    pub const METRICS_PORT_BASE: u16 = 9101;
    pub const SUBNET: Ipv4Addr = Ipv4Addr::new(172, 19, 0, 0);
    pub const FIRST_HOST_OCTET: u8 = 10;

    // Readiness
    pub const READINESS_INTERVAL_MS: u64 = 2000;
    pub const READINESS_DEADLINE_SECS: u64 = 120;
    pub const PROBE_TIMEOUT_MS: u64 = 3000;

    // Funding
    pub const FINALITY_TIMEOUT_SECS: u64 = 30;
    pub const FINALITY_INTERVAL_MS: u64 = 500;
    pub const FUNDING_RETRIES: u32 = 3;
    pub const FUNDING_RETRY_DELAY_MS: u64 = 1000;
    pub const STAKE_AMOUNT: u64 = 100_000_000_000_000;
    pub const EPOCH_DURATION_SECS: u64 = 7200;

    // Processes
    pub const GRACE_PERIOD_SECS: u64 = 5;
    pub const ENGINE_COMMAND_TIMEOUT_SECS: u64 = 300;

    // Validation limits
    pub const MAX_FUNDING_RETRIES: u32 = 10;
    pub const MAX_DEADLINE_SECS: u64 = 3600;
}

/// Where the node CLI used for genesis runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCliMode {
    /// A binary on the host `PATH` (`node_cli`).
    Host,
    /// Inside a throwaway container of the validator image.
    #[default]
    Container,
}

/// Which validator signs runtime faucet transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FaucetPolicy {
    /// Always the same validator.
    Fixed { validator: usize },
    /// Rotate through all validators.
    RoundRobin,
}

impl Default for FaucetPolicy {
    fn default() -> Self {
        FaucetPolicy::Fixed { validator: 0 }
    }
}

/// What to do when a live testnet already owns the port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveInstancePolicy {
    /// Refuse to start with a configuration error.
    #[default]
    FailFast,
    /// Stop the other instance's containers and take over.
    Reclaim,
}

/// Registry credentials. The password is read from an environment variable
/// at login time and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    /// Registry host, e.g. `ghcr.io`. Docker Hub when absent.
    #[serde(default)]
    pub server: Option<String>,
    pub username: String,
    /// Name of the environment variable holding the password or token.
    pub password_env: String,
}

impl RegistryAuth {
    /// Reads the password from the configured environment variable.
    pub fn password(&self) -> TestnetResult<String> {
        std::env::var(&self.password_env).map_err(|_| {
            TestnetError::config(
                "registry_auth.password_env",
                format!("environment variable `{}` is not set", self.password_env),
            )
        })
    }
}

/// Testnet configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestnetConfig {
    /// Number of validators (1..=7)
    #[serde(default = "default_validators")]
    pub validators: usize,

    /// Validator image
    #[serde(default = "default_image_repository")]
    pub image_repository: String,

    #[serde(default = "default_image_tag")]
    pub image_tag: String,

    /// Use the locally built image (`local_image_tag`) and never pull
    #[serde(default)]
    pub use_local_image: bool,

    #[serde(default = "default_local_image_tag")]
    pub local_image_tag: String,

    #[serde(default)]
    pub registry_auth: Option<RegistryAuth>,

    /// Generated files live here
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Compose project name; also the container name prefix
    #[serde(default = "default_project_name")]
    pub project_name: String,

    #[serde(default = "default_chain_id")]
    pub chain_id: u8,

    #[serde(default = "default_epoch_duration_secs")]
    pub epoch_duration_secs: u64,

    #[serde(default = "default_stake_amount")]
    pub stake_amount: u64,

    #[serde(default)]
    pub ports: PortScheme,

    /// Container engine binary
    #[serde(default = "default_engine")]
    pub engine: String,

    #[serde(default)]
    pub node_cli_mode: NodeCliMode,

    /// Node CLI binary (host mode) or command (container mode)
    #[serde(default = "default_node_cli")]
    pub node_cli: String,

    /// Node binary started inside each validator container
    #[serde(default = "default_node_command")]
    pub node_command: String,

    /// Move framework bundle copied next to the layout; the CLI's bundled
    /// framework is used when absent
    #[serde(default)]
    pub framework_bundle: Option<PathBuf>,

    /// Readiness polling
    #[serde(default = "default_readiness_interval_ms")]
    pub readiness_interval_ms: u64,

    #[serde(default = "default_readiness_deadline_secs")]
    pub readiness_deadline_secs: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Funding
    #[serde(default = "default_finality_timeout_secs")]
    pub finality_timeout_secs: u64,

    #[serde(default = "default_funding_retries")]
    pub funding_retries: u32,

    #[serde(default = "default_funding_retry_delay_ms")]
    pub funding_retry_delay_ms: u64,

    #[serde(default)]
    pub faucet_policy: FaucetPolicy,

    /// Process handling
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    #[serde(default = "default_engine_command_timeout_secs")]
    pub engine_command_timeout_secs: u64,

    /// Kill host processes squatting on the topology's ports
    #[serde(default = "default_true")]
    pub reclaim_ports: bool,

    #[serde(default)]
    pub live_instance_policy: LiveInstancePolicy,

    /// Stream container logs into the run's scratch directory
    #[serde(default)]
    pub follow_logs: bool,
}

// Default functions for serde
fn default_validators() -> usize {
    defaults::VALIDATORS
}
fn default_image_repository() -> String {
    defaults::IMAGE_REPOSITORY.to_string()
}
fn default_image_tag() -> String {
    defaults::IMAGE_TAG.to_string()
}
fn default_local_image_tag() -> String {
    defaults::LOCAL_IMAGE_TAG.to_string()
}
fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join(defaults::WORK_DIR_NAME)
}
fn default_project_name() -> String {
    defaults::PROJECT_NAME.to_string()
}
fn default_chain_id() -> u8 {
    defaults::CHAIN_ID
}
fn default_epoch_duration_secs() -> u64 {
    defaults::EPOCH_DURATION_SECS
}
fn default_stake_amount() -> u64 {
    defaults::STAKE_AMOUNT
}
fn default_engine() -> String {
    defaults::ENGINE.to_string()
}
fn default_node_cli() -> String {
    defaults::NODE_CLI.to_string()
}
fn default_node_command() -> String {
    defaults::NODE_COMMAND.to_string()
}
fn default_readiness_interval_ms() -> u64 {
    defaults::READINESS_INTERVAL_MS
}
fn default_readiness_deadline_secs() -> u64 {
    defaults::READINESS_DEADLINE_SECS
}
fn default_probe_timeout_ms() -> u64 {
    defaults::PROBE_TIMEOUT_MS
}
fn default_finality_timeout_secs() -> u64 {
    defaults::FINALITY_TIMEOUT_SECS
}
fn default_funding_retries() -> u32 {
    defaults::FUNDING_RETRIES
}
fn default_funding_retry_delay_ms() -> u64 {
    defaults::FUNDING_RETRY_DELAY_MS
}
fn default_grace_period_secs() -> u64 {
    defaults::GRACE_PERIOD_SECS
}
fn default_engine_command_timeout_secs() -> u64 {
    defaults::ENGINE_COMMAND_TIMEOUT_SECS
}
fn default_true() -> bool {
    true
}

impl Default for TestnetConfig {
    fn default() -> Self {
        Self {
            validators: default_validators(),
            image_repository: default_image_repository(),
            image_tag: default_image_tag(),
            use_local_image: false,
            local_image_tag: default_local_image_tag(),
            registry_auth: None,
            work_dir: default_work_dir(),
            project_name: default_project_name(),
            chain_id: default_chain_id(),
            epoch_duration_secs: default_epoch_duration_secs(),
            stake_amount: default_stake_amount(),
            ports: PortScheme::default(),
            engine: default_engine(),
            node_cli_mode: NodeCliMode::default(),
            node_cli: default_node_cli(),
            node_command: default_node_command(),
            framework_bundle: None,
            readiness_interval_ms: default_readiness_interval_ms(),
            readiness_deadline_secs: default_readiness_deadline_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            finality_timeout_secs: default_finality_timeout_secs(),
            funding_retries: default_funding_retries(),
            funding_retry_delay_ms: default_funding_retry_delay_ms(),
            faucet_policy: FaucetPolicy::default(),
            grace_period_secs: default_grace_period_secs(),
            engine_command_timeout_secs: default_engine_command_timeout_secs(),
            reclaim_ports: default_true(),
            live_instance_policy: LiveInstancePolicy::default(),
            follow_logs: false,
        }
    }
}

impl TestnetConfig {
    /// Default configuration for `validators` nodes.
    pub fn new(validators: usize) -> Self {
        Self {
            validators,
            ..Self::default()
        }
    }

    /// Loads a configuration file; `.yaml`/`.yml` is parsed as YAML,
    /// anything else as JSON.
    pub fn from_file<P: AsRef<Path>>(path: P) -> TestnetResult<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| TestnetError::io(path, e))?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };

        info!("Loaded testnet configuration from {}", path.display());
        Ok(config)
    }

    /// Applies `POSNET_*` environment overrides.
    pub fn apply_env_overrides(self) -> TestnetResult<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(mut self, lookup: F) -> TestnetResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("POSNET_VALIDATORS") {
            self.validators = value.parse().map_err(|_| {
                TestnetError::config("validators", format!("POSNET_VALIDATORS={value} is not a number"))
            })?;
        }
        if let Some(value) = lookup("POSNET_IMAGE") {
            self.image_repository = value;
        }
        if let Some(value) = lookup("POSNET_IMAGE_TAG") {
            self.image_tag = value;
        }
        if let Some(value) = lookup("POSNET_USE_LOCAL_IMAGE") {
            self.use_local_image = parse_flag("use_local_image", &value)?;
        }
        if let Some(value) = lookup("POSNET_WORK_DIR") {
            self.work_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("POSNET_ENGINE") {
            self.engine = value;
        }
        if let Some(value) = lookup("POSNET_NODE_CLI") {
            self.node_cli_mode = NodeCliMode::Host;
            self.node_cli = value;
        }
        if let Some(value) = lookup("POSNET_FOLLOW_LOGS") {
            self.follow_logs = parse_flag("follow_logs", &value)?;
        }

        if log::log_enabled!(log::Level::Debug) {
            debug!("Configuration after environment overrides: {:?}", self);
        }
        Ok(self)
    }

    /// Rejects configurations that cannot work, before any side effect.
    pub fn validate(&self) -> TestnetResult<()> {
        if !(defaults::MIN_VALIDATORS..=defaults::MAX_VALIDATORS).contains(&self.validators) {
            return Err(TestnetError::config(
                "validators",
                format!(
                    "{} is outside the supported range {}..={}",
                    self.validators,
                    defaults::MIN_VALIDATORS,
                    defaults::MAX_VALIDATORS
                ),
            ));
        }
        self.ports.validate(self.validators)?;

        for (field, value) in [
            ("image_repository", &self.image_repository),
            ("image_tag", &self.image_tag),
            ("local_image_tag", &self.local_image_tag),
            ("engine", &self.engine),
            ("node_cli", &self.node_cli),
            ("node_command", &self.node_command),
        ] {
            if value.trim().is_empty() {
                return Err(TestnetError::config(field, "must not be empty"));
            }
        }

        if self.project_name.is_empty()
            || !self
                .project_name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(TestnetError::config(
                "project_name",
                format!(
                    "'{}' must be non-empty lowercase alphanumerics, '-' or '_'",
                    self.project_name
                ),
            ));
        }

        if self.work_dir.as_os_str().is_empty() {
            return Err(TestnetError::config("work_dir", "must not be empty"));
        }

        if self.readiness_interval_ms == 0 {
            return Err(TestnetError::config("readiness_interval_ms", "must be positive"));
        }
        if self.probe_timeout_ms == 0 {
            return Err(TestnetError::config("probe_timeout_ms", "must be positive"));
        }
        for (field, value) in [
            ("readiness_deadline_secs", self.readiness_deadline_secs),
            ("finality_timeout_secs", self.finality_timeout_secs),
            ("engine_command_timeout_secs", self.engine_command_timeout_secs),
        ] {
            if value == 0 || value > defaults::MAX_DEADLINE_SECS {
                return Err(TestnetError::config(
                    field,
                    format!("{value} must be between 1 and {}", defaults::MAX_DEADLINE_SECS),
                ));
            }
        }

        if self.funding_retries > defaults::MAX_FUNDING_RETRIES {
            return Err(TestnetError::config(
                "funding_retries",
                format!("{} exceeds {}", self.funding_retries, defaults::MAX_FUNDING_RETRIES),
            ));
        }

        if let FaucetPolicy::Fixed { validator } = self.faucet_policy {
            if validator >= self.validators {
                return Err(TestnetError::config(
                    "faucet_policy.validator",
                    format!("validator {validator} does not exist in a {}-node network", self.validators),
                ));
            }
        }

        if self.stake_amount == 0 {
            return Err(TestnetError::config("stake_amount", "must be positive"));
        }

        if let Some(auth) = &self.registry_auth {
            if auth.username.is_empty() {
                return Err(TestnetError::config("registry_auth.username", "must not be empty"));
            }
        }

        Ok(())
    }

    /// Full image reference the validators run.
    pub fn image(&self) -> String {
        let tag = if self.use_local_image {
            &self.local_image_tag
        } else {
            &self.image_tag
        };
        format!("{}:{}", self.image_repository, tag)
    }

    pub fn readiness_schedule(&self) -> PollSchedule {
        PollSchedule::new(
            Duration::from_millis(self.readiness_interval_ms),
            Duration::from_secs(self.readiness_deadline_secs),
        )
    }

    pub fn finality_schedule(&self) -> PollSchedule {
        PollSchedule::new(
            Duration::from_millis(defaults::FINALITY_INTERVAL_MS),
            Duration::from_secs(self.finality_timeout_secs),
        )
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn funding_retry_delay(&self) -> Duration {
        Duration::from_millis(self.funding_retry_delay_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn engine_command_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_command_timeout_secs)
    }
}

fn parse_flag(field: &str, value: &str) -> TestnetResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(TestnetError::config(field, format!("'{value}' is not a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = TestnetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.image(), "aptoslabs/validator:devnet");
        assert_eq!(config.validators, 4);
    }

    #[test]
    fn test_local_image_switch() {
        let config = TestnetConfig {
            use_local_image: true,
            ..TestnetConfig::new(1)
        };
        assert_eq!(config.image(), "aptoslabs/validator:local");
    }

    #[test]
    fn test_validator_count_rejected_with_field() {
        let err = TestnetConfig::new(8).validate().unwrap_err();
        assert!(matches!(err, TestnetError::Configuration { ref field, .. } if field == "validators"));
    }

    #[test]
    fn test_fixed_faucet_validator_must_exist() {
        let config = TestnetConfig {
            faucet_policy: FaucetPolicy::Fixed { validator: 3 },
            ..TestnetConfig::new(2)
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("faucet_policy.validator"));
    }

    #[test]
    fn test_project_name_charset() {
        let config = TestnetConfig {
            project_name: "My Net".to_string(),
            ..TestnetConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("POSNET_VALIDATORS", "2"),
            ("POSNET_USE_LOCAL_IMAGE", "1"),
            ("POSNET_NODE_CLI", "/usr/local/bin/aptos"),
            ("POSNET_WORK_DIR", "/tmp/posnet-override"),
        ]
        .into_iter()
        .collect();

        let config = TestnetConfig::default()
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.validators, 2);
        assert!(config.use_local_image);
        assert_eq!(config.node_cli_mode, NodeCliMode::Host);
        assert_eq!(config.node_cli, "/usr/local/bin/aptos");
        assert_eq!(config.work_dir, PathBuf::from("/tmp/posnet-override"));
    }

    #[test]
    fn test_bad_env_flag_is_rejected() {
        let result = TestnetConfig::default().apply_overrides(|key| {
            (key == "POSNET_USE_LOCAL_IMAGE").then(|| "maybe".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_load_yaml_with_partial_fields() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "validators: 3\nfaucet_policy:\n  kind: round_robin\nports:\n  api_base: 18080\n"
        )
        .unwrap();

        let config = TestnetConfig::from_file(file.path()).unwrap();
        assert_eq!(config.validators, 3);
        assert_eq!(config.faucet_policy, FaucetPolicy::RoundRobin);
        assert_eq!(config.ports.api_base, 18080);
        assert_eq!(config.ports.p2p_base, defaults::P2P_PORT_BASE);
        assert_eq!(config.funding_retries, defaults::FUNDING_RETRIES);
    }

    #[test]
    fn test_load_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"validators": 1, "use_local_image": true}}"#).unwrap();

        let config = TestnetConfig::from_file(file.path()).unwrap();
        assert_eq!(config.validators, 1);
        assert!(config.use_local_image);
        assert!(config.reclaim_ports);
    }
}
