//! Error types for the testnet controller.

use std::fmt;
use std::io::Error as IoError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::engine::EngineErrorKind;
use crate::readiness::NodeStatus;

/// Genesis generation step, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenesisStep {
    /// Chain id, root account and validator list.
    Layout,
    /// One key triple per validator.
    KeyGeneration,
    /// Validator network address registration.
    ValidatorRegistration,
    /// The single genesis computation (blob + waypoint).
    GenesisComputation,
    /// Per-validator node configuration and artifact fan-out.
    NodeConfigRendering,
}

impl fmt::Display for GenesisStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GenesisStep::Layout => "layout",
            GenesisStep::KeyGeneration => "key-generation",
            GenesisStep::ValidatorRegistration => "validator-registration",
            GenesisStep::GenesisComputation => "genesis-computation",
            GenesisStep::NodeConfigRendering => "node-config-rendering",
        };
        f.write_str(name)
    }
}

/// What the operator has to do to make a missing image available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRemedy {
    /// The registry refused the pull: credentials are missing or wrong.
    Authenticate,
    /// No registry has the image: it has to be built locally.
    BuildLocally,
}

impl fmt::Display for ImageRemedy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRemedy::Authenticate => f.write_str(
                "the registry requires authentication; configure `registry_auth` \
                 (username + password environment variable) or run `docker login`",
            ),
            ImageRemedy::BuildLocally => f.write_str(
                "the image is not published; build it with `posnet build` \
                 (Testnet::build_local_image) and start with `use_local_image`",
            ),
        }
    }
}

/// Error type for every testnet controller operation.
#[derive(Error, Debug)]
pub enum TestnetError {
    /// Invalid configuration, rejected before any side effect.
    #[error("Configuration error in `{field}`: {reason}")]
    Configuration { field: String, reason: String },

    /// The container engine cannot be reached.
    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The validator image is neither present nor pullable.
    #[error("Image {image} unavailable: {remedy}\nengine output: {detail}")]
    ImageUnavailable {
        image: String,
        remedy: ImageRemedy,
        detail: String,
    },

    /// A container engine invocation exited unsuccessfully.
    #[error("`{command}` failed ({kind}): {detail}")]
    EngineCommand {
        command: String,
        kind: EngineErrorKind,
        detail: String,
    },

    /// Genesis generation aborted; nothing generated so far is usable.
    #[error("Genesis generation failed at step '{step}': {detail}")]
    GenesisGeneration { step: GenesisStep, detail: String },

    /// Not every validator became healthy before the deadline.
    #[error("Validators not healthy after {elapsed:?}: {}", format_statuses(.statuses))]
    HealthCheckTimeout {
        elapsed: Duration,
        statuses: Vec<(usize, NodeStatus)>,
    },

    /// A runtime or bootstrap transfer failed after all retries.
    #[error("Funding {recipient} with {amount} failed after {attempts} attempt(s): {source}")]
    FundingFailed {
        recipient: String,
        amount: u64,
        attempts: u32,
        #[source]
        source: Box<TestnetError>,
    },

    /// A deadline-bounded wait expired.
    #[error("Timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// The node REST API answered with an error or an unexpected payload.
    #[error("Node API error at {endpoint}: {detail}")]
    Api { endpoint: String, detail: String },

    /// A committed transaction was rejected by the chain.
    #[error("Transaction {hash} failed on chain: {vm_status}")]
    TransactionFailed { hash: String, vm_status: String },

    /// The operation is not allowed in the current lifecycle state.
    #[error("Cannot {operation} while testnet is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Validator index outside the topology.
    #[error("Validator index {index} out of range (only {count} validators)")]
    ValidatorIndexOutOfRange { index: usize, count: usize },

    /// Filesystem error on a persisted artifact.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: IoError,
    },

    /// Malformed key material or address.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// YAML or JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TestnetError {
    /// Shorthand for a [`TestnetError::Configuration`] error.
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        TestnetError::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`TestnetError::Io`] error.
    pub fn io(path: impl Into<PathBuf>, source: IoError) -> Self {
        TestnetError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a failed funding step can clear up on another attempt.
    ///
    /// Transport failures and on-chain rejections such as an exhausted sender
    /// balance warrant a fresh submission. A finality timeout is retried by
    /// checking the same transaction again, never by resubmitting it. Bad keys
    /// and bad configuration do not clear up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TestnetError::Api { .. }
                | TestnetError::Timeout { .. }
                | TestnetError::TransactionFailed { .. }
        )
    }
}

impl From<serde_yaml::Error> for TestnetError {
    fn from(err: serde_yaml::Error) -> Self {
        TestnetError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for TestnetError {
    fn from(err: serde_json::Error) -> Self {
        TestnetError::Serialization(err.to_string())
    }
}

fn format_statuses(statuses: &[(usize, NodeStatus)]) -> String {
    statuses
        .iter()
        .map(|(index, status)| format!("validator-{index}: {status}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for testnet operations.
pub type TestnetResult<T> = Result<T, TestnetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_timeout_names_every_node() {
        let err = TestnetError::HealthCheckTimeout {
            elapsed: Duration::from_secs(120),
            statuses: vec![
                (0, NodeStatus::Healthy { block_height: 3 }),
                (1, NodeStatus::Unreachable("connection refused".to_string())),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("validator-0: healthy"));
        assert!(message.contains("validator-1: unreachable (connection refused)"));
    }

    #[test]
    fn test_image_remedy_text_is_actionable() {
        let auth = TestnetError::ImageUnavailable {
            image: "repo/validator:devnet".to_string(),
            remedy: ImageRemedy::Authenticate,
            detail: "unauthorized".to_string(),
        };
        assert!(auth.to_string().contains("docker login"));

        let build = TestnetError::ImageUnavailable {
            image: "repo/validator:local".to_string(),
            remedy: ImageRemedy::BuildLocally,
            detail: "manifest unknown".to_string(),
        };
        assert!(build.to_string().contains("posnet build"));
    }

    #[test]
    fn test_retryable_classification() {
        let api = TestnetError::Api {
            endpoint: "http://127.0.0.1:8080/v1".to_string(),
            detail: "connection reset".to_string(),
        };
        assert!(api.is_retryable());

        let rejected = TestnetError::TransactionFailed {
            hash: "0xabc".to_string(),
            vm_status: "EINSUFFICIENT_BALANCE".to_string(),
        };
        assert!(rejected.is_retryable());

        let bad_key = TestnetError::InvalidKey("odd length".to_string());
        assert!(!bad_key.is_retryable());
    }
}
