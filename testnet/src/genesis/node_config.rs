//! Per-validator node configuration (`validator.yaml`).
//!
//! Network-binding fields have no defaults: a [`NodeConfig`] can only be built
//! from a [`NodeSlot`] and an explicit [`ListenAddress`], and the rendered file
//! is read back and checked against the slot before the containers start.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::str::FromStr;

use crate::error::{TestnetError, TestnetResult};
use crate::topology::NodeSlot;
use crate::workspace::{GENESIS_BLOB_FILE, WAYPOINT_FILE};

/// Where each validator's directory is mounted inside its container.
pub const CONFIG_MOUNT: &str = "/opt/aptos/etc";
/// Writable data directory inside the container.
pub const DATA_DIR: &str = "/opt/aptos/data";
pub const NODE_CONFIG_FILE: &str = "validator.yaml";
pub const IDENTITY_FILE: &str = "validator-identity.yaml";

/// A TCP listen address in multiaddr form, `/ip4/<ip>/tcp/<port>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenAddress(SocketAddrV4);

impl ListenAddress {
    /// Bind-all (`0.0.0.0`) on `port`.
    pub fn bind_all(port: u16) -> TestnetResult<Self> {
        if port == 0 {
            return Err(TestnetError::config(
                "validator_network.listen_address",
                "port must be explicit, not 0",
            ));
        }
        Ok(Self(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)))
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/ip4/{}/tcp/{}", self.0.ip(), self.0.port())
    }
}

impl FromStr for ListenAddress {
    type Err = TestnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            TestnetError::config(
                "validator_network.listen_address",
                format!("'{s}' is not of the form /ip4/<ip>/tcp/<port>"),
            )
        };
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            ["", "ip4", ip, "tcp", port] => {
                let ip: Ipv4Addr = ip.parse().map_err(|_| invalid())?;
                let port: u16 = port.parse().map_err(|_| invalid())?;
                Ok(Self(SocketAddrV4::new(ip, port)))
            }
            _ => Err(invalid()),
        }
    }
}

impl Serialize for ListenAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ListenAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FromFile {
    pub from_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseConfig {
    pub role: String,
    pub data_dir: String,
    pub waypoint: FromFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub safety_rules: SafetyRulesConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyRulesConfig {
    pub service: ServiceConfig,
    pub backend: BackendConfig,
    pub initial_safety_rules_config: InitialSafetyRulesConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialSafetyRulesConfig {
    pub from_file: InitialSafetyRulesFromFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialSafetyRulesFromFile {
    pub waypoint: FromFile,
    pub identity_blob_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub genesis_file_location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub discovery_method: String,
    pub mutual_authentication: bool,
    pub listen_address: ListenAddress,
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub address: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectionServiceConfig {
    pub address: Ipv4Addr,
    pub port: u16,
}

/// Node configuration for one validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub base: BaseConfig,
    pub consensus: ConsensusConfig,
    pub execution: ExecutionConfig,
    pub validator_network: NetworkConfig,
    pub api: ApiConfig,
    pub inspection_service: InspectionServiceConfig,
}

fn mounted(file: &str) -> String {
    format!("{CONFIG_MOUNT}/{file}")
}

impl NodeConfig {
    /// Renders the configuration for `slot`, peering on `listen_address`.
    pub fn render(slot: &NodeSlot, listen_address: ListenAddress) -> Self {
        let waypoint = FromFile {
            from_file: mounted(WAYPOINT_FILE),
        };
        Self {
            base: BaseConfig {
                role: "validator".to_string(),
                data_dir: DATA_DIR.to_string(),
                waypoint: waypoint.clone(),
            },
            consensus: ConsensusConfig {
                safety_rules: SafetyRulesConfig {
                    service: ServiceConfig {
                        kind: "local".to_string(),
                    },
                    backend: BackendConfig {
                        kind: "on_disk_storage".to_string(),
                        path: "secure-data.json".to_string(),
                        namespace: None,
                    },
                    initial_safety_rules_config: InitialSafetyRulesConfig {
                        from_file: InitialSafetyRulesFromFile {
                            waypoint,
                            identity_blob_path: mounted(IDENTITY_FILE),
                        },
                    },
                },
            },
            execution: ExecutionConfig {
                genesis_file_location: mounted(GENESIS_BLOB_FILE),
            },
            validator_network: NetworkConfig {
                discovery_method: "onchain".to_string(),
                mutual_authentication: true,
                listen_address,
                identity: IdentityConfig {
                    kind: "from_file".to_string(),
                    path: mounted(IDENTITY_FILE),
                },
            },
            api: ApiConfig {
                enabled: true,
                address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, slot.api_port)),
            },
            inspection_service: InspectionServiceConfig {
                address: Ipv4Addr::UNSPECIFIED,
                port: slot.metrics_port,
            },
        }
    }

    /// Checks every network-binding field against `slot`.
    pub fn check(&self, slot: &NodeSlot) -> TestnetResult<()> {
        let listen = &self.validator_network.listen_address;
        if listen.ip() != Ipv4Addr::UNSPECIFIED || listen.port() != slot.p2p_port {
            return Err(TestnetError::config(
                "validator_network.listen_address",
                format!(
                    "validator-{} listens on {listen}, expected /ip4/0.0.0.0/tcp/{}",
                    slot.index, slot.p2p_port
                ),
            ));
        }
        let api = SocketAddr::from((Ipv4Addr::UNSPECIFIED, slot.api_port));
        if self.api.address != api {
            return Err(TestnetError::config(
                "api.address",
                format!("validator-{} binds {}, expected {api}", slot.index, self.api.address),
            ));
        }
        if self.inspection_service.port != slot.metrics_port {
            return Err(TestnetError::config(
                "inspection_service.port",
                format!(
                    "validator-{} uses {}, expected {}",
                    slot.index, self.inspection_service.port, slot.metrics_port
                ),
            ));
        }
        Ok(())
    }

    pub fn read(path: &Path) -> TestnetResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| TestnetError::io(path, e))?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Writes to `path`, then reads the file back and checks it.
    pub fn write_checked(&self, path: &Path, slot: &NodeSlot) -> TestnetResult<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml).map_err(|e| TestnetError::io(path, e))?;

        let written = Self::read(path)?;
        if &written != self {
            return Err(TestnetError::config(
                "validator_network.listen_address",
                format!("{} did not survive a write/read cycle", path.display()),
            ));
        }
        written.check(slot)
    }
}
