//! Compose manifest and `.env` rendering.
//!
//! Rendering is pure; [`ComposeManifest::materialize`] only writes files, so
//! running it twice yields byte-identical output.

use log::info;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::config::TestnetConfig;
use crate::error::{TestnetError, TestnetResult};
use crate::genesis::node_config::{CONFIG_MOUNT, DATA_DIR, NODE_CONFIG_FILE};
use crate::topology::{NodeSlot, Topology};
use crate::workspace::{WorkDir, VALIDATORS_DIR};

pub const IMAGE_ENV: &str = "VALIDATOR_IMAGE";
pub const TAG_ENV: &str = "VALIDATOR_TAG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    pub image: String,
    pub container_name: String,
    pub command: Vec<String>,
    pub volumes: Vec<String>,
    pub ports: Vec<String>,
    pub networks: BTreeMap<String, NetworkAttachment>,
    pub restart: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkAttachment {
    pub ipv4_address: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Network {
    pub driver: String,
    pub ipam: Ipam,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ipam {
    pub config: Vec<IpamPool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpamPool {
    pub subnet: String,
    pub gateway: Ipv4Addr,
}

/// Named volume with engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Volume {}

/// The compose file: one service per validator on a private bridge network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComposeManifest {
    pub name: String,
    pub services: BTreeMap<String, Service>,
    pub networks: BTreeMap<String, Network>,
    pub volumes: BTreeMap<String, Volume>,
    #[serde(skip)]
    env: Vec<(String, String)>,
}

impl ComposeManifest {
    pub fn render(config: &TestnetConfig, topology: &Topology) -> Self {
        let network = config.project_name.clone();
        let image = format!("${{{IMAGE_ENV}}}:${{{TAG_ENV}}}");

        let mut services = BTreeMap::new();
        let mut volumes = BTreeMap::new();
        for slot in topology.slots() {
            let volume = format!("{}-data", slot.container_name);
            services.insert(
                slot.container_name.clone(),
                render_service(config, slot, &image, &network, &volume),
            );
            volumes.insert(volume, Volume::default());
        }

        let scheme = topology.scheme();
        let networks = BTreeMap::from([(
            network,
            Network {
                driver: "bridge".to_string(),
                ipam: Ipam {
                    config: vec![IpamPool {
                        subnet: scheme.subnet_cidr(),
                        gateway: scheme.gateway(),
                    }],
                },
            },
        )]);

        let tag = if config.use_local_image {
            &config.local_image_tag
        } else {
            &config.image_tag
        };
        let env = vec![
            ("COMPOSE_PROJECT_NAME".to_string(), config.project_name.clone()),
            (IMAGE_ENV.to_string(), config.image_repository.clone()),
            (TAG_ENV.to_string(), tag.clone()),
        ];

        Self {
            name: config.project_name.clone(),
            services,
            networks,
            volumes,
            env,
        }
    }

    pub fn to_yaml(&self) -> TestnetResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Contents of the `.env` file.
    pub fn env_file(&self) -> String {
        self.env
            .iter()
            .map(|(key, value)| format!("{key}={value}\n"))
            .collect()
    }

    /// Writes `docker-compose.yaml` and `.env`, overwriting previous files.
    pub fn materialize(&self, work_dir: &WorkDir) -> TestnetResult<()> {
        std::fs::create_dir_all(work_dir.root()).map_err(|e| TestnetError::io(work_dir.root(), e))?;

        let compose = work_dir.compose_file();
        std::fs::write(&compose, self.to_yaml()?).map_err(|e| TestnetError::io(&compose, e))?;

        let env = work_dir.env_file();
        std::fs::write(&env, self.env_file()).map_err(|e| TestnetError::io(&env, e))?;

        info!(
            "Compose manifest for {} service(s) written to {}",
            self.services.len(),
            compose.display()
        );
        Ok(())
    }
}

fn render_service(
    config: &TestnetConfig,
    slot: &NodeSlot,
    image: &str,
    network: &str,
    volume: &str,
) -> Service {
    Service {
        image: image.to_string(),
        container_name: format!("{}-{}", config.project_name, slot.container_name),
        command: vec![
            config.node_command.clone(),
            "-f".to_string(),
            format!("{CONFIG_MOUNT}/{NODE_CONFIG_FILE}"),
        ],
        volumes: vec![
            format!("./{VALIDATORS_DIR}/{}:{CONFIG_MOUNT}:ro", slot.container_name),
            format!("{volume}:{DATA_DIR}"),
        ],
        ports: slot.ports().iter().map(|port| format!("{port}:{port}")).collect(),
        networks: BTreeMap::from([(
            network.to_string(),
            NetworkAttachment { ipv4_address: slot.ip },
        )]),
        restart: "no".to_string(),
    }
}
