// File: testnet/src/genesis/mod.rs
//
// Identity & Genesis Generation
//
// Five ordered steps, each consuming the previous step's output:
//
//   1. layout       chain id, root key, validator list
//   2. keys         one key triple per validator (node CLI)
//   3. registration network address + public key per validator (node CLI)
//   4. genesis      ONE computation producing genesis.blob and waypoint.txt
//   5. node config  validator.yaml per validator, genesis copied unmodified
//
// Any failure aborts with `GenesisGeneration { step, .. }`; the generated
// directories are cleared at the start of every run so a partial genesis is
// never picked up later.

pub mod layout;
pub mod node_config;
pub mod toolkit;

pub use layout::Layout;
pub use node_config::{ListenAddress, NodeConfig};
pub use toolkit::{GenesisToolkit, NodeCliToolkit, ValidatorRegistration};

use log::{debug, info};
use sha3::{Digest, Sha3_256};
use std::net::SocketAddrV4;
use std::path::Path;

use crate::config::TestnetConfig;
use crate::error::{GenesisStep, TestnetError, TestnetResult};
use crate::identity::{AccountAddress, AccountKey, ValidatorIdentity};
use crate::topology::Topology;
use crate::workspace::{WorkDir, GENESIS_BLOB_FILE, WAYPOINT_FILE};
use layout::RootKeysFile;
use node_config::NODE_CONFIG_FILE;

/// A validator as recorded in genesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSetEntry {
    pub index: usize,
    pub account_address: AccountAddress,
    /// Must match what every peer's discovery record carries.
    pub network_public_key: String,
    pub validator_host: SocketAddrV4,
    pub stake_amount: u64,
}

/// The shared genesis, byte-identical on every validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenesisArtifact {
    pub chain_id: u8,
    pub genesis_blob: Vec<u8>,
    pub waypoint: String,
    pub validator_set: Vec<ValidatorSetEntry>,
}

impl GenesisArtifact {
    /// Hex SHA3-256 of the genesis blob.
    pub fn digest(&self) -> String {
        hex::encode(Sha3_256::digest(&self.genesis_blob))
    }

    /// Reads back a genesis generated earlier into `config.work_dir`.
    pub fn load(config: &TestnetConfig, topology: &Topology) -> TestnetResult<Self> {
        let work_dir = WorkDir::new(&config.work_dir);
        let genesis_dir = work_dir.genesis_dir();
        let genesis_blob = read_bytes(&genesis_dir.join(GENESIS_BLOB_FILE))?;
        let waypoint = String::from_utf8_lossy(&read_bytes(&genesis_dir.join(WAYPOINT_FILE))?)
            .trim()
            .to_string();

        let validator_set = topology
            .slots()
            .iter()
            .map(|slot| {
                let identity = ValidatorIdentity::load(slot.index, &work_dir.validator_dir(slot.index))?;
                Ok(ValidatorSetEntry {
                    index: slot.index,
                    account_address: identity.account_address,
                    network_public_key: identity.network_public_key,
                    validator_host: slot.p2p_address(),
                    stake_amount: config.stake_amount,
                })
            })
            .collect::<TestnetResult<Vec<_>>>()?;

        let artifact = Self {
            chain_id: config.chain_id,
            genesis_blob,
            waypoint,
            validator_set,
        };
        verify_fan_out(&work_dir, &artifact, topology.len())?;
        Ok(artifact)
    }
}

/// Runs the five genesis steps for a topology.
pub struct GenesisGenerator<'a> {
    config: &'a TestnetConfig,
    topology: &'a Topology,
    toolkit: &'a dyn GenesisToolkit,
    work_dir: WorkDir,
}

fn failed(step: GenesisStep) -> impl Fn(TestnetError) -> TestnetError {
    move |e| TestnetError::GenesisGeneration {
        step,
        detail: e.to_string(),
    }
}

impl<'a> GenesisGenerator<'a> {
    pub fn new(
        config: &'a TestnetConfig,
        topology: &'a Topology,
        toolkit: &'a dyn GenesisToolkit,
    ) -> Self {
        Self {
            config,
            topology,
            toolkit,
            work_dir: WorkDir::new(&config.work_dir),
        }
    }

    pub async fn generate(&self) -> TestnetResult<GenesisArtifact> {
        info!(
            "Generating genesis for {} validator(s) in {}",
            self.topology.len(),
            self.work_dir.root().display()
        );

        self.write_layout().map_err(failed(GenesisStep::Layout))?;

        let identities = self
            .generate_keys()
            .await
            .map_err(failed(GenesisStep::KeyGeneration))?;

        let validator_set = self
            .register_validators(&identities)
            .await
            .map_err(failed(GenesisStep::ValidatorRegistration))?;

        let (genesis_blob, waypoint) = self
            .compute_genesis()
            .await
            .map_err(failed(GenesisStep::GenesisComputation))?;

        let artifact = GenesisArtifact {
            chain_id: self.config.chain_id,
            genesis_blob,
            waypoint,
            validator_set,
        };

        self.render_node_configs(&artifact)
            .map_err(failed(GenesisStep::NodeConfigRendering))?;

        info!(
            "Genesis ready: waypoint {}, blob sha3 {}",
            artifact.waypoint,
            artifact.digest()
        );
        Ok(artifact)
    }

    fn write_layout(&self) -> TestnetResult<()> {
        self.work_dir.clear_generated()?;
        self.work_dir.create_dirs(self.topology.len())?;

        let root_key = AccountKey::generate();
        RootKeysFile::new(&root_key).write(&self.work_dir.root_keys_file())?;
        Layout::new(self.config, self.topology, &root_key).write(&self.work_dir.layout_file())?;

        if let Some(bundle) = &self.config.framework_bundle {
            let target = self.work_dir.framework_file();
            std::fs::copy(bundle, &target).map_err(|e| TestnetError::io(bundle, e))?;
        }
        debug!("Layout written to {}", self.work_dir.layout_file().display());
        Ok(())
    }

    async fn generate_keys(&self) -> TestnetResult<Vec<ValidatorIdentity>> {
        let mut identities = Vec::with_capacity(self.topology.len());
        for slot in self.topology.slots() {
            let dir = self.work_dir.validator_dir(slot.index);
            self.toolkit.generate_keys(&dir).await?;
            identities.push(ValidatorIdentity::load(slot.index, &dir)?);
            debug!("Keys generated for {}", slot.container_name);
        }
        Ok(identities)
    }

    async fn register_validators(
        &self,
        identities: &[ValidatorIdentity],
    ) -> TestnetResult<Vec<ValidatorSetEntry>> {
        let mut validator_set = Vec::with_capacity(identities.len());
        for (slot, identity) in self.topology.slots().iter().zip(identities) {
            let registration = ValidatorRegistration {
                username: slot.container_name.clone(),
                keys_dir: self.work_dir.validator_dir(slot.index),
                validator_host: slot.p2p_address(),
                stake_amount: self.config.stake_amount,
            };
            self.toolkit
                .set_validator_configuration(self.work_dir.root(), &registration)
                .await?;
            validator_set.push(ValidatorSetEntry {
                index: slot.index,
                account_address: identity.account_address,
                network_public_key: identity.network_public_key.clone(),
                validator_host: registration.validator_host,
                stake_amount: registration.stake_amount,
            });
        }
        Ok(validator_set)
    }

    async fn compute_genesis(&self) -> TestnetResult<(Vec<u8>, String)> {
        let output = self.work_dir.genesis_dir();
        self.toolkit
            .generate_genesis(self.work_dir.root(), &output)
            .await?;

        let blob_path = output.join(GENESIS_BLOB_FILE);
        let genesis_blob = std::fs::read(&blob_path).map_err(|e| TestnetError::io(&blob_path, e))?;
        if genesis_blob.is_empty() {
            return Err(TestnetError::io(
                &blob_path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "genesis blob is empty"),
            ));
        }

        let waypoint_path = output.join(WAYPOINT_FILE);
        let waypoint = std::fs::read_to_string(&waypoint_path)
            .map_err(|e| TestnetError::io(&waypoint_path, e))?
            .trim()
            .to_string();
        if waypoint.is_empty() {
            return Err(TestnetError::io(
                &waypoint_path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "waypoint is empty"),
            ));
        }
        Ok((genesis_blob, waypoint))
    }

    fn render_node_configs(&self, artifact: &GenesisArtifact) -> TestnetResult<()> {
        let genesis_dir = self.work_dir.genesis_dir();
        for slot in self.topology.slots() {
            let dir = self.work_dir.validator_dir(slot.index);
            for file in [GENESIS_BLOB_FILE, WAYPOINT_FILE] {
                let source = genesis_dir.join(file);
                std::fs::copy(&source, dir.join(file)).map_err(|e| TestnetError::io(&source, e))?;
            }

            let listen_address = ListenAddress::bind_all(slot.p2p_port)?;
            NodeConfig::render(slot, listen_address).write_checked(&dir.join(NODE_CONFIG_FILE), slot)?;
        }
        verify_fan_out(&self.work_dir, artifact, self.topology.len())
    }
}

/// Checks that every validator directory holds the artifact's genesis blob
/// and waypoint byte for byte.
pub fn verify_fan_out(work_dir: &WorkDir, artifact: &GenesisArtifact, validators: usize) -> TestnetResult<()> {
    for index in 0..validators {
        let dir = work_dir.validator_dir(index);
        let blob = read_bytes(&dir.join(GENESIS_BLOB_FILE))?;
        if blob != artifact.genesis_blob {
            return Err(TestnetError::GenesisGeneration {
                step: GenesisStep::NodeConfigRendering,
                detail: format!("validator-{index} holds a different genesis blob"),
            });
        }
        let waypoint = read_bytes(&dir.join(WAYPOINT_FILE))?;
        if String::from_utf8_lossy(&waypoint).trim() != artifact.waypoint {
            return Err(TestnetError::GenesisGeneration {
                step: GenesisStep::NodeConfigRendering,
                detail: format!("validator-{index} holds a different waypoint"),
            });
        }
    }
    Ok(())
}

fn read_bytes(path: &Path) -> TestnetResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| TestnetError::io(path, e))
}
