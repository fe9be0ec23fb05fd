//! `layout.yaml`: chain parameters, root key and the validator user list
//! consumed by the genesis computation.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::TestnetConfig;
use crate::error::{TestnetError, TestnetResult};
use crate::identity::AccountKey;
use crate::topology::Topology;

/// Stake locks up for a day; irrelevant to short-lived testnets but required.
const RECURRING_LOCKUP_SECS: u64 = 86_400;
const VOTING_DURATION_SECS: u64 = 43_200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    /// Public key that will control the core resources account.
    pub root_key: String,
    /// One registration username per validator, `validator-<i>`.
    pub users: Vec<String>,
    pub chain_id: u8,
    pub allow_new_validators: bool,
    pub epoch_duration_secs: u64,
    /// Test mode: the root key is installed as the minting authority.
    pub is_test: bool,
    pub min_stake: u64,
    pub min_voting_threshold: u64,
    pub max_stake: u64,
    pub recurring_lockup_duration_secs: u64,
    pub required_proposer_stake: u64,
    pub rewards_apy_percentage: u64,
    pub voting_duration_secs: u64,
    pub voting_power_increase_limit: u64,
}

impl Layout {
    pub fn new(config: &TestnetConfig, topology: &Topology, root_key: &AccountKey) -> Self {
        Self {
            root_key: root_key.public_key_hex(),
            users: topology
                .slots()
                .iter()
                .map(|slot| slot.container_name.clone())
                .collect(),
            chain_id: config.chain_id,
            allow_new_validators: true,
            epoch_duration_secs: config.epoch_duration_secs,
            is_test: true,
            min_stake: config.stake_amount,
            min_voting_threshold: config.stake_amount,
            max_stake: config.stake_amount.saturating_mul(topology.len() as u64 + 1),
            recurring_lockup_duration_secs: RECURRING_LOCKUP_SECS,
            required_proposer_stake: config.stake_amount,
            rewards_apy_percentage: 10,
            voting_duration_secs: VOTING_DURATION_SECS,
            voting_power_increase_limit: 50,
        }
    }

    pub fn write(&self, path: &Path) -> TestnetResult<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml).map_err(|e| TestnetError::io(path, e))
    }

    pub fn read(path: &Path) -> TestnetResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| TestnetError::io(path, e))?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

/// Contents of `root-account-private-keys.yaml`.
#[derive(Debug, Serialize)]
pub(crate) struct RootKeysFile {
    pub account_address: String,
    pub account_private_key: String,
}

impl RootKeysFile {
    pub fn new(key: &AccountKey) -> Self {
        Self {
            account_address: hex::encode(key.derived_address().as_bytes()),
            account_private_key: key.private_key_hex(),
        }
    }

    pub fn write(&self, path: &Path) -> TestnetResult<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml).map_err(|e| TestnetError::io(path, e))
    }
}
