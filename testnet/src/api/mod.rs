// File: testnet/src/api/mod.rs
//
// Node REST API
//
// Everything the controller asks a validator goes through `NodeApi`. The
// readiness monitor, the funding controller and the façade are written
// against the trait; `RestClient` is the reqwest-backed implementation and
// tests plug in an in-memory chain.

pub mod rest;

pub use rest::{RestClient, RestClientConfig, RestConnector};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

use crate::error::TestnetResult;
use crate::identity::{Account, AccountAddress};

/// `GET /v1`
///
/// The node encodes 64-bit numbers as JSON strings; both forms are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerInfo {
    pub chain_id: u8,
    #[serde(deserialize_with = "u64_from_string_or_number")]
    pub epoch: u64,
    #[serde(deserialize_with = "u64_from_string_or_number")]
    pub ledger_version: u64,
    #[serde(default, deserialize_with = "u64_from_string_or_number")]
    pub oldest_ledger_version: u64,
    #[serde(deserialize_with = "u64_from_string_or_number")]
    pub ledger_timestamp: u64,
    #[serde(default)]
    pub node_role: String,
    #[serde(default, deserialize_with = "u64_from_string_or_number")]
    pub oldest_block_height: u64,
    #[serde(deserialize_with = "u64_from_string_or_number")]
    pub block_height: u64,
    #[serde(default)]
    pub git_hash: Option<String>,
}

pub(crate) fn u64_from_string_or_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Where a submitted transaction stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not yet committed (or not yet visible to this node).
    Pending,
    Success { version: u64 },
    /// Committed but aborted; the chain keeps the sequence number.
    Failed { vm_status: String },
}

/// One validator's REST endpoint.
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// `http://127.0.0.1:<api_port>`
    fn base_url(&self) -> &str;

    async fn ledger_info(&self) -> TestnetResult<LedgerInfo>;

    /// Coin balance; zero for accounts that do not exist yet.
    async fn account_balance(&self, address: &AccountAddress) -> TestnetResult<u64>;

    /// Next sequence number; zero for accounts that do not exist yet.
    async fn sequence_number(&self, address: &AccountAddress) -> TestnetResult<u64>;

    /// Signs and submits a coin transfer, returning the transaction hash.
    async fn submit_transfer(
        &self,
        sender: &Account,
        recipient: &AccountAddress,
        amount: u64,
    ) -> TestnetResult<String>;

    async fn transaction_status(&self, hash: &str) -> TestnetResult<TransactionStatus>;

    /// `dealer_epoch_public_key` of the on-chain DKG state, the group key
    /// used for timelock encryption.
    async fn validator_group_pubkey(&self) -> TestnetResult<String>;
}

/// Creates [`NodeApi`] clients for validator endpoints.
pub trait ApiConnector: Send + Sync {
    fn connect(&self, base_url: &str) -> TestnetResult<Arc<dyn NodeApi>>;
}
