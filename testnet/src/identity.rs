//! Account addresses, signing keys and validator identities.
//!
//! Key material is always read back from the files the node CLI wrote during
//! genesis; nothing here regenerates validator keys.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{TestnetError, TestnetResult};

/// Authentication scheme byte appended to the public key for single-key accounts.
const ED25519_SCHEME: u8 = 0x00;

/// 32-byte on-chain account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountAddress([u8; 32]);

impl AccountAddress {
    /// Core resources account, the minting authority of test-mode genesis.
    pub const CORE_RESOURCES: AccountAddress = {
        let mut bytes = [0u8; 32];
        bytes[28] = 0x0a;
        bytes[29] = 0x55;
        bytes[30] = 0x0c;
        bytes[31] = 0x18;
        AccountAddress(bytes)
    };

    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Address authenticated by a single ed25519 public key.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(key.as_bytes());
        hasher.update([ED25519_SCHEME]);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `0x` followed by 64 hex digits.
    pub fn to_hex_literal(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl FromStr for AccountAddress {
    type Err = TestnetError;

    /// Accepts an optional `0x` prefix and short forms such as `0x1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches("0x");
        if digits.is_empty() || digits.len() > 64 {
            return Err(TestnetError::InvalidKey(format!("'{s}' is not an account address")));
        }
        let padded = format!("{digits:0>64}");
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&padded, &mut bytes)
            .map_err(|e| TestnetError::InvalidKey(format!("'{s}' is not an account address: {e}")))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex_literal())
    }
}

impl fmt::Debug for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountAddress({})", self.to_hex_literal())
    }
}

impl Serialize for AccountAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex_literal())
    }
}

impl<'de> Deserialize<'de> for AccountAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Ed25519 private key controlling an account.
#[derive(Clone)]
pub struct AccountKey(SigningKey);

impl AccountKey {
    /// Fresh random key.
    pub fn generate() -> Self {
        Self(SigningKey::generate(&mut OsRng))
    }

    /// Parses a `0x`-prefixed (or bare) 32-byte hex private key.
    pub fn from_hex(s: &str) -> TestnetResult<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim().trim_start_matches("0x"), &mut bytes)
            .map_err(|e| TestnetError::InvalidKey(format!("private key: {e}")))?;
        Ok(Self(SigningKey::from_bytes(&bytes)))
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.0.verifying_key()
    }

    /// Address derived from the public key.
    pub fn derived_address(&self) -> AccountAddress {
        AccountAddress::from_public_key(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.0.sign(message).to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        format!("0x{}", hex::encode(self.public_key().as_bytes()))
    }

    pub fn private_key_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0.to_bytes()))
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountKey({})", self.public_key_hex())
    }
}

/// Role of an account in the funding model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountRole {
    /// Genesis minting authority; used exactly once, for bootstrap.
    Root,
    /// Staked validator, the sender of runtime faucet transfers.
    Validator { index: usize },
    /// Created on demand by tests.
    User,
}

/// An address together with the key that signs for it.
#[derive(Debug, Clone)]
pub struct Account {
    pub role: AccountRole,
    pub address: AccountAddress,
    key: AccountKey,
}

impl Account {
    pub fn new(role: AccountRole, address: AccountAddress, key: AccountKey) -> Self {
        Self { role, address, key }
    }

    /// A fresh user account with a random key.
    pub fn generate_user() -> Self {
        let key = AccountKey::generate();
        Self::new(AccountRole::User, key.derived_address(), key)
    }

    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    /// Reads `account_address`/`account_private_key` from a keys file.
    pub fn from_keys_file(role: AccountRole, path: &Path) -> TestnetResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| TestnetError::io(path, e))?;
        let keys: AccountKeysFile = serde_yaml::from_str(&content)
            .map_err(|e| TestnetError::InvalidKey(format!("{}: {e}", path.display())))?;
        Ok(Self::new(
            role,
            keys.account_address.parse()?,
            AccountKey::from_hex(&keys.account_private_key)?,
        ))
    }
}

/// The root account. Not `Clone`: the funding controller consumes it during
/// bootstrap and it cannot be referenced afterwards.
#[derive(Debug)]
pub struct RootAccount(Account);

impl RootAccount {
    /// Loads the root key written during genesis. The key controls the core
    /// resources account, not the address it derives.
    pub fn load(path: &Path) -> TestnetResult<Self> {
        let account = Account::from_keys_file(AccountRole::Root, path)?;
        Ok(Self(Account::new(
            AccountRole::Root,
            AccountAddress::CORE_RESOURCES,
            account.key,
        )))
    }

    pub fn account(&self) -> &Account {
        &self.0
    }
}

/// Minimal keys file shared by validator and root key files.
#[derive(Debug, Deserialize)]
struct AccountKeysFile {
    account_address: String,
    account_private_key: String,
}

/// `private-keys.yaml` as written by `genesis generate-keys`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateKeysFile {
    pub account_address: String,
    pub account_private_key: String,
    pub consensus_private_key: String,
    #[serde(default)]
    pub full_node_network_private_key: Option<String>,
    pub validator_network_private_key: String,
}

/// `public-keys.yaml` as written by `genesis generate-keys`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeysFile {
    pub account_address: String,
    pub account_public_key: String,
    pub consensus_public_key: String,
    #[serde(default)]
    pub consensus_proof_of_possession: Option<String>,
    #[serde(default)]
    pub full_node_network_public_key: Option<String>,
    pub validator_network_public_key: String,
}

/// One validator's key triple plus the network public key peers must see.
#[derive(Debug, Clone)]
pub struct ValidatorIdentity {
    pub index: usize,
    pub account_address: AccountAddress,
    pub account_key: AccountKey,
    pub consensus_private_key: String,
    pub network_private_key: String,
    pub network_public_key: String,
}

impl ValidatorIdentity {
    /// Loads and cross-checks the key files in `dir`.
    ///
    /// The account address must be the one the account key derives, and both
    /// files must name the same account.
    pub fn load(index: usize, dir: &Path) -> TestnetResult<Self> {
        let private: PrivateKeysFile = read_yaml(&dir.join("private-keys.yaml"))?;
        let public: PublicKeysFile = read_yaml(&dir.join("public-keys.yaml"))?;

        let account_address: AccountAddress = private.account_address.parse()?;
        let public_address: AccountAddress = public.account_address.parse()?;
        if account_address != public_address {
            return Err(TestnetError::InvalidKey(format!(
                "validator-{index}: private keys name {account_address}, public keys name {public_address}"
            )));
        }

        let account_key = AccountKey::from_hex(&private.account_private_key)?;
        let derived = account_key.derived_address();
        if derived != account_address {
            return Err(TestnetError::InvalidKey(format!(
                "validator-{index}: account key derives {derived}, file says {account_address}"
            )));
        }
        if account_key.public_key_hex() != normalize_hex(&public.account_public_key) {
            return Err(TestnetError::InvalidKey(format!(
                "validator-{index}: account public key does not match the private key"
            )));
        }

        Ok(Self {
            index,
            account_address,
            account_key,
            consensus_private_key: private.consensus_private_key,
            network_private_key: private.validator_network_private_key,
            network_public_key: normalize_hex(&public.validator_network_public_key),
        })
    }

    /// The validator as a funding account.
    pub fn account(&self) -> Account {
        Account::new(
            AccountRole::Validator { index: self.index },
            self.account_address,
            self.account_key.clone(),
        )
    }
}

/// Lowercase with a `0x` prefix.
pub(crate) fn normalize_hex(s: &str) -> String {
    format!("0x{}", s.trim().trim_start_matches("0x").to_ascii_lowercase())
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> TestnetResult<T> {
    let content = std::fs::read_to_string(path).map_err(|e| TestnetError::io(path, e))?;
    serde_yaml::from_str(&content)
        .map_err(|e| TestnetError::InvalidKey(format!("{}: {e}", path.display())))
}
