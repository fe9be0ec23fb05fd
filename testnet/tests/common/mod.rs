// Shared fixtures for the controller integration tests
//
// An in-memory container engine, a genesis toolkit that writes real key
// files without the node CLI, and a mock chain standing in for the
// validators' REST APIs.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::time::{Duration, Instant};

use posnet_testnet::api::{ApiConnector, LedgerInfo, NodeApi, TransactionStatus};
use posnet_testnet::config::{RegistryAuth, TestnetConfig};
use posnet_testnet::engine::{
    BuildOptions, ComposeProject, ContainerEngine, EngineErrorKind, ImageRef, ScopedProcess,
};
use posnet_testnet::error::{TestnetError, TestnetResult};
use posnet_testnet::genesis::{GenesisToolkit, ValidatorRegistration};
use posnet_testnet::identity::{
    Account, AccountAddress, AccountKey, PrivateKeysFile, PublicKeysFile,
};
use posnet_testnet::lifecycle::PortInspector;
use posnet_testnet::workspace::{GENESIS_BLOB_FILE, WAYPOINT_FILE};

pub const CHAIN_ID: u8 = 4;

/// Configuration for a mocked testnet rooted in `work_dir`, with short
/// deadlines so paused-time tests stay small.
pub fn test_config(validators: usize, work_dir: &Path) -> TestnetConfig {
    TestnetConfig {
        validators,
        work_dir: work_dir.to_path_buf(),
        project_name: "posnet-test".to_string(),
        readiness_interval_ms: 100,
        readiness_deadline_secs: 10,
        probe_timeout_ms: 500,
        finality_timeout_secs: 5,
        funding_retry_delay_ms: 100,
        ..TestnetConfig::new(validators)
    }
}

pub fn work_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("posnet-it")
        .tempdir()
        .expect("temp work dir")
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Records every engine call; failures are switched on per test.
#[derive(Default)]
pub struct MockEngine {
    calls: Mutex<Vec<String>>,
    daemon_down: AtomicBool,
    image_missing: AtomicBool,
    pull_failure: Mutex<Option<EngineErrorKind>>,
    compose_up_fails: AtomicBool,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn daemon_down(self: Arc<Self>) -> Arc<Self> {
        self.daemon_down.store(true, Ordering::SeqCst);
        self
    }

    /// The image is not present locally and pulling fails with `kind`.
    pub fn image_unpullable(self: Arc<Self>, kind: EngineErrorKind) -> Arc<Self> {
        self.image_missing.store(true, Ordering::SeqCst);
        *self.pull_failure.lock().unwrap() = Some(kind);
        self
    }

    pub fn image_missing(self: Arc<Self>) -> Arc<Self> {
        self.image_missing.store(true, Ordering::SeqCst);
        self
    }

    pub fn compose_up_fails(self: Arc<Self>) -> Arc<Self> {
        self.compose_up_fails.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn failure(command: &str, kind: EngineErrorKind, detail: &str) -> TestnetError {
        TestnetError::EngineCommand {
            command: command.to_string(),
            kind,
            detail: detail.to_string(),
        }
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn ping(&self) -> TestnetResult<()> {
        self.record("ping");
        if self.daemon_down.load(Ordering::SeqCst) {
            return Err(TestnetError::EngineUnavailable(
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock".to_string(),
            ));
        }
        Ok(())
    }

    async fn image_present(&self, image: &ImageRef) -> TestnetResult<bool> {
        self.record(format!("image_present {image}"));
        Ok(!self.image_missing.load(Ordering::SeqCst))
    }

    async fn pull(&self, image: &ImageRef) -> TestnetResult<()> {
        self.record(format!("pull {image}"));
        match *self.pull_failure.lock().unwrap() {
            Some(EngineErrorKind::AuthenticationRequired) => Err(Self::failure(
                "docker pull",
                EngineErrorKind::AuthenticationRequired,
                "unauthorized: authentication required",
            )),
            Some(kind) => Err(Self::failure("docker pull", kind, "manifest unknown")),
            None => Ok(()),
        }
    }

    async fn login(&self, auth: &RegistryAuth, _password: &str) -> TestnetResult<()> {
        self.record(format!("login {}", auth.username));
        Ok(())
    }

    async fn compose_up(&self, project: &ComposeProject) -> TestnetResult<()> {
        self.record(format!("up {}", project.name));
        if self.compose_up_fails.load(Ordering::SeqCst) {
            return Err(Self::failure(
                "docker compose up",
                EngineErrorKind::PortInUse,
                "Bind for 0.0.0.0:8080 failed: port is already allocated",
            ));
        }
        Ok(())
    }

    async fn compose_down(&self, project: &ComposeProject) -> TestnetResult<()> {
        self.record(format!("down {}", project.name));
        Ok(())
    }

    fn compose_down_blocking(&self, project: &ComposeProject) -> TestnetResult<()> {
        self.record(format!("down-blocking {}", project.name));
        Ok(())
    }

    async fn build_image(&self, image: &ImageRef, options: &BuildOptions) -> TestnetResult<()> {
        self.record(format!(
            "build {image} profile={}",
            options.profile.as_deref().unwrap_or("release")
        ));
        Ok(())
    }

    async fn follow_logs(
        &self,
        project: &ComposeProject,
        _output: &Path,
    ) -> TestnetResult<Option<ScopedProcess>> {
        self.record(format!("logs {}", project.name));
        Ok(None)
    }
}

/// Writes genuine ed25519 key files and a deterministic genesis, the way the
/// node CLI lays them out.
#[derive(Default)]
pub struct FakeToolkit {
    registrations: Mutex<Vec<ValidatorRegistration>>,
    fail_keys: AtomicBool,
}

impl FakeToolkit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_key_generation() -> Arc<Self> {
        let toolkit = Self::default();
        toolkit.fail_keys.store(true, Ordering::SeqCst);
        Arc::new(toolkit)
    }

    pub fn registrations(&self) -> Vec<ValidatorRegistration> {
        self.registrations.lock().unwrap().clone()
    }
}

fn write_yaml<T: serde::Serialize>(path: PathBuf, value: &T) -> TestnetResult<()> {
    let yaml = serde_yaml::to_string(value)?;
    std::fs::write(&path, yaml).map_err(|e| TestnetError::io(&path, e))
}

#[async_trait]
impl GenesisToolkit for FakeToolkit {
    async fn generate_keys(&self, output_dir: &Path) -> TestnetResult<()> {
        if self.fail_keys.load(Ordering::SeqCst) {
            return Err(TestnetError::EngineCommand {
                command: "aptos genesis generate-keys".to_string(),
                kind: EngineErrorKind::Other,
                detail: "error: unexpected argument '--assume-yes'".to_string(),
            });
        }
        let account = AccountKey::generate();
        let consensus = AccountKey::generate();
        let network = AccountKey::generate();
        // The CLI writes bare hex addresses.
        let address = hex::encode(account.derived_address().as_bytes());

        write_yaml(
            output_dir.join("private-keys.yaml"),
            &PrivateKeysFile {
                account_address: address.clone(),
                account_private_key: account.private_key_hex(),
                consensus_private_key: consensus.private_key_hex(),
                full_node_network_private_key: None,
                validator_network_private_key: network.private_key_hex(),
            },
        )?;
        write_yaml(
            output_dir.join("public-keys.yaml"),
            &PublicKeysFile {
                account_address: address,
                account_public_key: account.public_key_hex(),
                consensus_public_key: consensus.public_key_hex(),
                consensus_proof_of_possession: None,
                full_node_network_public_key: None,
                validator_network_public_key: network.public_key_hex(),
            },
        )?;
        let identity = output_dir.join("validator-identity.yaml");
        std::fs::write(&identity, format!("network_private_key: {}\n", network.private_key_hex()))
            .map_err(|e| TestnetError::io(&identity, e))
    }

    async fn set_validator_configuration(
        &self,
        repository: &Path,
        registration: &ValidatorRegistration,
    ) -> TestnetResult<()> {
        let dir = repository.join(&registration.username);
        std::fs::create_dir_all(&dir).map_err(|e| TestnetError::io(&dir, e))?;
        let operator = dir.join("operator.yaml");
        std::fs::write(
            &operator,
            format!(
                "validator_host: {}\nstake_amount: {}\n",
                registration.validator_host, registration.stake_amount
            ),
        )
        .map_err(|e| TestnetError::io(&operator, e))?;
        self.registrations.lock().unwrap().push(registration.clone());
        Ok(())
    }

    async fn generate_genesis(&self, repository: &Path, output_dir: &Path) -> TestnetResult<()> {
        let layout = repository.join("layout.yaml");
        let mut blob = b"genesis\0".to_vec();
        blob.extend(std::fs::read(&layout).map_err(|e| TestnetError::io(&layout, e))?);
        for registration in self.registrations() {
            blob.extend(registration.username.as_bytes());
        }

        std::fs::create_dir_all(output_dir).map_err(|e| TestnetError::io(output_dir, e))?;
        let blob_path = output_dir.join(GENESIS_BLOB_FILE);
        std::fs::write(&blob_path, &blob).map_err(|e| TestnetError::io(&blob_path, e))?;
        let waypoint = output_dir.join(WAYPOINT_FILE);
        std::fs::write(&waypoint, format!("0:{}\n", hex::encode(&blob[..16])))
            .map_err(|e| TestnetError::io(&waypoint, e))
    }
}

/// A committed (or rejected) transfer seen by the mock chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub node: usize,
    pub sender: AccountAddress,
    pub recipient: AccountAddress,
    pub amount: u64,
}

#[derive(Default)]
struct ChainState {
    height: u64,
    nodes: Vec<String>,
    down: BTreeSet<usize>,
    balances: HashMap<AccountAddress, u64>,
    sequence_numbers: HashMap<AccountAddress, u64>,
    transactions: HashMap<String, TransactionStatus>,
    transfers: Vec<Transfer>,
    flaky_submissions: u32,
    commit_delay: Option<Duration>,
    submitted_at: HashMap<String, Instant>,
    group_pubkey: Option<String>,
}

/// One ledger shared by every validator endpoint. The core resources
/// account mints; everyone else spends what they hold.
pub struct MockChain {
    chain_id: u8,
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Self::with_chain_id(CHAIN_ID)
    }

    pub fn with_chain_id(chain_id: u8) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            state: Mutex::new(ChainState::default()),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<MockConnector> {
        Arc::new(MockConnector {
            chain: Arc::clone(self),
        })
    }

    pub fn balance(&self, address: &AccountAddress) -> u64 {
        self.lock().balances.get(address).copied().unwrap_or(0)
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.lock().transfers.clone()
    }

    pub fn transfers_from(&self, sender: &AccountAddress) -> Vec<Transfer> {
        self.transfers()
            .into_iter()
            .filter(|t| &t.sender == sender)
            .collect()
    }

    /// Takes validator `index` off the network (or brings it back).
    pub fn set_down(&self, index: usize, down: bool) {
        let mut state = self.lock();
        if down {
            state.down.insert(index);
        } else {
            state.down.remove(&index);
        }
    }

    /// The next `count` submissions fail like a node that is still syncing.
    pub fn fail_next_submissions(&self, count: u32) {
        self.lock().flaky_submissions = count;
    }

    /// Transactions stay pending for `delay` after submission.
    pub fn delay_commits(&self, delay: Duration) {
        self.lock().commit_delay = Some(delay);
    }

    /// Publishes a DKG state carrying `key` as the dealer epoch key.
    pub fn set_group_pubkey(&self, key: &str) {
        self.lock().group_pubkey = Some(key.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    fn node_index(&self, base_url: &str) -> usize {
        let mut state = self.lock();
        match state.nodes.iter().position(|url| url == base_url) {
            Some(index) => index,
            None => {
                state.nodes.push(base_url.to_string());
                state.nodes.len() - 1
            }
        }
    }
}

pub struct MockConnector {
    chain: Arc<MockChain>,
}

impl ApiConnector for MockConnector {
    fn connect(&self, base_url: &str) -> TestnetResult<Arc<dyn NodeApi>> {
        Ok(Arc::new(MockNode {
            index: self.chain.node_index(base_url),
            base_url: base_url.to_string(),
            chain: Arc::clone(&self.chain),
        }))
    }
}

pub struct MockNode {
    index: usize,
    base_url: String,
    chain: Arc<MockChain>,
}

impl MockNode {
    fn check_up(&self, endpoint: &str) -> TestnetResult<()> {
        if self.chain.lock().down.contains(&self.index) {
            return Err(TestnetError::Api {
                endpoint: format!("{}/{endpoint}", self.base_url),
                detail: "error sending request: connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NodeApi for MockNode {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Every query sees one more block.
    async fn ledger_info(&self) -> TestnetResult<LedgerInfo> {
        self.check_up("v1")?;
        let mut state = self.chain.lock();
        state.height += 1;
        Ok(LedgerInfo {
            chain_id: self.chain.chain_id,
            epoch: 1,
            ledger_version: state.height * 3,
            oldest_ledger_version: 0,
            ledger_timestamp: 1_718_000_000_000_000 + state.height,
            node_role: "validator".to_string(),
            oldest_block_height: 0,
            block_height: state.height,
            git_hash: None,
        })
    }

    async fn account_balance(&self, address: &AccountAddress) -> TestnetResult<u64> {
        self.check_up("v1/accounts")?;
        Ok(self.chain.balance(address))
    }

    async fn sequence_number(&self, address: &AccountAddress) -> TestnetResult<u64> {
        self.check_up("v1/accounts")?;
        Ok(self
            .chain
            .lock()
            .sequence_numbers
            .get(address)
            .copied()
            .unwrap_or(0))
    }

    async fn submit_transfer(
        &self,
        sender: &Account,
        recipient: &AccountAddress,
        amount: u64,
    ) -> TestnetResult<String> {
        self.check_up("v1/transactions")?;
        let mut state = self.chain.lock();
        if state.flaky_submissions > 0 {
            state.flaky_submissions -= 1;
            return Err(TestnetError::Api {
                endpoint: format!("{}/v1/transactions", self.base_url),
                detail: "HTTP 503: node is syncing".to_string(),
            });
        }

        let hash = format!("0x{:064x}", state.transactions.len() + 1);
        let minting = sender.address == AccountAddress::CORE_RESOURCES;
        let available = state.balances.get(&sender.address).copied().unwrap_or(0);
        let status = if minting || available >= amount {
            if !minting {
                state.balances.insert(sender.address, available - amount);
            }
            *state.balances.entry(*recipient).or_insert(0) += amount;
            *state.sequence_numbers.entry(sender.address).or_insert(0) += 1;
            state.transfers.push(Transfer {
                node: self.index,
                sender: sender.address,
                recipient: *recipient,
                amount,
            });
            TransactionStatus::Success {
                version: state.transactions.len() as u64 + 1,
            }
        } else {
            TransactionStatus::Failed {
                vm_status: "Move abort: EINSUFFICIENT_BALANCE".to_string(),
            }
        };
        state.transactions.insert(hash.clone(), status);
        state.submitted_at.insert(hash.clone(), Instant::now());
        Ok(hash)
    }

    async fn transaction_status(&self, hash: &str) -> TestnetResult<TransactionStatus> {
        self.check_up("v1/transactions/by_hash")?;
        let state = self.chain.lock();
        if let (Some(delay), Some(at)) = (state.commit_delay, state.submitted_at.get(hash)) {
            if at.elapsed() < delay {
                return Ok(TransactionStatus::Pending);
            }
        }
        Ok(state
            .transactions
            .get(hash)
            .cloned()
            .unwrap_or(TransactionStatus::Pending))
    }

    async fn validator_group_pubkey(&self) -> TestnetResult<String> {
        self.check_up("v1/accounts/0x1/resource")?;
        self.chain
            .lock()
            .group_pubkey
            .clone()
            .ok_or_else(|| TestnetError::Api {
                endpoint: format!("{}/v1/accounts/0x1/resource/0x1::dkg::DKGState", self.base_url),
                detail: "HTTP 404 Not Found: DKG state not found".to_string(),
            })
    }
}

/// Nothing listens on any port.
pub struct QuietPorts;

#[async_trait]
impl PortInspector for QuietPorts {
    async fn listeners(&self, _port: u16) -> TestnetResult<Vec<u32>> {
        Ok(Vec::new())
    }
}
