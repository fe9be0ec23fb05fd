// File: testnet/src/funding.rs
//
// Funding Controller
//
// Two phases:
//
//   bootstrap  root -> every validator, once, each transfer final before the
//              next; the root account is dropped afterwards
//   runtime    validator -> recipient, an ordinary signed transfer with a
//              bounded number of retries
//
// After bootstrap nothing in the controller can reach the root key, so test
// code that funds accounts exercises the same path it would on a real network.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::time::Duration;

use crate::api::{NodeApi, TransactionStatus};
use crate::config::{FaucetPolicy, TestnetConfig};
use crate::error::{TestnetError, TestnetResult};
use crate::identity::{Account, AccountAddress, RootAccount};
use crate::orchestrator::{poll_until, Clock, PollSchedule, Probe};

/// A validator that can sign runtime transfers, with the endpoint it submits to.
#[derive(Clone)]
pub struct FundingSource {
    pub account: Account,
    pub api: Arc<dyn NodeApi>,
}

pub struct FundingController {
    /// `None` once bootstrap has started.
    root: Option<RootAccount>,
    bootstrapped: bool,
    sources: Vec<FundingSource>,
    policy: FaucetPolicy,
    next_source: usize,
    retries: u32,
    retry_delay: Duration,
    finality: PollSchedule,
    clock: Arc<dyn Clock>,
}

impl FundingController {
    pub fn new(
        config: &TestnetConfig,
        root: RootAccount,
        sources: Vec<FundingSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            root: Some(root),
            bootstrapped: false,
            sources,
            policy: config.faucet_policy,
            next_source: 0,
            retries: config.funding_retries,
            retry_delay: config.funding_retry_delay(),
            finality: config.finality_schedule(),
            clock,
        }
    }

    /// Controller for a network another process already bootstrapped. It
    /// never holds the root key.
    pub fn resume_bootstrapped(
        config: &TestnetConfig,
        sources: Vec<FundingSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            root: None,
            bootstrapped: true,
            sources,
            policy: config.faucet_policy,
            next_source: 0,
            retries: config.funding_retries,
            retry_delay: config.funding_retry_delay(),
            finality: config.finality_schedule(),
            clock,
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Whether the root key is still held.
    pub fn holds_root(&self) -> bool {
        self.root.is_some()
    }

    /// Transfers `amount_per_validator` from the root account to every
    /// validator and waits for each transfer to be final.
    ///
    /// Runs at most once; later calls return no hashes. The root account is
    /// released whether or not bootstrap succeeds.
    pub async fn bootstrap(&mut self, amount_per_validator: u64) -> TestnetResult<Vec<String>> {
        if self.bootstrapped {
            info!("Validators already bootstrapped, skipping");
            return Ok(Vec::new());
        }
        let root = self.root.take().ok_or(TestnetError::InvalidState {
            operation: "bootstrap validators",
            state: "without a root account (an earlier bootstrap failed)".to_string(),
        })?;
        let api = self
            .sources
            .first()
            .map(|source| Arc::clone(&source.api))
            .ok_or_else(|| TestnetError::config("validators", "no validator to bootstrap"))?;

        info!(
            "Bootstrapping {} validator(s) with {} each from {}",
            self.sources.len(),
            amount_per_validator,
            root.account().address
        );

        let mut hashes = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let recipient = source.account.address;
            let hash = self
                .transfer_once(api.as_ref(), root.account(), &recipient, amount_per_validator)
                .await
                .map_err(|e| TestnetError::FundingFailed {
                    recipient: recipient.to_string(),
                    amount: amount_per_validator,
                    attempts: 1,
                    source: Box::new(e),
                })?;
            hashes.push(hash);
        }

        self.bootstrapped = true;
        drop(root);
        info!("Bootstrap complete; root account released");
        Ok(hashes)
    }

    /// Runtime faucet: an ordinary transfer signed by a validator.
    pub async fn faucet(&mut self, recipient: &AccountAddress, amount: u64) -> TestnetResult<String> {
        if !self.bootstrapped {
            return Err(TestnetError::InvalidState {
                operation: "fund accounts",
                state: "not bootstrapped".to_string(),
            });
        }
        let source = self.select_source()?;
        debug!(
            "Funding {} with {} from {:?}",
            recipient, amount, source.account.role
        );

        let mut last_error = None;
        let mut attempts = 0;
        // Submitted but not yet final: checked again, never resent.
        let mut in_flight: Option<String> = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                warn!(
                    "Retrying transfer to {} (attempt {}/{})",
                    recipient, attempt, self.retries
                );
                self.clock.sleep(self.retry_delay).await;
            }
            attempts += 1;

            let hash = match in_flight.take() {
                Some(hash) => hash,
                None => match source
                    .api
                    .submit_transfer(&source.account, recipient, amount)
                    .await
                {
                    Ok(hash) => hash,
                    Err(e) => {
                        let retryable = e.is_retryable();
                        debug!("Transfer attempt {} not submitted: {}", attempts, e);
                        last_error = Some(e);
                        if retryable {
                            continue;
                        }
                        break;
                    }
                },
            };

            match wait_for_finality(source.api.as_ref(), self.clock.as_ref(), self.finality, &hash)
                .await
            {
                Ok(_) => return Ok(hash),
                Err(e @ TestnetError::TransactionFailed { .. }) => {
                    debug!("Transfer attempt {} aborted: {}", attempts, e);
                    last_error = Some(e);
                }
                Err(e) => {
                    debug!("Transfer {} unresolved: {}", hash, e);
                    in_flight = Some(hash);
                    last_error = Some(e);
                }
            }
        }

        if let Some(hash) = &in_flight {
            warn!("Transfer {} to {} may still commit", hash, recipient);
        }
        Err(TestnetError::FundingFailed {
            recipient: recipient.to_string(),
            amount,
            attempts,
            source: Box::new(last_error.unwrap_or_else(|| TestnetError::InvalidState {
                operation: "fund accounts",
                state: "without any transfer attempt".to_string(),
            })),
        })
    }

    fn select_source(&mut self) -> TestnetResult<FundingSource> {
        let count = self.sources.len();
        let index = match self.policy {
            FaucetPolicy::Fixed { validator } => validator,
            FaucetPolicy::RoundRobin => {
                let index = self.next_source % count.max(1);
                self.next_source = index + 1;
                index
            }
        };
        self.sources
            .get(index)
            .cloned()
            .ok_or(TestnetError::ValidatorIndexOutOfRange { index, count })
    }

    async fn transfer_once(
        &self,
        api: &dyn NodeApi,
        sender: &Account,
        recipient: &AccountAddress,
        amount: u64,
    ) -> TestnetResult<String> {
        let hash = api.submit_transfer(sender, recipient, amount).await?;
        wait_for_finality(api, self.clock.as_ref(), self.finality, &hash).await?;
        Ok(hash)
    }
}

/// Polls a transaction until it is committed. An aborted transaction is
/// final too and reported as [`TestnetError::TransactionFailed`].
pub async fn wait_for_finality(
    api: &dyn NodeApi,
    clock: &dyn Clock,
    schedule: PollSchedule,
    hash: &str,
) -> TestnetResult<u64> {
    let outcome = poll_until(clock, schedule, || async move {
        match api.transaction_status(hash).await {
            Ok(TransactionStatus::Success { version }) => Probe::Ready(Ok(version)),
            Ok(TransactionStatus::Failed { vm_status }) => {
                Probe::Ready(Err(TestnetError::TransactionFailed {
                    hash: hash.to_string(),
                    vm_status,
                }))
            }
            Ok(TransactionStatus::Pending) => Probe::Pending(None),
            Err(e) => Probe::Pending(Some(e.to_string())),
        }
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(timeout) => {
            if let Some(Some(last)) = &timeout.last {
                debug!("Last status error for {}: {}", hash, last);
            }
            Err(timeout.into_error(format!("transaction {hash} to commit")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::LedgerInfo;
    use crate::identity::{AccountKey, AccountRole};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Commits every transfer immediately unless a scripted failure is queued
    /// or a commit delay is set.
    #[derive(Default)]
    struct Ledger {
        balances: Mutex<HashMap<AccountAddress, u64>>,
        senders: Mutex<Vec<AccountAddress>>,
        failures: Mutex<VecDeque<TestnetError>>,
        commit_delay: Mutex<Option<Duration>>,
        submitted_at: Mutex<HashMap<String, Instant>>,
    }

    #[async_trait]
    impl NodeApi for Ledger {
        fn base_url(&self) -> &str {
            "http://127.0.0.1:0"
        }

        async fn ledger_info(&self) -> TestnetResult<LedgerInfo> {
            Err(TestnetError::Api {
                endpoint: "unused".to_string(),
                detail: "unused".to_string(),
            })
        }

        async fn account_balance(&self, address: &AccountAddress) -> TestnetResult<u64> {
            Ok(self.balances.lock().unwrap().get(address).copied().unwrap_or(0))
        }

        async fn sequence_number(&self, _: &AccountAddress) -> TestnetResult<u64> {
            Ok(0)
        }

        async fn submit_transfer(
            &self,
            sender: &Account,
            recipient: &AccountAddress,
            amount: u64,
        ) -> TestnetResult<String> {
            if let Some(e) = self.failures.lock().unwrap().pop_front() {
                return Err(e);
            }
            self.senders.lock().unwrap().push(sender.address);
            *self.balances.lock().unwrap().entry(*recipient).or_default() += amount;
            let hash = format!("0x{:x}", self.senders.lock().unwrap().len());
            self.submitted_at.lock().unwrap().insert(hash.clone(), Instant::now());
            Ok(hash)
        }

        async fn transaction_status(&self, hash: &str) -> TestnetResult<TransactionStatus> {
            let delay = *self.commit_delay.lock().unwrap();
            let submitted = self.submitted_at.lock().unwrap().get(hash).copied();
            match (delay, submitted) {
                (Some(delay), Some(at)) if at.elapsed() < delay => Ok(TransactionStatus::Pending),
                (_, None) => Ok(TransactionStatus::Pending),
                _ => Ok(TransactionStatus::Success { version: 1 }),
            }
        }

        async fn validator_group_pubkey(&self) -> TestnetResult<String> {
            Ok("0xfeed".to_string())
        }
    }

    fn root() -> RootAccount {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("root-account-private-keys.yaml");
        let key = AccountKey::generate();
        std::fs::write(
            &path,
            format!(
                "account_address: \"0xa550c18\"\naccount_private_key: \"{}\"\n",
                key.private_key_hex()
            ),
        )
        .unwrap();
        RootAccount::load(&path).unwrap()
    }

    fn controller(config: TestnetConfig, ledger: &Arc<Ledger>, validators: usize) -> FundingController {
        let sources = (0..validators)
            .map(|index| {
                let key = AccountKey::generate();
                FundingSource {
                    account: Account::new(AccountRole::Validator { index }, key.derived_address(), key),
                    api: Arc::clone(ledger) as Arc<dyn NodeApi>,
                }
            })
            .collect();
        FundingController::new(&config, root(), sources, Arc::new(crate::orchestrator::PausedClock::new()))
    }

    fn api_error() -> TestnetError {
        TestnetError::Api {
            endpoint: "http://127.0.0.1:8080/v1/transactions".to_string(),
            detail: "HTTP 503".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_runs_exactly_once() {
        let ledger = Arc::new(Ledger::default());
        let mut funding = controller(TestnetConfig::new(3), &ledger, 3);

        let hashes = funding.bootstrap(10_000_000_000).await.unwrap();
        assert_eq!(hashes.len(), 3);
        assert!(funding.is_bootstrapped());
        assert!(!funding.holds_root());

        let again = funding.bootstrap(10_000_000_000).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(ledger.senders.lock().unwrap().len(), 3);
        assert!(ledger
            .senders
            .lock()
            .unwrap()
            .iter()
            .all(|sender| *sender == AccountAddress::CORE_RESOURCES));
    }

    #[tokio::test(start_paused = true)]
    async fn test_faucet_never_uses_root() {
        let ledger = Arc::new(Ledger::default());
        let mut funding = controller(TestnetConfig::new(2), &ledger, 2);
        funding.bootstrap(10_000_000_000).await.unwrap();

        let user = Account::generate_user();
        funding.faucet(&user.address, 100_000_000).await.unwrap();

        assert_eq!(ledger.account_balance(&user.address).await.unwrap(), 100_000_000);
        let last_sender = *ledger.senders.lock().unwrap().last().unwrap();
        assert_ne!(last_sender, AccountAddress::CORE_RESOURCES);
    }

    #[tokio::test(start_paused = true)]
    async fn test_faucet_requires_bootstrap() {
        let ledger = Arc::new(Ledger::default());
        let mut funding = controller(TestnetConfig::new(1), &ledger, 1);
        let err = funding
            .faucet(&Account::generate_user().address, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, TestnetError::InvalidState { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_faucet_retries_transient_errors() {
        let ledger = Arc::new(Ledger::default());
        let mut funding = controller(TestnetConfig::new(1), &ledger, 1);
        funding.bootstrap(1_000).await.unwrap();

        ledger.failures.lock().unwrap().extend([api_error(), api_error()]);
        let user = Account::generate_user();
        funding.faucet(&user.address, 10).await.unwrap();
        assert_eq!(ledger.account_balance(&user.address).await.unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_faucet_gives_up_after_retries() {
        let ledger = Arc::new(Ledger::default());
        let mut config = TestnetConfig::new(1);
        config.funding_retries = 2;
        let mut funding = controller(config, &ledger, 1);
        funding.bootstrap(1_000).await.unwrap();

        ledger
            .failures
            .lock()
            .unwrap()
            .extend([api_error(), api_error(), api_error(), api_error()]);
        let err = funding
            .faucet(&Account::generate_user().address, 10)
            .await
            .unwrap_err();

        match err {
            TestnetError::FundingFailed { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, TestnetError::Api { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_faucet_stops_on_permanent_error() {
        let ledger = Arc::new(Ledger::default());
        let mut funding = controller(TestnetConfig::new(1), &ledger, 1);
        funding.bootstrap(1_000).await.unwrap();

        ledger
            .failures
            .lock()
            .unwrap()
            .push_back(TestnetError::InvalidKey("bad signature".to_string()));
        let err = funding
            .faucet(&Account::generate_user().address, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, TestnetError::FundingFailed { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_commit_is_not_paid_twice() {
        let ledger = Arc::new(Ledger::default());
        let mut config = TestnetConfig::new(1);
        config.finality_timeout_secs = 30;
        config.funding_retries = 3;
        let mut funding = controller(config, &ledger, 1);
        funding.bootstrap(1_000_000_000).await.unwrap();

        // The transfer lands just after the first finality deadline.
        *ledger.commit_delay.lock().unwrap() = Some(Duration::from_millis(30_500));
        let user = Account::generate_user();
        let hash = funding.faucet(&user.address, 100_000_000).await.unwrap();

        assert_eq!(hash, "0x2");
        assert_eq!(ledger.senders.lock().unwrap().len(), 2);
        assert_eq!(ledger.account_balance(&user.address).await.unwrap(), 100_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_transfer_is_reported_not_resent() {
        let ledger = Arc::new(Ledger::default());
        let mut config = TestnetConfig::new(1);
        config.finality_timeout_secs = 5;
        config.funding_retries = 2;
        let mut funding = controller(config, &ledger, 1);
        funding.bootstrap(1_000).await.unwrap();

        *ledger.commit_delay.lock().unwrap() = Some(Duration::from_secs(3_600));
        let user = Account::generate_user();
        match funding.faucet(&user.address, 10).await.unwrap_err() {
            TestnetError::FundingFailed { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, TestnetError::Timeout { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ledger.senders.lock().unwrap().len(), 2, "one bootstrap, one faucet submission");
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin_rotates_senders() {
        let ledger = Arc::new(Ledger::default());
        let mut config = TestnetConfig::new(3);
        config.faucet_policy = FaucetPolicy::RoundRobin;
        let mut funding = controller(config, &ledger, 3);
        funding.bootstrap(1_000).await.unwrap();

        let user = Account::generate_user();
        for _ in 0..3 {
            funding.faucet(&user.address, 1).await.unwrap();
        }
        let senders = ledger.senders.lock().unwrap();
        let runtime: Vec<_> = senders[3..].to_vec();
        assert_eq!(runtime.len(), 3);
        assert_ne!(runtime[0], runtime[1]);
        assert_ne!(runtime[1], runtime[2]);
        assert_ne!(runtime[0], runtime[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_bootstrap_cannot_be_repeated() {
        let ledger = Arc::new(Ledger::default());
        let mut funding = controller(TestnetConfig::new(1), &ledger, 1);
        ledger
            .failures
            .lock()
            .unwrap()
            .push_back(TestnetError::InvalidKey("bad".to_string()));

        assert!(funding.bootstrap(1_000).await.is_err());
        assert!(!funding.holds_root());
        let err = funding.bootstrap(1_000).await.unwrap_err();
        assert!(matches!(err, TestnetError::InvalidState { .. }));
    }
}
