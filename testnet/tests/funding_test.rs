//! Two-phase funding: one root bootstrap, then validator-signed faucet
//! transfers.

mod common;

use common::{init_logging, test_config, work_dir, FakeToolkit, MockChain, MockEngine, QuietPorts};
use posnet_testnet::identity::AccountAddress;
use posnet_testnet::prelude::*;
use posnet_testnet::FaucetPolicy;
use tokio::time::Duration;

const BOOTSTRAP_AMOUNT: u64 = 10_000_000_000;
const USER_AMOUNT: u64 = 100_000_000;

struct Harness {
    engine: Arc<MockEngine>,
    chain: Arc<MockChain>,
}

impl Harness {
    fn new() -> Self {
        Self {
            engine: MockEngine::new(),
            chain: MockChain::new(),
        }
    }

    fn builder(&self, config: TestnetConfig) -> TestnetBuilder {
        Testnet::builder()
            .with_config(config)
            .with_engine(Arc::clone(&self.engine) as Arc<dyn ContainerEngine>)
            .with_toolkit(FakeToolkit::new())
            .with_api_connector(self.chain.connector())
            .with_port_inspector(Arc::new(QuietPorts))
            .with_clock(Arc::new(PausedClock::new()))
    }

    async fn start(&self, config: TestnetConfig) -> Testnet {
        let mut testnet = self.builder(config).build().await.unwrap();
        testnet.start().await.unwrap();
        testnet
    }
}

#[tokio::test(start_paused = true)]
async fn test_faucet_funds_user_from_a_validator() {
    init_logging();
    let temp = work_dir();
    let harness = Harness::new();
    let mut testnet = harness.start(test_config(4, temp.path())).await;
    assert_eq!(testnet.config().faucet_policy, FaucetPolicy::Fixed { validator: 0 });

    let hashes = testnet.bootstrap_validators(BOOTSTRAP_AMOUNT).await.unwrap();
    assert_eq!(hashes.len(), 4);
    assert_eq!(testnet.state(), &TestnetState::Bootstrapped);

    let user = Account::generate_user();
    testnet.faucet(&user.address, USER_AMOUNT).await.unwrap();
    assert_eq!(testnet.account_balance(&user.address).await.unwrap(), USER_AMOUNT);

    let validators: Vec<AccountAddress> = (0..4)
        .map(|i| testnet.validator_account(i).unwrap().address)
        .collect();
    let to_user: Vec<_> = harness
        .chain
        .transfers()
        .into_iter()
        .filter(|t| t.recipient == user.address)
        .collect();
    assert_eq!(to_user.len(), 1);
    assert!(validators.contains(&to_user[0].sender), "faucet must sign with a validator");
    assert_eq!(
        harness.chain.balance(&to_user[0].sender),
        BOOTSTRAP_AMOUNT - USER_AMOUNT
    );

    testnet.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_root_account_is_used_exactly_once() {
    let temp = work_dir();
    let harness = Harness::new();
    let mut testnet = harness.start(test_config(3, temp.path())).await;

    testnet.bootstrap_validators(BOOTSTRAP_AMOUNT).await.unwrap();
    // A second bootstrap is a no-op, not a second root spend.
    assert!(testnet.bootstrap_validators(BOOTSTRAP_AMOUNT).await.unwrap().is_empty());

    for _ in 0..5 {
        let user = Account::generate_user();
        testnet.faucet(&user.address, USER_AMOUNT).await.unwrap();
    }

    let from_root = harness.chain.transfers_from(&AccountAddress::CORE_RESOURCES);
    assert_eq!(from_root.len(), 3, "one bootstrap transfer per validator");
    for index in 0..3 {
        let validator = testnet.validator_account(index).unwrap().address;
        assert_eq!(
            from_root.iter().filter(|t| t.recipient == validator).count(),
            1
        );
    }

    testnet.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_round_robin_spreads_faucet_load() {
    let temp = work_dir();
    let harness = Harness::new();
    let mut config = test_config(3, temp.path());
    config.faucet_policy = FaucetPolicy::RoundRobin;
    let mut testnet = harness.start(config).await;
    testnet.bootstrap_validators(BOOTSTRAP_AMOUNT).await.unwrap();

    for _ in 0..6 {
        testnet
            .faucet(&Account::generate_user().address, USER_AMOUNT)
            .await
            .unwrap();
    }
    for index in 0..3 {
        let validator = testnet.validator_account(index).unwrap().address;
        assert_eq!(harness.chain.transfers_from(&validator).len(), 2);
    }

    testnet.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_fixed_policy_always_uses_one_validator() {
    let temp = work_dir();
    let harness = Harness::new();
    let mut config = test_config(3, temp.path());
    config.faucet_policy = FaucetPolicy::Fixed { validator: 2 };
    let mut testnet = harness.start(config).await;
    testnet.bootstrap_validators(BOOTSTRAP_AMOUNT).await.unwrap();

    for _ in 0..3 {
        testnet
            .faucet(&Account::generate_user().address, USER_AMOUNT)
            .await
            .unwrap();
    }
    let fixed = testnet.validator_account(2).unwrap().address;
    assert_eq!(harness.chain.transfers_from(&fixed).len(), 3);

    testnet.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_faucet_before_bootstrap_is_rejected() {
    let temp = work_dir();
    let harness = Harness::new();
    let mut testnet = harness.start(test_config(2, temp.path())).await;

    let user = Account::generate_user();
    assert!(matches!(
        testnet.faucet(&user.address, USER_AMOUNT).await,
        Err(TestnetError::InvalidState { .. })
    ));
    assert!(harness.chain.transfers().is_empty());

    testnet.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_requires_a_healthy_network() {
    let temp = work_dir();
    let harness = Harness::new();
    let mut testnet = harness.builder(test_config(2, temp.path())).build().await.unwrap();

    assert!(matches!(
        testnet.bootstrap_validators(BOOTSTRAP_AMOUNT).await,
        Err(TestnetError::InvalidState { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_faucet_retries_through_a_syncing_node() {
    let temp = work_dir();
    let harness = Harness::new();
    let mut testnet = harness.start(test_config(2, temp.path())).await;
    testnet.bootstrap_validators(BOOTSTRAP_AMOUNT).await.unwrap();

    harness.chain.fail_next_submissions(2);
    let user = Account::generate_user();
    testnet.faucet(&user.address, USER_AMOUNT).await.unwrap();
    assert_eq!(harness.chain.balance(&user.address), USER_AMOUNT);

    testnet.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_commit_funds_the_recipient_once() {
    let temp = work_dir();
    let harness = Harness::new();
    let mut testnet = harness.start(test_config(2, temp.path())).await;
    testnet.bootstrap_validators(BOOTSTRAP_AMOUNT).await.unwrap();

    // Commits land half a second after the 5s finality deadline.
    harness.chain.delay_commits(Duration::from_millis(5_500));
    let user = Account::generate_user();
    testnet.faucet(&user.address, USER_AMOUNT).await.unwrap();

    assert_eq!(testnet.account_balance(&user.address).await.unwrap(), USER_AMOUNT);
    let to_user = harness
        .chain
        .transfers()
        .into_iter()
        .filter(|t| t.recipient == user.address)
        .count();
    assert_eq!(to_user, 1);

    testnet.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_overdrawn_faucet_reports_every_attempt() {
    let temp = work_dir();
    let harness = Harness::new();
    let mut config = test_config(1, temp.path());
    config.funding_retries = 2;
    let mut testnet = harness.start(config).await;
    testnet.bootstrap_validators(USER_AMOUNT).await.unwrap();

    let user = Account::generate_user();
    match testnet.faucet(&user.address, USER_AMOUNT * 2).await {
        Err(TestnetError::FundingFailed { recipient, amount, attempts, .. }) => {
            assert_eq!(recipient, user.address.to_string());
            assert_eq!(amount, USER_AMOUNT * 2);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected a funding failure, got {:?}", other.err()),
    }
    assert_eq!(harness.chain.balance(&user.address), 0);

    testnet.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_attach_resumes_after_bootstrap() {
    let temp = work_dir();
    let harness = Harness::new();
    let config = test_config(2, temp.path());
    let mut owner = harness.start(config.clone()).await;
    owner.bootstrap_validators(BOOTSTRAP_AMOUNT).await.unwrap();

    let mut attached = harness.builder(config.clone()).attach().await.unwrap();
    assert_eq!(attached.state(), &TestnetState::Bootstrapped);
    assert_eq!(attached.genesis().unwrap().digest(), owner.genesis().unwrap().digest());

    let user = Account::generate_user();
    attached.faucet(&user.address, USER_AMOUNT).await.unwrap();
    assert_eq!(owner.account_balance(&user.address).await.unwrap(), USER_AMOUNT);
    assert_eq!(
        harness.chain.transfers_from(&AccountAddress::CORE_RESOURCES).len(),
        2
    );

    // Dropping an attached handle leaves the owner's containers alone.
    drop(attached);
    assert_eq!(harness.engine.count("down-blocking posnet-test"), 0);

    owner.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_attach_without_a_running_testnet_fails() {
    let temp = work_dir();
    let harness = Harness::new();
    let result = harness.builder(test_config(2, temp.path())).attach().await;
    assert!(matches!(result, Err(TestnetError::InvalidState { .. })));
}
