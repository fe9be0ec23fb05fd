// File: testnet/src/testnet.rs
//
// Testnet Handle
//
// The public façade. A `Testnet` owns one topology, its genesis, its
// containers and the funding controller, and is the single writer of the
// lifecycle state:
//
//   build()     Unconfigured -> GenesisGenerated   (genesis + manifest)
//   start()     GenesisGenerated -> Starting -> Healthy
//   bootstrap   Healthy -> Bootstrapped
//   teardown()  any -> TornDown
//
// Dropping a handle that was never torn down stops its containers
// synchronously.

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::time::Duration;

use crate::api::{ApiConnector, LedgerInfo, NodeApi, RestConnector};
use crate::config::TestnetConfig;
use crate::engine::{BuildOptions, ContainerEngine, DockerCli, ImageRef};
use crate::error::{TestnetError, TestnetResult};
use crate::funding::{FundingController, FundingSource};
use crate::genesis::{GenesisArtifact, GenesisGenerator, GenesisToolkit, NodeCliToolkit};
use crate::identity::{Account, AccountAddress, RootAccount, ValidatorIdentity};
use crate::lifecycle::{
    shutdown_signal, LifecycleController, LsofInspector, MarkerStatus, PortInspector, RunMarker,
    TeardownReport,
};
use crate::manifest::ComposeManifest;
use crate::orchestrator::{poll_until, Clock, PollSchedule, Probe, SystemClock};
use crate::readiness::{HealthEvent, ReadinessMonitor};
use crate::state::TestnetState;
use crate::topology::Topology;
use crate::workspace::WorkDir;

const BLOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Builder for [`Testnet`] handles
///
/// Every external collaborator (container engine, node CLI, REST API, port
/// inspection, time) can be replaced; the defaults drive the real tools.
///
/// # Example
///
/// ```rust,ignore
/// use posnet_testnet::prelude::*;
///
/// let mut testnet = Testnet::builder()
///     .with_validators(4)
///     .build()
///     .await?;
/// testnet.start().await?;
/// ```
pub struct TestnetBuilder {
    config: TestnetConfig,
    engine: Option<Arc<dyn ContainerEngine>>,
    toolkit: Option<Arc<dyn GenesisToolkit>>,
    connector: Option<Arc<dyn ApiConnector>>,
    inspector: Option<Arc<dyn PortInspector>>,
    clock: Option<Arc<dyn Clock>>,
}

impl TestnetBuilder {
    /// Builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: TestnetConfig::default(),
            engine: None,
            toolkit: None,
            connector: None,
            inspector: None,
            clock: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn with_config(mut self, config: TestnetConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_validators(mut self, validators: usize) -> Self {
        self.config.validators = validators;
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn ContainerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_toolkit(mut self, toolkit: Arc<dyn GenesisToolkit>) -> Self {
        self.toolkit = Some(toolkit);
        self
    }

    pub fn with_api_connector(mut self, connector: Arc<dyn ApiConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_port_inspector(mut self, inspector: Arc<dyn PortInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    /// Set clock implementation
    ///
    /// If not set, uses `SystemClock` by default.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn into_parts(self) -> TestnetResult<Testnet> {
        self.config.validate()?;
        let topology = Topology::plan_with(self.config.ports, self.config.validators)?;

        let engine = self.engine.unwrap_or_else(|| {
            Arc::new(DockerCli::new(
                &self.config.engine,
                self.config.engine_command_timeout(),
                self.config.grace_period(),
            ))
        });
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(RestConnector::default()));
        let inspector = self.inspector.unwrap_or_else(|| Arc::new(LsofInspector));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let toolkit = self
            .toolkit
            .unwrap_or_else(|| Arc::new(NodeCliToolkit::new(&self.config)));

        let apis = topology
            .slots()
            .iter()
            .map(|slot| connector.connect(&slot.api_url()))
            .collect::<TestnetResult<Vec<_>>>()?;

        let lifecycle = LifecycleController::new(
            &self.config,
            &topology,
            Arc::clone(&engine),
            inspector,
            Arc::clone(&clock),
        );

        Ok(Testnet {
            work_dir: WorkDir::new(&self.config.work_dir),
            config: self.config,
            topology,
            state: TestnetState::Unconfigured,
            genesis: None,
            lifecycle,
            engine,
            toolkit,
            apis,
            readiness: None,
            funding: None,
            clock,
            attached: false,
        })
    }

    /// Validates the configuration, generates genesis and writes the compose
    /// manifest. No container is started.
    ///
    /// Fails with a configuration error on `live_instance_policy` when another
    /// live testnet owns the work directory, unless the policy reclaims it.
    pub async fn build(self) -> TestnetResult<Testnet> {
        let mut testnet = self.into_parts()?;
        testnet.materialize().await?;
        Ok(testnet)
    }

    /// Handle on the live testnet recorded in the work directory.
    ///
    /// Nothing is regenerated; the genesis and keys on disk are read back.
    /// Dropping an attached handle leaves the containers running, while
    /// `teardown()` stops them.
    pub async fn attach(self) -> TestnetResult<Testnet> {
        let mut testnet = self.into_parts()?;
        let marker = match RunMarker::inspect(&testnet.work_dir.run_marker())? {
            MarkerStatus::Live(marker) => marker,
            MarkerStatus::Stale(marker) => {
                return Err(TestnetError::InvalidState {
                    operation: "attach",
                    state: format!(
                        "stale: testnet {} (pid {}) exited without teardown",
                        marker.instance_id, marker.pid
                    ),
                })
            }
            MarkerStatus::Absent => {
                return Err(TestnetError::InvalidState {
                    operation: "attach",
                    state: format!("not running in {}", testnet.work_dir.root().display()),
                })
            }
        };

        testnet.genesis = Some(GenesisArtifact::load(&testnet.config, &testnet.topology)?);
        testnet.lifecycle.adopt(&marker);
        testnet.attached = true;
        testnet.state = TestnetState::Starting;
        info!("Attached to testnet {} (pid {})", marker.instance_id, marker.pid);

        testnet.await_healthy().await?;
        let sources = testnet.funding_sources()?;
        if marker.bootstrapped_at.is_some() {
            testnet.funding = Some(FundingController::resume_bootstrapped(
                &testnet.config,
                sources,
                Arc::clone(&testnet.clock),
            ));
            testnet.state.transition(TestnetState::Bootstrapped)?;
        } else {
            let root = RootAccount::load(&testnet.work_dir.root_keys_file())?;
            testnet.funding = Some(FundingController::new(
                &testnet.config,
                root,
                sources,
                Arc::clone(&testnet.clock),
            ));
        }
        Ok(testnet)
    }

    /// Tears down whatever testnet the work directory records, live or
    /// crashed, without generating anything.
    pub async fn down(self) -> TestnetResult<TeardownReport> {
        let mut testnet = self.into_parts()?;
        if let Some(marker) = RunMarker::read(&testnet.work_dir.run_marker())? {
            testnet.lifecycle.adopt(&marker);
        }
        Ok(testnet.teardown().await)
    }
}

impl Default for TestnetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A containerised proof-of-stake testnet.
pub struct Testnet {
    config: TestnetConfig,
    topology: Topology,
    work_dir: WorkDir,
    state: TestnetState,
    genesis: Option<GenesisArtifact>,
    lifecycle: LifecycleController,
    engine: Arc<dyn ContainerEngine>,
    toolkit: Arc<dyn GenesisToolkit>,
    apis: Vec<Arc<dyn NodeApi>>,
    readiness: Option<ReadinessMonitor>,
    funding: Option<FundingController>,
    clock: Arc<dyn Clock>,
    attached: bool,
}

impl Testnet {
    pub fn builder() -> TestnetBuilder {
        TestnetBuilder::new()
    }

    /// Starts an `n`-validator testnet and waits until every validator is
    /// healthy.
    ///
    /// The default configuration is used, with `POSNET_*` environment
    /// overrides applied. Anything already started is torn down again when
    /// a step fails.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let mut testnet = Testnet::new(4).await?;
    /// testnet.wait_for_blocks(1, 60).await?;
    /// testnet.teardown().await;
    /// ```
    pub async fn new(validators: usize) -> TestnetResult<Self> {
        let config = TestnetConfig::new(validators).apply_env_overrides()?;
        Self::from_config(config).await
    }

    /// Like [`Testnet::new`] with an explicit configuration.
    pub async fn from_config(config: TestnetConfig) -> TestnetResult<Self> {
        let mut testnet = TestnetBuilder::new().with_config(config).build().await?;
        testnet.start().await?;
        Ok(testnet)
    }

    /// Builds the validator image locally with BuildKit.
    ///
    /// The image is tagged `<image_repository>:<tag>`, where the tag defaults
    /// to `local_image_tag`; start with `use_local_image` to run it.
    pub async fn build_local_image(
        config: &TestnetConfig,
        options: &BuildOptions,
    ) -> TestnetResult<ImageRef> {
        let engine = DockerCli::new(&config.engine, config.engine_command_timeout(), config.grace_period());
        Self::build_local_image_with(&engine, config, options).await
    }

    /// [`Testnet::build_local_image`] through a given engine.
    pub async fn build_local_image_with(
        engine: &dyn ContainerEngine,
        config: &TestnetConfig,
        options: &BuildOptions,
    ) -> TestnetResult<ImageRef> {
        let tag = options
            .tag
            .clone()
            .unwrap_or_else(|| config.local_image_tag.clone());
        let image = ImageRef::new(&config.image_repository, tag);
        engine.ping().await?;
        info!("Building {} from {}", image, options.context.display());
        engine.build_image(&image, options).await?;
        info!("Built {}", image);
        Ok(image)
    }

    /// Stops whatever testnet the work directory records, live or crashed.
    pub async fn down(config: TestnetConfig) -> TestnetResult<TeardownReport> {
        TestnetBuilder::new().with_config(config).down().await
    }

    async fn materialize(&mut self) -> TestnetResult<()> {
        self.require("generate genesis", &[TestnetState::Unconfigured])?;

        // Regenerating genesis under a live testnet would pull its keys away.
        let claimed = self.lifecycle.claim_port_range().await;
        self.fail_on_error(claimed)?;

        let generated = GenesisGenerator::new(&self.config, &self.topology, self.toolkit.as_ref())
            .generate()
            .await;
        let genesis = self.fail_on_error(generated)?;
        let manifest = ComposeManifest::render(&self.config, &self.topology);
        self.fail_on_error(manifest.materialize(&self.work_dir))?;

        self.genesis = Some(genesis);
        self.state.transition(TestnetState::GenesisGenerated)
    }

    /// Starts the containers and waits for readiness.
    ///
    /// On failure the state becomes `Failed` and the containers are stopped.
    pub async fn start(&mut self) -> TestnetResult<()> {
        self.require("start", &[TestnetState::GenesisGenerated])?;
        self.state.transition(TestnetState::Starting)?;

        let result = async {
            self.lifecycle.start().await?;
            self.await_healthy().await?;
            let root = RootAccount::load(&self.work_dir.root_keys_file())?;
            self.funding = Some(FundingController::new(
                &self.config,
                root,
                self.funding_sources()?,
                Arc::clone(&self.clock),
            ));
            Ok::<(), TestnetError>(())
        }
        .await;

        if let Err(e) = result {
            error!("Testnet failed to start: {}", e);
            self.state = TestnetState::Failed(e.to_string());
            let report = self.lifecycle.stop().await;
            if !report.is_clean() {
                warn!("Cleanup after failed start left {} warning(s)", report.warnings.len());
            }
            return Err(e);
        }
        Ok(())
    }

    async fn await_healthy(&mut self) -> TestnetResult<()> {
        let monitor = ReadinessMonitor::new(
            self.apis.iter().cloned().enumerate().collect(),
            self.config.chain_id,
            self.config.readiness_schedule(),
            self.config.probe_timeout(),
            Arc::clone(&self.clock),
        );
        monitor.wait_until_healthy().await?;
        self.readiness = Some(monitor);
        self.state.transition(TestnetState::Healthy)
    }

    /// Funds every validator from the genesis root account, once.
    ///
    /// Later calls return no hashes. The root account cannot be used again
    /// afterwards, whatever the outcome.
    pub async fn bootstrap_validators(&mut self, amount_per_validator: u64) -> TestnetResult<Vec<String>> {
        if self.state == TestnetState::Bootstrapped {
            info!("Validators already bootstrapped, skipping");
            return Ok(Vec::new());
        }
        self.require("bootstrap validators", &[TestnetState::Healthy])?;

        let result = match self.funding.as_mut() {
            Some(funding) => funding.bootstrap(amount_per_validator).await,
            None => Err(TestnetError::InvalidState {
                operation: "bootstrap validators",
                state: "without a funding controller".to_string(),
            }),
        };
        let hashes = self.fail_on_error(result)?;

        if let Err(e) = self.lifecycle.record_bootstrap() {
            warn!("Could not record bootstrap in run marker: {}", e);
        }
        self.state.transition(TestnetState::Bootstrapped)?;
        Ok(hashes)
    }

    /// Sends `amount` to `recipient` from a validator account and returns the
    /// transaction hash once the transfer is final.
    pub async fn faucet(&mut self, recipient: &AccountAddress, amount: u64) -> TestnetResult<String> {
        self.require("fund accounts", &[TestnetState::Bootstrapped])?;
        match self.funding.as_mut() {
            Some(funding) => funding.faucet(recipient, amount).await,
            None => Err(TestnetError::InvalidState {
                operation: "fund accounts",
                state: "without a funding controller".to_string(),
            }),
        }
    }

    /// Balance of `address` as seen by validator 0.
    pub async fn account_balance(&self, address: &AccountAddress) -> TestnetResult<u64> {
        self.require_running("query balances")?;
        self.api(0)?.account_balance(address).await
    }

    /// Group public key for timelock encryption, read from validator 0's
    /// on-chain DKG state.
    pub async fn get_validator_group_pubkey(&self) -> TestnetResult<String> {
        self.require_running("query the validator group key")?;
        self.api(0)?.validator_group_pubkey().await
    }

    pub fn validator_api_url(&self, index: usize) -> TestnetResult<String> {
        Ok(self.topology.slot(index)?.api_url())
    }

    pub fn validator_api_urls(&self) -> Vec<String> {
        self.topology.slots().iter().map(|slot| slot.api_url()).collect()
    }

    pub async fn get_ledger_info(&self, index: usize) -> TestnetResult<LedgerInfo> {
        self.api(index)?.ledger_info().await
    }

    /// Waits until every validator is `blocks` blocks past validator 0's
    /// current height. Returns the heights that satisfied the wait.
    pub async fn wait_for_blocks(&self, blocks: u64, timeout_secs: u64) -> TestnetResult<Vec<u64>> {
        self.require_running("wait for blocks")?;
        let start = self.get_ledger_info(0).await?.block_height;
        let target = start.saturating_add(blocks);
        info!("Waiting for {} block(s), height {} -> {}", blocks, start, target);

        let schedule = PollSchedule::new(BLOCK_POLL_INTERVAL, Duration::from_secs(timeout_secs));
        let apis = &self.apis;
        let heights = poll_until(self.clock.as_ref(), schedule, || async move {
            let infos = futures::future::join_all(apis.iter().map(|api| api.ledger_info())).await;
            let heights: Vec<u64> = infos
                .into_iter()
                .map(|info| info.map(|info| info.block_height).unwrap_or(0))
                .collect();
            if heights.iter().all(|height| *height >= target) {
                Probe::Ready(heights)
            } else {
                Probe::Pending(heights)
            }
        })
        .await
        .map_err(|timeout| {
            if let Some(last) = &timeout.last {
                debug!("Heights when the block wait expired: {:?}", last);
            }
            timeout.into_error(format!("block height {target} on every validator"))
        })?;

        info!("Reached height {} on every validator", target);
        Ok(heights)
    }

    /// One readiness round after startup; flaps are reported, not fatal.
    pub async fn check_health(&self) -> TestnetResult<Vec<HealthEvent>> {
        self.require_running("check health")?;
        match &self.readiness {
            Some(monitor) => Ok(monitor.observe().await),
            None => Ok(Vec::new()),
        }
    }

    /// Stops containers, log capture and squatting processes and releases
    /// the run marker. Never fails; problems are reported as warnings.
    /// Calling it again is a no-op.
    pub async fn teardown(&mut self) -> TeardownReport {
        if self.state == TestnetState::TornDown {
            return TeardownReport::default();
        }
        info!("Tearing down testnet ({})", self.state);
        // The root key goes with the funding controller.
        self.funding = None;
        self.readiness = None;
        let report = self.lifecycle.stop().await;
        self.state = TestnetState::TornDown;
        if report.is_clean() {
            info!("Testnet stopped");
        } else {
            warn!("Testnet stopped with {} warning(s)", report.warnings.len());
        }
        report
    }

    /// Waits for Ctrl-C or SIGTERM, then tears down.
    pub async fn teardown_on_signal(mut self) -> TestnetResult<TeardownReport> {
        shutdown_signal().await?;
        info!("Shutdown signal received");
        Ok(self.teardown().await)
    }

    /// Validator `index` as a funding account, read from its key files.
    pub fn validator_account(&self, index: usize) -> TestnetResult<Account> {
        let slot = self.topology.slot(index)?;
        Ok(ValidatorIdentity::load(slot.index, &self.work_dir.validator_dir(slot.index))?.account())
    }

    pub fn num_validators(&self) -> usize {
        self.topology.len()
    }

    pub fn state(&self) -> &TestnetState {
        &self.state
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn genesis(&self) -> Option<&GenesisArtifact> {
        self.genesis.as_ref()
    }

    pub fn config(&self) -> &TestnetConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    fn funding_sources(&self) -> TestnetResult<Vec<FundingSource>> {
        self.topology
            .slots()
            .iter()
            .map(|slot| {
                Ok(FundingSource {
                    account: self.validator_account(slot.index)?,
                    api: Arc::clone(self.api(slot.index)?),
                })
            })
            .collect()
    }

    fn api(&self, index: usize) -> TestnetResult<&Arc<dyn NodeApi>> {
        self.apis
            .get(index)
            .ok_or(TestnetError::ValidatorIndexOutOfRange {
                index,
                count: self.apis.len(),
            })
    }

    fn require(&self, operation: &'static str, allowed: &[TestnetState]) -> TestnetResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(TestnetError::InvalidState {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    fn require_running(&self, operation: &'static str) -> TestnetResult<()> {
        self.require(operation, &[TestnetState::Healthy, TestnetState::Bootstrapped])
    }

    /// Records a fatal error as `Failed` before handing it back.
    fn fail_on_error<T>(&mut self, result: TestnetResult<T>) -> TestnetResult<T> {
        if let Err(e) = &result {
            self.state = TestnetState::Failed(e.to_string());
        }
        result
    }
}

impl Drop for Testnet {
    fn drop(&mut self) {
        if self.attached || self.state == TestnetState::TornDown {
            return;
        }
        if self.lifecycle.running().is_none() {
            return;
        }
        warn!("Testnet dropped without teardown, stopping containers");
        let report = self.lifecycle.stop_blocking();
        for warning in &report.warnings {
            warn!("Teardown on drop: {}", warning);
        }
    }
}
