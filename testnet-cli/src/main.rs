//! posnet - containerised proof-of-stake testnet controller
//!
//! # Usage
//!
//! ```bash
//! # Show names, addresses and ports for a 4-validator network
//! posnet plan --validators 4
//!
//! # Start, fund the validators once, and run until Ctrl-C
//! posnet up --validators 4 --bootstrap 10000000000
//!
//! # From another shell: query and fund against the running network
//! posnet status
//! posnet fund 0x2a 100000000
//!
//! # Stop whatever the work directory records, even after a crash
//! posnet down
//!
//! # Build the validator image locally, then run it
//! posnet build --profile release --tag local
//! posnet up --local-image
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use std::process::ExitCode;

use posnet_testnet::engine::BuildOptions;
use posnet_testnet::{
    AccountAddress, Testnet, TestnetConfig, TestnetState, Topology, TeardownReport,
};

/// Containerised proof-of-stake testnet controller
#[derive(Parser)]
#[command(name = "posnet")]
#[command(about = "Provision, run and fund a containerised PoS testnet")]
#[command(version)]
struct Cli {
    /// Configuration file (JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of validators
    #[arg(short = 'n', long)]
    validators: Option<usize>,

    /// Work directory for generated files
    #[arg(short, long)]
    work_dir: Option<PathBuf>,

    /// Validator image repository
    #[arg(long)]
    image: Option<String>,

    /// Validator image tag
    #[arg(long)]
    tag: Option<String>,

    /// Run the locally built image instead of pulling
    #[arg(long)]
    local_image: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the network topology without touching anything
    Plan {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Start the testnet and keep it running until Ctrl-C
    Up {
        /// Fund every validator with this amount from the root account
        #[arg(long)]
        bootstrap: Option<u64>,

        /// Capture container logs into the run directory
        #[arg(long)]
        follow_logs: bool,

        /// Take over the port range from a running testnet
        #[arg(long)]
        reclaim: bool,
    },
    /// Stop the testnet recorded in the work directory
    Down,
    /// Show the state and ledger of each validator
    Status,
    /// Transfer from a validator account to an address
    Fund {
        /// Recipient address (0x-prefixed hex)
        address: String,
        /// Amount in octas
        amount: u64,
    },
    /// Build the validator image locally
    Build {
        /// Cargo profile baked into the image
        #[arg(long)]
        profile: Option<String>,

        /// Cargo features baked into the image
        #[arg(long)]
        features: Option<String>,

        /// Image tag (defaults to the configured local tag)
        #[arg(long)]
        tag: Option<String>,

        #[arg(long)]
        no_cache: bool,

        /// Build context directory
        #[arg(long, default_value = ".")]
        context: PathBuf,

        /// Dockerfile path (defaults to <context>/Dockerfile)
        #[arg(short = 'f', long)]
        dockerfile: Option<PathBuf>,
    },
}

impl Cli {
    /// File, then `POSNET_*` environment, then flags.
    fn load_config(&self) -> Result<TestnetConfig> {
        let config = match &self.config {
            Some(path) => TestnetConfig::from_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => TestnetConfig::default(),
        };
        let mut config = config
            .apply_env_overrides()
            .context("Invalid POSNET_* environment override")?;

        if let Some(validators) = self.validators {
            config.validators = validators;
        }
        if let Some(work_dir) = &self.work_dir {
            config.work_dir = work_dir.clone();
        }
        if let Some(image) = &self.image {
            config.image_repository = image.clone();
        }
        if let Some(tag) = &self.tag {
            config.image_tag = tag.clone();
        }
        if self.local_image {
            config.use_local_image = true;
        }
        Ok(config)
    }
}

fn print_topology(topology: &Topology) {
    println!(
        "{:<14} {:<15} {:>6} {:>6} {:>8}",
        "VALIDATOR", "IP", "API", "P2P", "METRICS"
    );
    for slot in topology.slots() {
        println!(
            "{:<14} {:<15} {:>6} {:>6} {:>8}",
            slot.container_name, slot.ip, slot.api_port, slot.p2p_port, slot.metrics_port
        );
    }
}

fn print_report(report: &TeardownReport) {
    for warning in &report.warnings {
        warn!("{}", warning);
    }
    if report.is_clean() {
        println!("Testnet stopped");
    } else {
        println!("Testnet stopped with {} warning(s)", report.warnings.len());
    }
}

async fn up(config: TestnetConfig, bootstrap: Option<u64>) -> Result<()> {
    let mut testnet = Testnet::builder()
        .with_config(config)
        .build()
        .await
        .context("Failed to prepare testnet")?;
    testnet.start().await.context("Failed to start testnet")?;

    if let Some(amount) = bootstrap {
        if let Err(e) = testnet.bootstrap_validators(amount).await {
            print_report(&testnet.teardown().await);
            return Err(e).context("Failed to bootstrap validators");
        }
        info!("Every validator funded with {}", amount);
    }

    for (index, url) in testnet.validator_api_urls().iter().enumerate() {
        println!("validator-{index}: {url}");
    }
    println!("Testnet running; press Ctrl-C to stop");

    let report = testnet
        .teardown_on_signal()
        .await
        .context("Failed to wait for a shutdown signal")?;
    print_report(&report);
    Ok(())
}

async fn status(config: TestnetConfig) -> Result<()> {
    let testnet = Testnet::builder()
        .with_config(config)
        .attach()
        .await
        .context("No healthy testnet to report on")?;

    println!("state: {}", testnet.state());
    if let Some(genesis) = testnet.genesis() {
        println!("waypoint: {}", genesis.waypoint);
    }
    for index in 0..testnet.num_validators() {
        let url = testnet.validator_api_url(index)?;
        match testnet.get_ledger_info(index).await {
            Ok(ledger) => println!(
                "validator-{index} {url} chain {} epoch {} height {} version {}",
                ledger.chain_id, ledger.epoch, ledger.block_height, ledger.ledger_version
            ),
            Err(e) => println!("validator-{index} {url} unreachable: {e}"),
        }
    }
    Ok(())
}

async fn fund(config: TestnetConfig, address: &str, amount: u64) -> Result<()> {
    let recipient: AccountAddress = address
        .parse()
        .with_context(|| format!("'{address}' is not an account address"))?;
    let mut testnet = Testnet::builder()
        .with_config(config)
        .attach()
        .await
        .context("No healthy testnet to fund from")?;
    if testnet.state() != &TestnetState::Bootstrapped {
        bail!("validators have not been bootstrapped; start with `posnet up --bootstrap <amount>`");
    }

    let hash = testnet
        .faucet(&recipient, amount)
        .await
        .with_context(|| format!("Failed to fund {recipient}"))?;
    let balance = testnet.account_balance(&recipient).await?;
    println!("{hash}");
    info!("{} now holds {}", recipient, balance);
    Ok(())
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    match cli.command {
        Commands::Plan { json } => {
            config.validate()?;
            let topology = Topology::plan_with(config.ports, config.validators)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&topology)?);
            } else {
                print_topology(&topology);
            }
        }
        Commands::Up {
            bootstrap,
            follow_logs,
            reclaim,
        } => {
            let mut config = config;
            config.follow_logs |= follow_logs;
            if reclaim {
                config.live_instance_policy = posnet_testnet::LiveInstancePolicy::Reclaim;
            }
            up(config, bootstrap).await?;
        }
        Commands::Down => {
            let report = Testnet::down(config).await.context("Failed to stop testnet")?;
            print_report(&report);
        }
        Commands::Status => status(config).await?,
        Commands::Fund { address, amount } => fund(config, &address, amount).await?,
        Commands::Build {
            profile,
            features,
            tag,
            no_cache,
            context,
            dockerfile,
        } => {
            let options = BuildOptions {
                profile,
                features,
                tag,
                no_cache,
                context,
                dockerfile,
            };
            let image = Testnet::build_local_image(&config, &options)
                .await
                .context("Failed to build the validator image")?;
            println!("{image}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
