//! # posnet - containerised proof-of-stake testnet controller
//!
//! Provisions, boots, monitors and tears down a multi-validator test network
//! running in containers, and funds test accounts the way a real network
//! would.
//!
//! ## Architecture Overview
//!
//! - **topology**: validator count to names, IPs and ports (pure)
//! - **genesis**: key triples, one shared genesis, per-node configs
//! - **manifest**: compose file and `.env` rendering
//! - **lifecycle**: container engine, run marker, zombie reclamation
//! - **readiness**: concurrent, deadline-bounded health rounds
//! - **funding**: one-time root bootstrap, then validator-signed transfers
//! - **testnet**: the [`Testnet`] handle tying it all together
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use posnet_testnet::prelude::*;
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn test_funded_account() {
//!     let mut testnet = Testnet::new(4).await.unwrap();
//!     testnet.bootstrap_validators(10_000_000_000).await.unwrap();
//!
//!     let user = Account::generate_user();
//!     testnet.faucet(&user.address, 100_000_000).await.unwrap();
//!     assert_eq!(testnet.account_balance(&user.address).await.unwrap(), 100_000_000);
//!
//!     testnet.teardown().await;
//! }
//! ```
//!
//! ## Funding Model
//!
//! The genesis root account funds each validator exactly once
//! ([`Testnet::bootstrap_validators`]). Every later transfer
//! ([`Testnet::faucet`]) is an ordinary transaction signed by a validator, so
//! tests never depend on minting that a real network would not offer.
//!
//! Test suites using the controller must not run concurrently against the
//! same port range; a second instance fails fast (or reclaims the range when
//! `live_instance_policy` says so).

#![warn(clippy::all)]

/// Node REST API seam and reqwest client
pub mod api;
pub mod config;
/// Container engine seam, docker CLI driver and scoped processes
pub mod engine;
pub mod error;
pub mod funding;
pub mod genesis;
pub mod identity;
pub mod lifecycle;
pub mod manifest;
/// Clock and deadline-bounded polling
pub mod orchestrator;
pub mod readiness;
pub mod state;
pub mod testnet;
pub mod topology;
pub mod workspace;

pub use config::{FaucetPolicy, LiveInstancePolicy, NodeCliMode, RegistryAuth, TestnetConfig};
pub use error::{GenesisStep, ImageRemedy, TestnetError, TestnetResult};
pub use identity::{Account, AccountAddress, AccountRole};
pub use lifecycle::{TeardownReport, TeardownWarning};
pub use state::TestnetState;
pub use testnet::{Testnet, TestnetBuilder};
pub use topology::{NodeSlot, PortScheme, Topology};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convenient re-exports for tests driving a testnet
pub mod prelude {
    pub use crate::api::{ApiConnector, LedgerInfo, NodeApi, TransactionStatus};
    pub use crate::config::{FaucetPolicy, TestnetConfig};
    pub use crate::engine::{BuildOptions, ContainerEngine, ImageRef};
    pub use crate::error::{TestnetError, TestnetResult};
    pub use crate::genesis::{GenesisArtifact, GenesisToolkit};
    pub use crate::identity::{Account, AccountAddress, AccountRole};
    pub use crate::lifecycle::{PortInspector, TeardownReport};
    pub use crate::orchestrator::{Clock, PausedClock, SystemClock};
    pub use crate::readiness::{HealthEvent, NodeStatus};
    pub use crate::state::TestnetState;
    pub use crate::testnet::{Testnet, TestnetBuilder};
    pub use crate::topology::Topology;
    pub use std::sync::Arc;
}
