// File: testnet/src/readiness.rs
//
// Readiness Monitor
//
// One round probes every validator concurrently, each probe bounded by its
// own timeout. The network is healthy when a whole round is. Status changes
// are logged once per transition; after the network has been healthy, a node
// dropping out is reported as a flap event rather than a return to starting.

use futures::future::join_all;
use log::{info, warn};
use std::fmt;
use std::mem::discriminant;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Duration;

use crate::api::NodeApi;
use crate::error::{TestnetError, TestnetResult};
use crate::orchestrator::{poll_until, Clock, PollSchedule, Probe};

/// Last observed status of one validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    /// Not probed yet.
    Pending,
    /// Answered with ledger info for the expected chain.
    Healthy { block_height: u64 },
    /// Answered, but not with a usable ledger.
    Unhealthy(String),
    /// No answer.
    Unreachable(String),
}

impl NodeStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, NodeStatus::Healthy { .. })
    }

    fn same_kind(&self, other: &NodeStatus) -> bool {
        discriminant(self) == discriminant(other)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Pending => f.write_str("pending"),
            NodeStatus::Healthy { block_height } => write!(f, "healthy (height {block_height})"),
            NodeStatus::Unhealthy(reason) => write!(f, "unhealthy ({reason})"),
            NodeStatus::Unreachable(reason) => write!(f, "unreachable ({reason})"),
        }
    }
}

/// Change observed after the network first became healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// A previously healthy node stopped answering correctly.
    Flapped { index: usize, status: NodeStatus },
    /// A flapped node is healthy again.
    Recovered { index: usize, block_height: u64 },
}

pub struct ReadinessMonitor {
    endpoints: Vec<(usize, Arc<dyn NodeApi>)>,
    chain_id: u8,
    schedule: PollSchedule,
    probe_timeout: Duration,
    clock: Arc<dyn Clock>,
    statuses: Mutex<Vec<NodeStatus>>,
    reached_healthy: AtomicBool,
}

impl ReadinessMonitor {
    pub fn new(
        endpoints: Vec<(usize, Arc<dyn NodeApi>)>,
        chain_id: u8,
        schedule: PollSchedule,
        probe_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let statuses = vec![NodeStatus::Pending; endpoints.len()];
        Self {
            endpoints,
            chain_id,
            schedule,
            probe_timeout,
            clock,
            statuses: Mutex::new(statuses),
            reached_healthy: AtomicBool::new(false),
        }
    }

    /// Per-validator status from the last completed round.
    pub fn statuses(&self) -> Vec<(usize, NodeStatus)> {
        self.endpoints
            .iter()
            .map(|(index, _)| *index)
            .zip(self.lock().iter().cloned())
            .collect()
    }

    /// Whether the network has been fully healthy at least once.
    pub fn reached_healthy(&self) -> bool {
        self.reached_healthy.load(Ordering::Acquire)
    }

    /// Polls until every validator is healthy; returns their block heights.
    pub async fn wait_until_healthy(&self) -> TestnetResult<Vec<u64>> {
        info!(
            "Waiting up to {:?} for {} validator(s) to become healthy",
            self.schedule.deadline,
            self.endpoints.len()
        );

        let outcome = poll_until(self.clock.as_ref(), self.schedule, || async move {
            let round = self.probe_round().await;
            self.record(&round);
            let heights: Option<Vec<u64>> = round
                .iter()
                .map(|status| match status {
                    NodeStatus::Healthy { block_height } => Some(*block_height),
                    _ => None,
                })
                .collect();
            match heights {
                Some(heights) => Probe::Ready(heights),
                None => Probe::Pending(round.iter().filter(|s| s.is_healthy()).count()),
            }
        })
        .await;

        match outcome {
            Ok(heights) => {
                self.reached_healthy.store(true, Ordering::Release);
                info!("All {} validators healthy", self.endpoints.len());
                Ok(heights)
            }
            Err(timeout) => {
                warn!(
                    "Readiness deadline expired after {} round(s), {} of {} healthy in the last one",
                    timeout.attempts,
                    timeout.last.unwrap_or_default(),
                    self.endpoints.len()
                );
                Err(TestnetError::HealthCheckTimeout {
                    elapsed: timeout.elapsed,
                    statuses: self.statuses(),
                })
            }
        }
    }

    /// Runs one round and reports flaps and recoveries since the last one.
    pub async fn observe(&self) -> Vec<HealthEvent> {
        let round = self.probe_round().await;
        let previous = self.record(&round);

        let mut events = Vec::new();
        for (((index, _), before), after) in self.endpoints.iter().zip(&previous).zip(round) {
            match (before.is_healthy(), &after) {
                (true, status) if !status.is_healthy() => {
                    warn!("validator-{} flapped: {}", index, status);
                    events.push(HealthEvent::Flapped {
                        index: *index,
                        status: status.clone(),
                    });
                }
                (false, NodeStatus::Healthy { block_height }) if self.reached_healthy() => {
                    info!("validator-{} recovered at height {}", index, block_height);
                    events.push(HealthEvent::Recovered {
                        index: *index,
                        block_height: *block_height,
                    });
                }
                _ => {}
            }
        }
        events
    }

    async fn probe_round(&self) -> Vec<NodeStatus> {
        join_all(
            self.endpoints
                .iter()
                .map(|(_, api)| probe(api.as_ref(), self.chain_id, self.probe_timeout)),
        )
        .await
    }

    /// Stores a round, logging transitions; returns the previous round.
    fn record(&self, round: &[NodeStatus]) -> Vec<NodeStatus> {
        let mut statuses = self.lock();
        for ((index, _), (before, after)) in self.endpoints.iter().zip(statuses.iter().zip(round)) {
            if !before.same_kind(after) {
                info!("validator-{}: {} -> {}", index, before, after);
            }
        }
        std::mem::replace(&mut *statuses, round.to_vec())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<NodeStatus>> {
        self.statuses.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn probe(api: &dyn NodeApi, chain_id: u8, limit: Duration) -> NodeStatus {
    match tokio::time::timeout(limit, api.ledger_info()).await {
        Err(_) => NodeStatus::Unreachable(format!("no answer within {limit:?}")),
        Ok(Err(TestnetError::Api { detail, .. })) if detail.starts_with("HTTP ") => {
            NodeStatus::Unhealthy(detail)
        }
        Ok(Err(TestnetError::Api { detail, .. })) => NodeStatus::Unreachable(detail),
        Ok(Err(e)) => NodeStatus::Unhealthy(e.to_string()),
        Ok(Ok(info)) if info.chain_id != chain_id => NodeStatus::Unhealthy(format!(
            "chain id {} (expected {chain_id})",
            info.chain_id
        )),
        Ok(Ok(info)) => NodeStatus::Healthy {
            block_height: info.block_height,
        },
    }
}
