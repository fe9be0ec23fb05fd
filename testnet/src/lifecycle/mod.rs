// File: testnet/src/lifecycle/mod.rs
//
// Lifecycle Controller
//
// Owns everything with a host side effect: the compose project, the run
// marker, the log follower and zombie reclamation.
//
//   start: claim port range -> pre-flight -> reap -> down (prior instance)
//          -> marker -> up -> log follower
//   stop:  log follower -> down -> marker -> reap; never fails

pub mod reaper;
pub mod run_marker;

pub use reaper::{LsofInspector, PortInspector, ReapReport, ZombieReaper};
pub use run_marker::{MarkerStatus, RunMarker};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{LiveInstancePolicy, TestnetConfig};
use crate::engine::{ComposeProject, ContainerEngine, EngineErrorKind, ImageRef, ScopedProcess};
use crate::error::{ImageRemedy, TestnetError, TestnetResult};
use crate::orchestrator::Clock;
use crate::topology::Topology;
use crate::workspace::WorkDir;

const CONTAINER_LOG_FILE: &str = "containers.log";

/// A teardown step that failed. Logged and reported, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownWarning {
    pub step: String,
    pub detail: String,
}

impl TeardownWarning {
    pub fn new(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for TeardownWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.detail)
    }
}

/// Everything that went wrong during a teardown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub warnings: Vec<TeardownWarning>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warn(&mut self, warning: TeardownWarning) {
        warn!("Teardown warning: {}", warning);
        self.warnings.push(warning);
    }
}

/// A started compose project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningTestnet {
    pub instance_id: String,
    /// Per-run scratch directory (container logs).
    pub scratch_dir: PathBuf,
    pub started_at: DateTime<Utc>,
}

fn new_instance_id() -> String {
    format!(
        "{}-{:08x}",
        Utc::now().format("%Y%m%d%H%M%S"),
        rand::random::<u32>()
    )
}

pub struct LifecycleController {
    config: TestnetConfig,
    engine: Arc<dyn ContainerEngine>,
    reaper: ZombieReaper,
    work_dir: WorkDir,
    project: ComposeProject,
    ports: Vec<u16>,
    running: Option<RunningTestnet>,
    log_follower: Option<ScopedProcess>,
}

impl LifecycleController {
    pub fn new(
        config: &TestnetConfig,
        topology: &Topology,
        engine: Arc<dyn ContainerEngine>,
        inspector: Arc<dyn PortInspector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let work_dir = WorkDir::new(&config.work_dir);
        let project = ComposeProject::new(&config.project_name, &work_dir);
        Self {
            reaper: ZombieReaper::new(inspector, clock, config.grace_period()),
            config: config.clone(),
            engine,
            work_dir,
            project,
            ports: topology.host_ports(),
            running: None,
            log_follower: None,
        }
    }

    pub fn project(&self) -> &ComposeProject {
        &self.project
    }

    pub fn running(&self) -> Option<&RunningTestnet> {
        self.running.as_ref()
    }

    pub fn work_dir(&self) -> &WorkDir {
        &self.work_dir
    }

    /// Takes ownership of a testnet started by another process, so that
    /// `stop` tears it down and releases its marker.
    pub fn adopt(&mut self, marker: &RunMarker) {
        self.project = ComposeProject::new(&marker.project, &self.work_dir);
        self.running = Some(RunningTestnet {
            instance_id: marker.instance_id.clone(),
            scratch_dir: self.work_dir.run_dir(&marker.instance_id),
            started_at: marker.started_at,
        });
    }

    /// Notes in the run marker that bootstrap has happened.
    pub fn record_bootstrap(&self) -> TestnetResult<()> {
        RunMarker::record_bootstrap(&self.work_dir.run_marker())
    }

    /// Engine reachable, image present or obtainable.
    pub async fn preflight(&self) -> TestnetResult<()> {
        self.engine.ping().await?;

        let image: ImageRef = self.config.image().parse()?;
        if self.engine.image_present(&image).await? {
            debug!("Image {} present locally", image);
            return Ok(());
        }

        if self.config.use_local_image {
            return Err(TestnetError::ImageUnavailable {
                image: image.to_string(),
                remedy: ImageRemedy::BuildLocally,
                detail: "use_local_image is set but the image is not present locally".to_string(),
            });
        }

        if let Some(auth) = &self.config.registry_auth {
            let password = auth.password()?;
            self.engine
                .login(auth, &password)
                .await
                .map_err(|e| TestnetError::ImageUnavailable {
                    image: image.to_string(),
                    remedy: ImageRemedy::Authenticate,
                    detail: e.to_string(),
                })?;
        }

        match self.engine.pull(&image).await {
            Ok(()) => Ok(()),
            Err(TestnetError::EngineCommand { kind, detail, .. }) => {
                Err(TestnetError::ImageUnavailable {
                    image: image.to_string(),
                    remedy: if kind == EngineErrorKind::AuthenticationRequired {
                        ImageRemedy::Authenticate
                    } else {
                        ImageRemedy::BuildLocally
                    },
                    detail,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Fails fast (or reclaims, when configured) if another live testnet owns
    /// the work directory; silently reclaims after a crashed owner.
    pub async fn claim_port_range(&self) -> TestnetResult<()> {
        let marker_path = self.work_dir.run_marker();
        match RunMarker::inspect(&marker_path)? {
            MarkerStatus::Absent => Ok(()),
            MarkerStatus::Live(marker) => match self.config.live_instance_policy {
                LiveInstancePolicy::FailFast => Err(TestnetError::config(
                    "live_instance_policy",
                    format!(
                        "testnet {} (pid {}) is running on ports {:?}; tear it down first \
                         or set live_instance_policy to reclaim",
                        marker.instance_id, marker.pid, marker.ports
                    ),
                )),
                LiveInstancePolicy::Reclaim => {
                    warn!(
                        "Reclaiming port range from live testnet {} (pid {})",
                        marker.instance_id, marker.pid
                    );
                    self.take_over(&marker).await
                }
            },
            MarkerStatus::Stale(marker) => {
                info!(
                    "Previous testnet {} (pid {}) did not shut down cleanly, reclaiming",
                    marker.instance_id, marker.pid
                );
                self.take_over(&marker).await
            }
        }
    }

    async fn take_over(&self, marker: &RunMarker) -> TestnetResult<()> {
        let project = ComposeProject::new(&marker.project, &self.work_dir);
        if let Err(e) = self.engine.compose_down(&project).await {
            debug!("Stopping previous project {} failed: {}", marker.project, e);
        }
        RunMarker::remove(&self.work_dir.run_marker())
    }

    /// Starts the materialized compose project.
    pub async fn start(&mut self) -> TestnetResult<RunningTestnet> {
        if let Some(running) = &self.running {
            return Err(TestnetError::InvalidState {
                operation: "start containers",
                state: format!("already running as {}", running.instance_id),
            });
        }

        self.claim_port_range().await?;
        self.preflight().await?;

        if self.config.reclaim_ports {
            let report = self.reaper.reap(&self.ports, &self.work_dir, None).await;
            for warning in report.warnings {
                warn!("Reclamation: {}", warning);
            }
        }

        // Anything left in this namespace goes first.
        if let Err(e) = self.engine.compose_down(&self.project).await {
            debug!("Pre-start compose down failed: {}", e);
        }

        let instance_id = new_instance_id();
        let scratch_dir = self.work_dir.run_dir(&instance_id);
        std::fs::create_dir_all(&scratch_dir).map_err(|e| TestnetError::io(&scratch_dir, e))?;

        let running = RunningTestnet {
            instance_id: instance_id.clone(),
            scratch_dir,
            started_at: Utc::now(),
        };
        RunMarker::new(&instance_id, &self.project.name, self.ports.clone())
            .write(&self.work_dir.run_marker())?;
        self.running = Some(running.clone());

        info!("Starting compose project {} ({})", self.project.name, instance_id);
        self.engine.compose_up(&self.project).await?;

        if self.config.follow_logs {
            let log_file = running.scratch_dir.join(CONTAINER_LOG_FILE);
            match self.engine.follow_logs(&self.project, &log_file).await {
                Ok(follower) => self.log_follower = follower,
                Err(e) => warn!("Container log capture unavailable: {}", e),
            }
        }

        Ok(running)
    }

    /// Stops everything. Failures become warnings in the report.
    pub async fn stop(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        if let Some(follower) = self.log_follower.take() {
            let name = follower.name().to_string();
            if let Err(e) = follower.shutdown().await {
                report.warn(TeardownWarning::new(format!("stopping `{name}`"), e.to_string()));
            }
        }

        if let Err(e) = self.engine.compose_down(&self.project).await {
            report.warn(TeardownWarning::new("compose down", e.to_string()));
        }

        self.release_marker(&mut report);

        if self.config.reclaim_ports {
            // This run's container log stays until the next start.
            let keep = self.running.as_ref().map(|running| running.instance_id.clone());
            let reaped = self.reaper.reap(&self.ports, &self.work_dir, keep.as_deref()).await;
            for warning in reaped.warnings {
                report.warn(warning);
            }
        }

        if let Some(running) = self.running.take() {
            info!("Testnet {} stopped", running.instance_id);
        }
        report
    }

    /// Synchronous best-effort stop for `Drop`.
    pub fn stop_blocking(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        // Dropping the follower kills it.
        self.log_follower.take();
        if let Err(e) = self.engine.compose_down_blocking(&self.project) {
            report.warn(TeardownWarning::new("compose down", e.to_string()));
        }
        self.release_marker(&mut report);
        self.running = None;
        report
    }

    /// Removes the run marker if this controller wrote it.
    fn release_marker(&self, report: &mut TeardownReport) {
        let path = self.work_dir.run_marker();
        let ours = match (RunMarker::read(&path), &self.running) {
            (Ok(Some(marker)), Some(running)) => marker.instance_id == running.instance_id,
            (Ok(Some(_)), None) => false,
            (Ok(None), _) => return,
            (Err(e), _) => {
                report.warn(TeardownWarning::new("reading run marker", e.to_string()));
                return;
            }
        };
        if ours {
            if let Err(e) = RunMarker::remove(&path) {
                report.warn(TeardownWarning::new("removing run marker", e.to_string()));
            }
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() -> TestnetResult<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())
            .map_err(|e| TestnetError::io("SIGTERM handler", e))?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map_err(|e| TestnetError::io("SIGINT handler", e))?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| TestnetError::io("Ctrl-C handler", e))?;
    Ok(())
}
