// File: testnet/src/lifecycle/reaper.rs
//
// Zombie Reclamation
//
// A crashed run can leave host processes holding the topology's ports and
// scratch directories under runs/. Before a start and during teardown the
// reaper terminates port squatters (SIGTERM, grace period, SIGKILL) and
// deletes scratch directories that no live run owns.

use async_trait::async_trait;
use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;

use super::run_marker::{process_alive, process_name};
use super::TeardownWarning;
use crate::engine::{CommandSpec, Release};
use crate::error::{TestnetError, TestnetResult};
use crate::orchestrator::{poll_until, Clock, PollSchedule, Probe};
use crate::workspace::WorkDir;

const LISTENER_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Finds processes listening on a TCP port.
#[async_trait]
pub trait PortInspector: Send + Sync {
    async fn listeners(&self, port: u16) -> TestnetResult<Vec<u32>>;
}

/// [`PortInspector`] backed by `lsof`.
#[derive(Debug, Default, Clone)]
pub struct LsofInspector;

#[async_trait]
impl PortInspector for LsofInspector {
    async fn listeners(&self, port: u16) -> TestnetResult<Vec<u32>> {
        let output = CommandSpec::new("lsof")
            .arg("-nP")
            .arg("-t")
            .arg(format!("-iTCP:{port}"))
            .arg("-sTCP:LISTEN")
            .run(LISTENER_QUERY_TIMEOUT)
            .await?;
        // lsof exits 1 when nothing matches.
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }
}

/// A process the reaper terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedProcess {
    pub pid: u32,
    pub name: Option<String>,
    pub port: u16,
    pub release: Release,
}

/// Outcome of one reclamation pass.
#[derive(Debug, Default)]
pub struct ReapReport {
    pub terminated: Vec<ReapedProcess>,
    pub removed_runs: Vec<PathBuf>,
    pub warnings: Vec<TeardownWarning>,
}

pub struct ZombieReaper {
    inspector: Arc<dyn PortInspector>,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl ZombieReaper {
    pub fn new(inspector: Arc<dyn PortInspector>, clock: Arc<dyn Clock>, grace: Duration) -> Self {
        Self {
            inspector,
            clock,
            grace,
        }
    }

    /// Terminates port squatters and removes scratch directories other than
    /// `keep_run`.
    pub async fn reap(&self, ports: &[u16], work_dir: &WorkDir, keep_run: Option<&str>) -> ReapReport {
        let mut report = ReapReport::default();
        self.reap_ports(ports, &mut report).await;
        remove_stale_runs(work_dir, keep_run, &mut report);
        if !report.terminated.is_empty() || !report.removed_runs.is_empty() {
            info!(
                "Reclaimed {} process(es) and {} stale run dir(s)",
                report.terminated.len(),
                report.removed_runs.len()
            );
        }
        report
    }

    async fn reap_ports(&self, ports: &[u16], report: &mut ReapReport) {
        let own_pid = std::process::id();
        let mut seen = BTreeSet::new();

        for &port in ports {
            let pids = match self.inspector.listeners(port).await {
                Ok(pids) => pids,
                Err(TestnetError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    report.warnings.push(TeardownWarning::new(
                        "port reclamation",
                        "lsof is not installed; port squatters were not checked",
                    ));
                    return;
                }
                Err(e) => {
                    report
                        .warnings
                        .push(TeardownWarning::new(format!("listeners on port {port}"), e.to_string()));
                    continue;
                }
            };

            for pid in pids {
                if pid == own_pid || !seen.insert(pid) {
                    continue;
                }
                let name = process_name(pid);
                warn!(
                    "Port {} is held by pid {} ({}), terminating",
                    port,
                    pid,
                    name.as_deref().unwrap_or("unknown")
                );
                match self.terminate(pid).await {
                    Ok(release) => report.terminated.push(ReapedProcess {
                        pid,
                        name,
                        port,
                        release,
                    }),
                    Err(e) => report
                        .warnings
                        .push(TeardownWarning::new(format!("terminating pid {pid}"), e.to_string())),
                }
            }
        }
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL.
    pub async fn terminate(&self, pid: u32) -> TestnetResult<Release> {
        let target = i32::try_from(pid)
            .map(Pid::from_raw)
            .map_err(|_| TestnetError::config("pid", format!("{pid} is not a valid pid")))?;

        if !process_alive(pid) {
            return Ok(Release::Exited);
        }
        send(target, Signal::SIGTERM)?;

        let schedule = PollSchedule::new(EXIT_POLL_INTERVAL, self.grace);
        let exited = poll_until(self.clock.as_ref(), schedule, || async move {
            if process_alive(pid) {
                Probe::Pending(())
            } else {
                Probe::Ready(())
            }
        })
        .await;

        if exited.is_ok() {
            debug!("pid {} exited after SIGTERM", pid);
            return Ok(Release::Terminated);
        }

        warn!("pid {} ignored SIGTERM for {:?}, sending SIGKILL", pid, self.grace);
        send(target, Signal::SIGKILL)?;
        Ok(Release::Killed)
    }
}

fn send(pid: Pid, signal: Signal) -> TestnetResult<()> {
    match kill(pid, signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(TestnetError::io(
            format!("/proc/{pid}"),
            std::io::Error::from_raw_os_error(e as i32),
        )),
    }
}

fn remove_stale_runs(work_dir: &WorkDir, keep_run: Option<&str>, report: &mut ReapReport) {
    let runs = work_dir.runs_dir();
    let entries = match std::fs::read_dir(&runs) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            report
                .warnings
                .push(TeardownWarning::new(format!("listing {}", runs.display()), e.to_string()));
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || keep_run.is_some_and(|keep| entry.file_name() == keep) {
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                debug!("Removed stale run directory {}", path.display());
                report.removed_runs.push(path);
            }
            Err(e) => report
                .warnings
                .push(TeardownWarning::new(format!("removing {}", path.display()), e.to_string())),
        }
    }
}
