//! `.posnet-run.json`: who owns the port range right now.
//!
//! Written before containers start and removed on teardown. A marker whose
//! owner process is gone was left by a crash and is reclaimed transparently.

use chrono::{DateTime, Utc};
use log::warn;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{ProcessStatus, ProcessesToUpdate, System};

use crate::error::{TestnetError, TestnetResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMarker {
    /// Process that started the testnet.
    pub pid: u32,
    pub instance_id: String,
    pub project: String,
    /// Host ports the testnet publishes.
    pub ports: Vec<u16>,
    pub started_at: DateTime<Utc>,
    /// Set once the validators have been funded from the root account.
    #[serde(default)]
    pub bootstrapped_at: Option<DateTime<Utc>>,
}

/// What a marker file says about the port range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerStatus {
    /// No marker; the range is free as far as we know.
    Absent,
    /// The owner process is alive.
    Live(RunMarker),
    /// The owner process is gone.
    Stale(RunMarker),
}

impl RunMarker {
    /// Marker for the current process.
    pub fn new(instance_id: impl Into<String>, project: impl Into<String>, ports: Vec<u16>) -> Self {
        Self {
            pid: std::process::id(),
            instance_id: instance_id.into(),
            project: project.into(),
            ports,
            started_at: Utc::now(),
            bootstrapped_at: None,
        }
    }

    pub fn write(&self, path: &Path) -> TestnetResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| TestnetError::io(path, e))
    }

    /// Reads the marker. An unreadable or corrupt marker is treated as absent.
    pub fn read(path: &Path) -> TestnetResult<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TestnetError::io(path, e)),
        };
        match serde_json::from_str(&content) {
            Ok(marker) => Ok(Some(marker)),
            Err(e) => {
                warn!("Ignoring corrupt run marker {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Records a completed bootstrap in the marker at `path`.
    pub fn record_bootstrap(path: &Path) -> TestnetResult<()> {
        match Self::read(path)? {
            Some(mut marker) => {
                marker.bootstrapped_at = Some(Utc::now());
                marker.write(path)
            }
            None => Ok(()),
        }
    }

    /// Removes the marker if it exists.
    pub fn remove(path: &Path) -> TestnetResult<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TestnetError::io(path, e)),
        }
    }

    pub fn inspect(path: &Path) -> TestnetResult<MarkerStatus> {
        Ok(match Self::read(path)? {
            None => MarkerStatus::Absent,
            Some(marker) if process_alive(marker.pid) => MarkerStatus::Live(marker),
            Some(marker) => MarkerStatus::Stale(marker),
        })
    }
}

/// True when `pid` exists and is not a zombie.
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(nix::errno::Errno::EPERM) => {}
        Err(_) => return false,
    }

    let pid = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    match system.process(pid) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        // Not visible to us (e.g. other user), but signal 0 said it exists.
        None => true,
    }
}

/// Name of a running process, for logs.
pub fn process_name(pid: u32) -> Option<String> {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|process| process.name().to_string_lossy().into_owned())
}
