//! Classification of container engine failures from their stderr text.

use std::fmt;

/// Broad cause of a failed engine command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineErrorKind {
    /// The engine daemon is not running or not reachable.
    DaemonUnreachable,
    /// The registry requires (different) credentials.
    AuthenticationRequired,
    /// The image or tag does not exist in the registry.
    ImageNotFound,
    /// A published port is taken by another process.
    PortInUse,
    /// A container or network with the same name already exists.
    NameConflict,
    Other,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineErrorKind::DaemonUnreachable => "engine daemon unreachable",
            EngineErrorKind::AuthenticationRequired => "authentication required",
            EngineErrorKind::ImageNotFound => "image not found",
            EngineErrorKind::PortInUse => "port already in use",
            EngineErrorKind::NameConflict => "name conflict",
            EngineErrorKind::Other => "unclassified failure",
        };
        f.write_str(s)
    }
}

const DAEMON_UNREACHABLE: &[&str] = &[
    "cannot connect to the docker daemon",
    "is the docker daemon running",
    "error during connect",
    "docker.sock: connect: no such file or directory",
    "permission denied while trying to connect to the docker daemon",
];

const AUTHENTICATION: &[&str] = &[
    "unauthorized",
    "authentication required",
    "no basic auth credentials",
    "incorrect username or password",
    "requested access to the resource is denied",
];

const NOT_FOUND: &[&str] = &[
    "manifest unknown",
    "not found: manifest unknown",
    "repository does not exist",
    "no such image",
    "manifest for",
    "pull access denied",
];

const PORT_IN_USE: &[&str] = &["port is already allocated", "address already in use"];

const NAME_CONFLICT: &[&str] = &["is already in use by container", "conflict. the container name"];

/// Maps engine stderr onto an [`EngineErrorKind`].
///
/// Order matters: Docker Hub answers a pull of a missing private repository
/// with both "pull access denied" and "repository does not exist", so a
/// missing repository is checked before the generic denial.
pub fn classify_engine_error(stderr: &str) -> EngineErrorKind {
    let text = stderr.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if has(DAEMON_UNREACHABLE) {
        EngineErrorKind::DaemonUnreachable
    } else if has(PORT_IN_USE) {
        EngineErrorKind::PortInUse
    } else if has(NAME_CONFLICT) {
        EngineErrorKind::NameConflict
    } else if text.contains("repository does not exist") {
        // "...or may require 'docker login'" follows; the repository is what's missing.
        EngineErrorKind::ImageNotFound
    } else if has(AUTHENTICATION) {
        EngineErrorKind::AuthenticationRequired
    } else if has(NOT_FOUND) {
        EngineErrorKind::ImageNotFound
    } else if text.contains("denied") {
        EngineErrorKind::AuthenticationRequired
    } else {
        EngineErrorKind::Other
    }
}
