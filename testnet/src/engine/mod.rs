// File: testnet/src/engine/mod.rs
//
// Container Engine
//
// The lifecycle controller talks to the container engine only through the
// `ContainerEngine` trait. `DockerCli` drives the real `docker` binary; tests
// substitute in-memory engines.

pub mod classify;
pub mod docker;
pub mod process;

pub use classify::{classify_engine_error, EngineErrorKind};
pub use docker::DockerCli;
pub use process::{CommandOutput, CommandSpec, Release, ScopedProcess};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::RegistryAuth;
use crate::error::{TestnetError, TestnetResult};
use crate::workspace::WorkDir;

/// `repository:tag`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl FromStr for ImageRef {
    type Err = TestnetError;

    /// The tag is whatever follows the last `:` after the last `/`, so
    /// registry ports (`host:5000/repo`) are not mistaken for tags.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name_start = s.rfind('/').map_or(0, |i| i + 1);
        match s[name_start..].rfind(':') {
            Some(i) if i + 1 < s.len() - name_start => {
                let split = name_start + i;
                Ok(Self::new(&s[..split], &s[split + 1..]))
            }
            Some(_) => Err(TestnetError::config("image", format!("'{s}' has an empty tag"))),
            None if s.is_empty() => Err(TestnetError::config("image", "must not be empty")),
            None => Ok(Self::new(s, "latest")),
        }
    }
}

/// A compose project rooted in a work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeProject {
    pub name: String,
    pub directory: PathBuf,
    pub compose_file: PathBuf,
    pub env_file: PathBuf,
}

impl ComposeProject {
    pub fn new(name: impl Into<String>, work_dir: &WorkDir) -> Self {
        Self {
            name: name.into(),
            directory: work_dir.root().to_path_buf(),
            compose_file: work_dir.compose_file(),
            env_file: work_dir.env_file(),
        }
    }
}

/// Options for building the validator image locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Cargo profile baked into the image (`PROFILE` build argument).
    #[serde(default)]
    pub profile: Option<String>,
    /// Cargo features (`FEATURES` build argument).
    #[serde(default)]
    pub features: Option<String>,
    /// Image tag; the configured local tag when absent.
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub no_cache: bool,
    /// Build context directory.
    #[serde(default = "default_build_context")]
    pub context: PathBuf,
    /// Dockerfile, relative to the current directory; `<context>/Dockerfile`
    /// when absent.
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,
}

fn default_build_context() -> PathBuf {
    PathBuf::from(".")
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            profile: None,
            features: None,
            tag: None,
            no_cache: false,
            context: default_build_context(),
            dockerfile: None,
        }
    }
}

/// Operations the controller needs from a container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Succeeds when the engine daemon answers.
    async fn ping(&self) -> TestnetResult<()>;

    async fn image_present(&self, image: &ImageRef) -> TestnetResult<bool>;

    async fn pull(&self, image: &ImageRef) -> TestnetResult<()>;

    async fn login(&self, auth: &RegistryAuth, password: &str) -> TestnetResult<()>;

    /// Starts every service detached.
    async fn compose_up(&self, project: &ComposeProject) -> TestnetResult<()>;

    /// Stops and removes containers, orphans and volumes.
    async fn compose_down(&self, project: &ComposeProject) -> TestnetResult<()>;

    /// Same as `compose_down`, usable without an async runtime.
    fn compose_down_blocking(&self, project: &ComposeProject) -> TestnetResult<()>;

    async fn build_image(&self, image: &ImageRef, options: &BuildOptions) -> TestnetResult<()>;

    /// Streams all service logs into `output`. `None` when the engine has
    /// no log stream to offer.
    async fn follow_logs(
        &self,
        project: &ComposeProject,
        output: &Path,
    ) -> TestnetResult<Option<ScopedProcess>>;
}
