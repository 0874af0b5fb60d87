//! Probe Collector: read the live storage layout into a fresh device graph.
//!
//! Probing never mutates storage. Recoverable per-device problems (an
//! unsupported filesystem, a partition table the engine does not know) are
//! handed to `ProbeCallbacks::error`, which decides between skipping the
//! device and aborting the probe.

pub mod lsblk;

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::runner::run_tool_safe;
use crate::backend::tools::LsblkArgs;
use crate::devicegraph::{Devicegraph, GraphError};
use crate::environment::Environment;
use crate::fstab::{self, Fstab, FstabEntry};
use crate::sanity::binary_exists;

/// Errors raised while probing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// Enumeration tooling is not installed
    #[error("required command '{0}' is not available")]
    MissingCommand(String),

    /// The system reported data that cannot form a valid graph
    #[error("inconsistent probe data: {0}")]
    Inconsistent(String),

    /// A callback declined to skip a recoverable problem
    #[error("probe aborted at {device}: {message}")]
    Aborted { device: String, message: String },

    #[error("I/O error while probing: {0}")]
    Io(String),

    #[error("failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("probe produced an invalid graph: {0}")]
    Graph(#[from] GraphError),
}

/// Hooks a caller can install to follow and steer a probe.
pub trait ProbeCallbacks {
    fn begin(&self) {
        info!("probing storage");
    }

    fn end(&self) {
        info!("probing finished");
    }

    fn message(&self, message: &str) {
        debug!("{}", message);
    }

    /// A recoverable problem with `what`. Return `true` to skip it and go on.
    fn error(&self, message: &str, what: &str) -> bool {
        warn!(device = what, "{}, skipping", message);
        true
    }

    /// A command the probe needs is missing. Return `true` to go on without it.
    fn missing_command(&self, message: &str, command: &str) -> bool {
        warn!(command, "{}", message);
        false
    }
}

/// Callbacks that only log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingProbeCallbacks;

impl ProbeCallbacks for LoggingProbeCallbacks {}

/// Source of probed graphs.
pub trait Prober {
    /// Produce a fresh graph of the current storage layout.
    fn probe(&mut self, callbacks: &dyn ProbeCallbacks) -> Result<Devicegraph, ProbeError>;
}

/// Probes the running system through lsblk, the kernel mount table and fstab.
#[derive(Debug, Clone)]
pub struct SystemProber {
    tool_dir: Option<PathBuf>,
    mounts_path: PathBuf,
    fstab_path: PathBuf,
}

impl SystemProber {
    pub fn new(env: &Environment) -> Self {
        Self {
            tool_dir: env.tool_dir.clone(),
            mounts_path: env.mounts_path.clone(),
            fstab_path: env.fstab_path.clone(),
        }
    }

    fn read_lsblk(&self, callbacks: &dyn ProbeCallbacks) -> Result<Vec<lsblk::LsblkRow>, ProbeError> {
        let args = LsblkArgs::default();
        let program = crate::backend::runner::resolve_program("lsblk", self.tool_dir.as_deref());
        if !binary_exists(&program) {
            callbacks.missing_command("cannot enumerate block devices", "lsblk");
            return Err(ProbeError::MissingCommand("lsblk".into()));
        }
        let output = run_tool_safe(&args, self.tool_dir.as_deref())
            .map_err(|e| ProbeError::Io(format!("{:#}", e)))?;
        output
            .ensure_success("lsblk")
            .map_err(|e| ProbeError::Io(format!("{:#}", e)))?;
        lsblk::parse_lsblk(&output.stdout)
    }

    fn read_fstab(&self) -> Result<Vec<FstabEntry>, ProbeError> {
        Fstab::load(&self.fstab_path)
            .map(|f| f.entries().cloned().collect())
            .map_err(|e| ProbeError::Io(format!("{:#}", e)))
    }
}

impl Prober for SystemProber {
    fn probe(&mut self, callbacks: &dyn ProbeCallbacks) -> Result<Devicegraph, ProbeError> {
        callbacks.begin();
        let rows = self.read_lsblk(callbacks)?;
        callbacks.message(&format!("lsblk reported {} devices", rows.len()));
        let mounts = fstab::read_mount_table(&self.mounts_path)
            .map_err(|e| ProbeError::Io(format!("{:#}", e)))?;
        let fstab = self.read_fstab()?;
        let graph = lsblk::build_graph(&rows, &mounts, &fstab, callbacks)?;
        callbacks.end();
        Ok(graph)
    }
}

/// Replays a graph saved as JSON, for offline planning.
#[derive(Debug, Clone)]
pub struct SnapshotProber {
    path: PathBuf,
}

impl SnapshotProber {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl Prober for SnapshotProber {
    fn probe(&mut self, callbacks: &dyn ProbeCallbacks) -> Result<Devicegraph, ProbeError> {
        callbacks.begin();
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| ProbeError::Io(format!("{}: {}", self.path.display(), e)))?;
        let graph: Devicegraph = serde_json::from_str(&content).map_err(|e| ProbeError::Parse {
            what: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        callbacks.end();
        Ok(graph.snapshot())
    }
}

/// Returns a preset graph. Each probe yields a fresh copy.
#[derive(Debug, Clone, Default)]
pub struct StaticProber {
    graph: Devicegraph,
}

impl StaticProber {
    pub fn new(graph: Devicegraph) -> Self {
        Self { graph }
    }

    /// Replace the graph later probes return.
    pub fn set(&mut self, graph: Devicegraph) {
        self.graph = graph;
    }
}

impl Prober for StaticProber {
    fn probe(&mut self, callbacks: &dyn ProbeCallbacks) -> Result<Devicegraph, ProbeError> {
        callbacks.begin();
        let graph = self.graph.snapshot();
        callbacks.end();
        Ok(graph)
    }
}
