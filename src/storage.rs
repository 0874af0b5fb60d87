//! Storage session: owns the probed and staging graphs of one environment.
//!
//! ```text
//! probe() ──► probed ──clone──► staging ──mutate──► calculate_plan()
//!                ▲                                      │
//!                └──────── re-probe ◄──── commit() ◄────┘
//! ```
//!
//! At most one session per session key is alive in the process. The staging
//! graph is created on first access and dropped by probe, commit and
//! `discard_staging`.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};
use tracing::{debug, info, warn};

use crate::backend::{Backend, SystemBackend};
use crate::devicegraph::Devicegraph;
use crate::engine::action::ActionPlan;
use crate::engine::commit::{
    self, ActionRecord, CancelFlag, CommitCallbacks, CommitError, LoggingCommitCallbacks,
};
use crate::engine::planner;
use crate::environment::Environment;
use crate::error::{DevgraphError, Result};
use crate::prober::{LoggingProbeCallbacks, ProbeCallbacks, Prober, SystemProber};

/// Result of a successful commit.
#[derive(Debug)]
pub struct CommitOutcome<'a> {
    /// One record per executed action, in plan order
    pub records: Vec<ActionRecord>,
    /// The graph probed after the commit, now the session's probed graph
    pub probed: &'a Devicegraph,
}

static ACTIVE_SESSIONS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn active_sessions() -> &'static Mutex<HashSet<String>> {
    ACTIVE_SESSIONS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Holds a session key until dropped.
#[derive(Debug)]
struct SessionGuard {
    key: String,
}

impl SessionGuard {
    fn acquire(key: &str) -> Result<Self> {
        let mut sessions = active_sessions()
            .lock()
            .map_err(|_| DevgraphError::config("session registry poisoned"))?;
        if !sessions.insert(key.to_string()) {
            return Err(DevgraphError::session_conflict(key));
        }
        debug!(key, "session acquired");
        Ok(Self {
            key: key.to_string(),
        })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Ok(mut sessions) = active_sessions().lock() {
            sessions.remove(&self.key);
            debug!(key = %self.key, "session released");
        }
    }
}

/// A storage session.
pub struct Storage {
    env: Environment,
    prober: Box<dyn Prober>,
    backend: Box<dyn Backend>,
    probed: Option<Devicegraph>,
    staging: Option<Devicegraph>,
    _guard: SessionGuard,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("env", &self.env)
            .field("probed", &self.probed.as_ref().map(Devicegraph::len))
            .field("staging", &self.staging.as_ref().map(Devicegraph::len))
            .finish()
    }
}

impl Storage {
    /// Session against the running system.
    pub fn new(env: Environment) -> Result<Self> {
        let prober = SystemProber::new(&env);
        Self::with_parts(env, Box::new(prober), Box::new(SystemBackend::new()))
    }

    /// Session with a caller-supplied prober and backend.
    ///
    /// # Errors
    ///
    /// `SessionConflict` if a session with the same key is alive.
    pub fn with_parts(
        env: Environment,
        prober: Box<dyn Prober>,
        backend: Box<dyn Backend>,
    ) -> Result<Self> {
        let guard = SessionGuard::acquire(&env.session_key)?;
        info!(key = %env.session_key, read_only = env.read_only, "storage session opened");
        Ok(Self {
            env,
            prober,
            backend,
            probed: None,
            staging: None,
            _guard: guard,
        })
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Probe the system; the result replaces the probed graph and any
    /// staging is discarded.
    pub fn probe(&mut self) -> Result<&Devicegraph> {
        self.probe_with(&LoggingProbeCallbacks)
    }

    pub fn probe_with(&mut self, callbacks: &dyn ProbeCallbacks) -> Result<&Devicegraph> {
        let graph = self.prober.probe(callbacks)?;
        info!(devices = graph.len(), "probed");
        self.staging = None;
        Ok(self.probed.insert(graph))
    }

    /// # Errors
    ///
    /// `NotProbed` before the first successful probe.
    pub fn get_probed(&self) -> Result<&Devicegraph> {
        self.probed.as_ref().ok_or(DevgraphError::NotProbed)
    }

    /// The staging graph, cloned from probed on first access.
    ///
    /// Repeated calls return the same graph until it is discarded.
    pub fn get_staging(&mut self) -> Result<&mut Devicegraph> {
        let probed = self.probed.as_ref().ok_or(DevgraphError::NotProbed)?;
        Ok(self.staging.get_or_insert_with(|| {
            debug!("staging cloned from probed");
            probed.clone()
        }))
    }

    pub fn has_staging(&self) -> bool {
        self.staging.is_some()
    }

    /// Throw away all staged changes.
    pub fn discard_staging(&mut self) {
        if self.staging.take().is_some() {
            debug!("staging discarded");
        }
    }

    /// Actions that would turn probed into staging. Empty without staging.
    pub fn calculate_plan(&self) -> Result<ActionPlan> {
        let probed = self.get_probed()?;
        match &self.staging {
            Some(staging) => Ok(planner::plan(probed, staging)?),
            None => Ok(ActionPlan::default()),
        }
    }

    pub fn commit(&mut self) -> Result<CommitOutcome<'_>> {
        self.commit_with(&LoggingCommitCallbacks, &CancelFlag::new())
    }

    /// Plan, execute and re-probe.
    ///
    /// On success the fresh probe replaces the probed graph, staging is
    /// dropped and the new probed graph is returned with the records. An
    /// empty plan returns the current probed graph without probing again. On failure the probed graph is untouched and staging is kept,
    /// except when the final re-probe fails: then both are dropped because
    /// the system changed but its new state is unknown.
    pub fn commit_with(
        &mut self,
        callbacks: &dyn CommitCallbacks,
        cancel: &CancelFlag,
    ) -> Result<CommitOutcome<'_>> {
        let probed = self.probed.as_ref().ok_or(CommitError::NotProbed)?;
        let plan = match &self.staging {
            Some(staging) => planner::plan(probed, staging).map_err(CommitError::from)?,
            None => ActionPlan::default(),
        };
        info!("{}", plan.summary());

        if plan.is_empty() {
            self.staging = None;
            let probed = self.probed.as_ref().ok_or(CommitError::NotProbed)?;
            return Ok(CommitOutcome {
                records: Vec::new(),
                probed,
            });
        }

        let records = commit::execute(&plan, self.backend.as_mut(), &self.env, callbacks, cancel)?;

        match self.prober.probe(&LoggingProbeCallbacks) {
            Ok(graph) => {
                self.staging = None;
                Ok(CommitOutcome {
                    records,
                    probed: self.probed.insert(graph),
                })
            }
            Err(source) => {
                warn!(error = %source, "re-probe after commit failed");
                self.probed = None;
                self.staging = None;
                Err(CommitError::Reprobe { records, source }.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devicegraph::{BlockDeviceAttrs, Device};
    use crate::devices::find_by_name;
    use crate::engine::action::Action;
    use crate::prober::StaticProber;
    use crate::types::{BlockDeviceKind, FsType};

    struct NullBackend;

    impl Backend for NullBackend {
        fn execute(&mut self, _action: &Action, _env: &Environment) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn bare_disk() -> Devicegraph {
        let mut g = Devicegraph::new();
        g.add_node(Device::BlockDevice(BlockDeviceAttrs {
            name: "/dev/vdb".into(),
            size: 4 << 30,
            kind: BlockDeviceKind::Disk,
            pt_type: None,
        }))
        .unwrap();
        g
    }

    fn session(key: &str) -> Storage {
        Storage::with_parts(
            Environment::default().with_session_key(key),
            Box::new(StaticProber::new(bare_disk())),
            Box::new(NullBackend),
        )
        .unwrap()
    }

    #[test]
    fn test_second_session_with_same_key_conflicts() {
        let first = session("storage-unit-conflict");
        let second = Storage::with_parts(
            Environment::default().with_session_key("storage-unit-conflict"),
            Box::new(StaticProber::default()),
            Box::new(NullBackend),
        );
        assert!(matches!(second, Err(DevgraphError::SessionConflict { .. })));
        drop(first);
        let _third = session("storage-unit-conflict");
    }

    #[test]
    fn test_staging_requires_probe() {
        let mut storage = session("storage-unit-not-probed");
        assert!(matches!(storage.get_probed(), Err(DevgraphError::NotProbed)));
        assert!(matches!(storage.get_staging(), Err(DevgraphError::NotProbed)));
        assert!(matches!(
            storage.commit(),
            Err(DevgraphError::Commit(CommitError::NotProbed))
        ));
    }

    #[test]
    fn test_staging_is_lazy_and_stable() {
        let mut storage = session("storage-unit-lazy");
        storage.probe().unwrap();
        assert!(!storage.has_staging());

        let first = storage.get_staging().unwrap().id();
        let second = storage.get_staging().unwrap().id();
        assert_eq!(first, second);
        assert_ne!(first, storage.get_probed().unwrap().id());

        storage.discard_staging();
        assert!(!storage.has_staging());
        assert_ne!(storage.get_staging().unwrap().id(), first);
    }

    #[test]
    fn test_probe_discards_staging() {
        let mut storage = session("storage-unit-reprobe");
        storage.probe().unwrap();
        storage.get_staging().unwrap();
        storage.probe().unwrap();
        assert!(!storage.has_staging());
    }

    #[test]
    fn test_plan_reflects_staging() {
        let mut storage = session("storage-unit-plan");
        storage.probe().unwrap();
        assert!(storage.calculate_plan().unwrap().is_empty());

        let staging = storage.get_staging().unwrap();
        find_by_name(staging, "/dev/vdb")
            .unwrap()
            .create_blk_filesystem(staging, FsType::Xfs)
            .unwrap();
        let plan = storage.calculate_plan().unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_commit_returns_fresh_probed_graph() {
        let mut storage = session("storage-unit-commit");
        storage.probe().unwrap();
        let before = storage.get_probed().unwrap().id();

        // Nothing staged: the current graph comes back unprobed
        let outcome = storage.commit().unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.probed.id(), before);

        let staging = storage.get_staging().unwrap();
        find_by_name(staging, "/dev/vdb")
            .unwrap()
            .create_blk_filesystem(staging, FsType::Xfs)
            .unwrap();
        let outcome = storage.commit().unwrap();
        assert_eq!(outcome.records.len(), 1);
        let fresh = outcome.probed.id();
        assert_ne!(fresh, before);
        assert_eq!(storage.get_probed().unwrap().id(), fresh);
    }
}
