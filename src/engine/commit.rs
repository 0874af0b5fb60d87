//! Commit Executor
//!
//! Runs an `ActionPlan` strictly in order, one backend operation per action.
//! Every action owns a small state machine:
//!
//! ```text
//! Pending
//!    ↓
//! Running
//!    ↓
//! Succeeded | Failed
//! ```
//!
//! The first failure halts the commit. Nothing is rolled back; the returned
//! `CommitError` tells which actions ran, which one failed and which were
//! never attempted. Cancellation is honoured only between actions.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{error, info, warn};

use super::action::{Action, ActionPlan};
use super::planner::PlanError;
use crate::backend::Backend;
use crate::environment::Environment;
use crate::prober::ProbeError;

/// Lifecycle of a single action during a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ActionState {
    /// Returns true for Succeeded and Failed
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// The only allowed successor states
    const fn allows(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Rejected state change of an action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionTransitionError {
    #[error("Cannot move action from terminal state {from}")]
    FromTerminalState { from: ActionState },

    #[error("Cannot move action from {from} to {to}")]
    Invalid { from: ActionState, to: ActionState },
}

/// One action of a commit and how far it got.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ActionRecord {
    /// Position in the plan
    pub index: usize,
    pub action: Action,
    state: ActionState,
    /// Backend error text of a failed action
    pub error: Option<String>,
}

impl ActionRecord {
    pub fn new(index: usize, action: Action) -> Self {
        Self {
            index,
            action,
            state: ActionState::Pending,
            error: None,
        }
    }

    #[inline]
    pub fn state(&self) -> ActionState {
        self.state
    }

    /// Move to `to`, enforcing Pending → Running → Succeeded | Failed.
    pub fn transition_to(&mut self, to: ActionState) -> Result<(), ActionTransitionError> {
        if self.state.is_terminal() {
            return Err(ActionTransitionError::FromTerminalState { from: self.state });
        }
        if !self.state.allows(to) {
            return Err(ActionTransitionError::Invalid {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    fn fail(&mut self, reason: &str) -> Result<(), ActionTransitionError> {
        self.transition_to(ActionState::Failed)?;
        self.error = Some(reason.to_string());
        Ok(())
    }
}

/// Errors raised by a commit.
///
/// Variants that ran actions carry the full record list, so callers can see
/// exactly which actions succeeded and which were never attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// The session has no probed graph to plan against
    #[error("nothing to commit against: storage was never probed")]
    NotProbed,

    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Backend tools the plan needs are missing; nothing was run
    #[error("missing tools: {}", tools.join(", "))]
    MissingTools { tools: Vec<String> },

    /// An action failed; everything after it was left alone
    #[error("action failed after {} succeeded: {reason}", count(records, ActionState::Succeeded))]
    ActionFailed {
        records: Vec<ActionRecord>,
        reason: String,
    },

    /// The cancellation flag was raised between two actions
    #[error("commit cancelled after {} of {} actions", count(records, ActionState::Succeeded), records.len())]
    Cancelled { records: Vec<ActionRecord> },

    /// Every action succeeded but the system could not be probed again
    #[error("all actions succeeded but re-probing failed: {source}")]
    Reprobe {
        records: Vec<ActionRecord>,
        source: ProbeError,
    },

    #[error("internal action state error: {0}")]
    Transition(#[from] ActionTransitionError),
}

fn count(records: &[ActionRecord], state: ActionState) -> usize {
    records.iter().filter(|r| r.state == state).count()
}

impl CommitError {
    /// Per-action records, empty if no action was reached.
    pub fn records(&self) -> &[ActionRecord] {
        match self {
            Self::ActionFailed { records, .. }
            | Self::Cancelled { records }
            | Self::Reprobe { records, .. } => records,
            _ => &[],
        }
    }

    pub fn succeeded(&self) -> Vec<&Action> {
        self.in_state(ActionState::Succeeded)
    }

    pub fn failed(&self) -> Option<&Action> {
        self.in_state(ActionState::Failed).into_iter().next()
    }

    pub fn not_attempted(&self) -> Vec<&Action> {
        self.in_state(ActionState::Pending)
    }

    fn in_state(&self, state: ActionState) -> Vec<&Action> {
        self.records()
            .iter()
            .filter(|r| r.state == state)
            .map(|r| &r.action)
            .collect()
    }
}

/// Hooks a caller can install to follow a commit.
pub trait CommitCallbacks {
    /// Called before each action with its text.
    fn message(&self, message: &str) {
        info!("{}", message);
    }

    /// Called once when an action fails; the commit halts afterwards.
    fn error(&self, message: &str, what: &str) {
        error!(action = what, "{}", message);
    }
}

/// Callbacks that only log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingCommitCallbacks;

impl CommitCallbacks for LoggingCommitCallbacks {}

/// Shared flag a caller or signal handler raises to stop a commit.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// The underlying atomic, for registration with signal handlers
    pub fn as_atomic(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Execute `plan` in order.
///
/// In a read-only environment no backend call is made and every action is
/// reported as succeeded.
///
/// # Errors
///
/// - `MissingTools` if the backend preflight finds missing binaries
/// - `Cancelled` if `cancel` is raised before an action starts
/// - `ActionFailed` at the first backend failure
pub fn execute(
    plan: &ActionPlan,
    backend: &mut dyn Backend,
    env: &Environment,
    callbacks: &dyn CommitCallbacks,
    cancel: &CancelFlag,
) -> Result<Vec<ActionRecord>, CommitError> {
    if !env.read_only && !plan.is_empty() {
        let tools = backend.preflight(plan, env);
        if !tools.is_empty() {
            error!(?tools, "preflight failed");
            return Err(CommitError::MissingTools { tools });
        }
    }

    let mut records: Vec<ActionRecord> = plan
        .iter()
        .enumerate()
        .map(|(i, action)| ActionRecord::new(i, action.clone()))
        .collect();

    info!(
        actions = records.len(),
        dry_run = env.read_only,
        "commit started"
    );

    for index in 0..records.len() {
        if cancel.is_cancelled() {
            warn!(completed = index, "commit cancelled");
            return Err(CommitError::Cancelled { records });
        }

        let record = &mut records[index];
        record.transition_to(ActionState::Running)?;
        let text = record.action.text();
        callbacks.message(&text);

        if env.read_only {
            record.transition_to(ActionState::Succeeded)?;
            continue;
        }

        match backend.execute(&record.action, env) {
            Ok(()) => record.transition_to(ActionState::Succeeded)?,
            Err(e) => {
                let reason = format!("{:#}", e);
                record.fail(&reason)?;
                callbacks.error(&reason, &text);
                return Err(CommitError::ActionFailed { records, reason });
            }
        }
    }

    info!(actions = records.len(), "commit finished");
    Ok(records)
}
