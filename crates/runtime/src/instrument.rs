//! Instrumentation interface offered to agents.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use crate::unit::CodeUnit;

/// Rewrites code units before they become active.
///
/// A registered transformer is offered every unit as it is linked, and
/// again whenever a loaded unit is retransformed. The same unit may be
/// offered more than once, so `transform` must be idempotent.
///
/// Transformers must not load units themselves.
pub trait Transformer: Send + Sync {
    /// Stable name, unique per runtime.
    fn name(&self) -> &str;

    /// Rewrite `unit` in place. Returns whether anything changed.
    ///
    /// On error the unit is used as it was before this transformer ran.
    fn transform(&self, unit: &mut CodeUnit) -> Result<bool, TransformError>;
}

/// A transformer could not process a unit.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unresolved dependency: {0}")]
    Unresolved(String),

    #[error("transform failed: {0}")]
    Failed(String),
}

/// Lifecycle of an agent attached to a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentState {
    #[default]
    Uninstalled,
    Installing,
    Installed,
    /// Installation was attempted and did not complete. Terminal.
    Failed,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Uninstalled => "uninstalled",
            AgentState::Installing => "installing",
            AgentState::Installed => "installed",
            AgentState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-runtime record of attached agents.
#[derive(Debug, Default)]
pub(crate) struct Agents {
    states: Mutex<HashMap<String, AgentState>>,
}

impl Agents {
    pub(crate) fn state(&self, agent: &str) -> AgentState {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(agent).copied().unwrap_or_default()
    }

    /// Move `agent` to `Installing`. Fails unless it is `Uninstalled`.
    pub(crate) fn begin(&self, agent: &str) -> bool {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(agent.to_string()).or_default();
        if *state != AgentState::Uninstalled {
            return false;
        }
        *state = AgentState::Installing;
        true
    }

    pub(crate) fn set(&self, agent: &str, state: AgentState) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.insert(agent.to_string(), state);
    }
}

/// An in-progress agent installation.
///
/// Call [`Attachment::complete`] once installation succeeded. Dropping an
/// incomplete attachment moves the agent to `Failed`, and later attaches
/// are refused.
#[must_use = "an attachment that is never completed fails on drop"]
pub struct Attachment<'rt> {
    agents: &'rt Agents,
    agent: String,
    completed: bool,
}

impl<'rt> Attachment<'rt> {
    pub(crate) fn new(agents: &'rt Agents, agent: &str) -> Self {
        Self {
            agents,
            agent: agent.to_string(),
            completed: false,
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn complete(mut self) {
        self.agents.set(&self.agent, AgentState::Installed);
        self.completed = true;
    }
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.agents.set(&self.agent, AgentState::Failed);
        }
    }
}

impl fmt::Debug for Attachment<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("agent", &self.agent)
            .field("completed", &self.completed)
            .finish()
    }
}
