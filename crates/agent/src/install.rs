//! Agent installation.

use std::sync::Arc;

use policy::{CapabilitySet, Policy};
use runtime::{AgentState, Runtime};
use tracing::{debug, info};

use crate::interceptor::{AGENT_NAME, Interceptor};
use crate::{GuardDispatcher, InstallError, Result};

/// An installed agent.
#[derive(Debug, Clone)]
pub struct Agent {
    dispatcher: GuardDispatcher,
    retransformed: Vec<String>,
}

impl Agent {
    /// Install into `runtime` with the policy string `config`.
    ///
    /// Units loaded before this call that carry guarded entry points are
    /// retransformed, so guards also cover them. A failed install is final:
    /// later installs into the same runtime report
    /// [`InstallError::PreviouslyFailed`].
    pub fn install(runtime: &Runtime, config: &str) -> Result<Agent> {
        let attachment = match runtime.attach(AGENT_NAME) {
            Ok(attachment) => attachment,
            Err(runtime::Error::AlreadyAttached(_)) => {
                return Err(match runtime.agent_state(AGENT_NAME) {
                    AgentState::Failed => InstallError::PreviouslyFailed,
                    _ => InstallError::AlreadyInstalled,
                });
            }
            Err(e) => return Err(InstallError::Registration(e)),
        };

        let policy = Policy::parse(config);
        let dispatcher = GuardDispatcher::new(policy);
        let interceptor = Arc::new(Interceptor::new(dispatcher.clone()));

        // Refuse before registering anything when live units could not be
        // rewritten.
        if !runtime.can_retransform() && !loaded_guarded(runtime, &interceptor).is_empty() {
            return Err(InstallError::Retransform(runtime::Error::Unsupported(
                "retransformation",
            )));
        }
        runtime
            .add_transformer(interceptor.clone())
            .map_err(InstallError::Registration)?;

        let pending = loaded_guarded(runtime, &interceptor);
        if !pending.is_empty() {
            runtime
                .retransform(&pending)
                .map_err(InstallError::Retransform)?;
            debug!(units = ?pending, "loaded units retransformed");
        }

        attachment.complete();
        info!(blocked = %policy.blocked(), "aegis installed");
        Ok(Agent {
            dispatcher,
            retransformed: pending,
        })
    }

    pub fn policy(&self) -> &Policy {
        self.dispatcher.policy()
    }

    pub fn blocked(&self) -> CapabilitySet {
        self.policy().blocked()
    }

    pub fn dispatcher(&self) -> &GuardDispatcher {
        &self.dispatcher
    }

    /// Units that were already loaded at install time and were rewritten.
    pub fn retransformed(&self) -> &[String] {
        &self.retransformed
    }
}

/// Loaded units the interceptor would rewrite.
fn loaded_guarded(runtime: &Runtime, interceptor: &Interceptor) -> Vec<String> {
    runtime
        .loaded_units()
        .into_iter()
        .filter(|unit| interceptor.guards(unit))
        .collect()
}

/// Install into the process-wide runtime.
pub fn install_global(config: &str) -> Result<Agent> {
    Agent::install(Runtime::global(), config)
}
