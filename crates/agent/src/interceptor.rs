//! Load-time rewriting of guarded entry points.

use std::fmt;
use std::sync::Arc;

use policy::{EntryPoint, entry_points_for};
use runtime::{CodeUnit, Hook, HookError, TransformError, Transformer};
use tracing::{debug, warn};

use crate::GuardDispatcher;

/// Name under which the agent attaches and registers its transformer.
pub const AGENT_NAME: &str = "aegis";

/// Unit-name prefixes never rewritten: the agent's own code and the
/// runtime's reflective instantiation support.
pub const DEFAULT_EXCLUSIONS: &[&str] = &["aegis.", "reflect."];

/// Prologue hook checking one entry point's capability.
pub struct CapabilityGuard {
    id: String,
    entry: &'static EntryPoint,
    dispatcher: GuardDispatcher,
}

impl CapabilityGuard {
    pub fn new(entry: &'static EntryPoint, dispatcher: GuardDispatcher) -> Self {
        Self {
            id: guard_id(entry),
            entry,
            dispatcher,
        }
    }

    pub fn entry(&self) -> &'static EntryPoint {
        self.entry
    }
}

/// Stable hook id for the guard of `entry`.
pub fn guard_id(entry: &EntryPoint) -> String {
    format!("{AGENT_NAME}/{}", entry.capability)
}

impl Hook for CapabilityGuard {
    fn id(&self) -> &str {
        &self.id
    }

    fn enter(&self, unit: &str, method: &str) -> Result<(), HookError> {
        self.dispatcher
            .check_with(self.entry.capability, self.entry.message())
            .map_err(|blocked| {
                warn!(
                    capability = %blocked.capability(),
                    unit,
                    method,
                    "blocked call"
                );
                Box::new(blocked) as HookError
            })
    }
}

impl fmt::Debug for CapabilityGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityGuard")
            .field("id", &self.id)
            .field("entry", &format_args!("{}", self.entry))
            .finish()
    }
}

/// Inserts a [`CapabilityGuard`] at the front of every guarded method of
/// the units it is offered.
#[derive(Debug)]
pub struct Interceptor {
    dispatcher: GuardDispatcher,
    exclusions: Vec<String>,
}

impl Interceptor {
    pub fn new(dispatcher: GuardDispatcher) -> Self {
        Self {
            dispatcher,
            exclusions: DEFAULT_EXCLUSIONS.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Never rewrite units whose name starts with `prefix`.
    pub fn exclude(mut self, prefix: impl Into<String>) -> Self {
        self.exclusions.push(prefix.into());
        self
    }

    pub fn is_excluded(&self, unit: &str) -> bool {
        self.exclusions.iter().any(|p| unit.starts_with(p.as_str()))
    }

    /// Whether a unit named `unit` would be rewritten.
    pub fn guards(&self, unit: &str) -> bool {
        !self.is_excluded(unit) && entry_points_for(unit).next().is_some()
    }
}

impl Transformer for Interceptor {
    fn name(&self) -> &str {
        AGENT_NAME
    }

    fn transform(&self, unit: &mut CodeUnit) -> Result<bool, TransformError> {
        if self.is_excluded(unit.name()) {
            return Ok(false);
        }
        let owner = unit.name().to_string();
        let mut changed = false;
        for entry in entry_points_for(&owner) {
            let Some(method) = unit.find_mut(entry.signature) else {
                debug!(unit = %owner, method = entry.signature, "entry point not declared, skipped");
                continue;
            };
            let guard = CapabilityGuard::new(entry, self.dispatcher.clone());
            if method.insert_hook(Arc::new(guard)) {
                debug!(unit = %owner, method = entry.signature, capability = %entry.capability, "guard inserted");
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy::{Capability, Policy, blocked_cause};

    fn interceptor(config: &str) -> Interceptor {
        Interceptor::new(GuardDispatcher::new(Policy::parse(config)))
    }

    #[test]
    fn test_rewrites_guarded_methods_only() {
        let mut unit = runtime::naming::unit();
        assert!(interceptor("block=jndi").transform(&mut unit).unwrap());

        let lookup = unit.find("lookup").unwrap();
        assert_eq!(lookup.prologue().len(), 1);
        assert_eq!(lookup.prologue()[0].id(), "aegis/jndi");
        assert!(unit.find("close").unwrap().prologue().is_empty());
    }

    #[test]
    fn test_transform_is_idempotent() {
        let interceptor = interceptor("");
        let mut unit = runtime::memory::unit();
        assert!(interceptor.transform(&mut unit).unwrap());
        assert!(!interceptor.transform(&mut unit).unwrap());
        assert!(unit.declared().iter().all(|m| m.prologue().len() == 1));
    }

    #[test]
    fn test_unrelated_units_untouched() {
        let mut unit = CodeUnit::new("app.Main").methods(["lookup", "exec"]);
        assert!(!interceptor("").transform(&mut unit).unwrap());
        assert!(unit.declared().iter().all(|m| m.prologue().is_empty()));
    }

    #[test]
    fn test_missing_entry_points_are_skipped() {
        let mut unit = CodeUnit::new("memory.Unsafe").method("get_unsafe");
        assert!(interceptor("").transform(&mut unit).unwrap());
        assert_eq!(unit.find("get_unsafe").unwrap().prologue().len(), 1);
    }

    #[test]
    fn test_exclusions() {
        let interceptor = interceptor("").exclude("naming.");
        let mut unit = runtime::naming::unit();
        assert!(!interceptor.transform(&mut unit).unwrap());
        assert!(!interceptor.guards("naming.InitialContext"));
        assert!(!interceptor.guards("reflect.Instantiator"));
        assert!(interceptor.guards("process.ProcessBuilder"));
    }

    #[test]
    fn test_guard_allows_unblocked_and_rejects_blocked() {
        let mut unit = runtime::serial::input_unit();
        interceptor("block=serialization").transform(&mut unit).unwrap();
        let err = unit.enter("new").unwrap_err();
        let blocked = blocked_cause(&*err).unwrap();
        assert_eq!(blocked.capability(), Capability::Serialization);
        assert_eq!(blocked.message(), "Java deserialization blocked by aegis4j");

        let mut unit = runtime::serial::input_unit();
        interceptor("block=jndi").transform(&mut unit).unwrap();
        assert!(unit.enter("new").is_ok());
    }
}
