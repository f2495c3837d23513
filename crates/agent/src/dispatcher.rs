//! Per-call capability checks.

use std::sync::Arc;

use policy::{Blocked, Capability, Policy};

/// Checks guarded calls against the installed policy.
///
/// Cloning shares the same policy snapshot.
#[derive(Debug, Clone)]
pub struct GuardDispatcher {
    policy: Arc<Policy>,
}

impl GuardDispatcher {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Fail with the capability's default message if it is blocked.
    pub fn check(&self, capability: Capability) -> Result<(), Blocked> {
        self.check_with(capability, capability.message())
    }

    /// Fail with `message` if `capability` is blocked.
    pub fn check_with(&self, capability: Capability, message: &'static str) -> Result<(), Blocked> {
        self.policy.require(capability, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy::BlockedKind;

    #[test]
    fn test_allowed_capability_passes() {
        let dispatcher = GuardDispatcher::new(Policy::parse("block=jndi"));
        assert!(dispatcher.check(Capability::Process).is_ok());
        assert!(dispatcher.check_with(Capability::Unsafe, "custom").is_ok());
    }

    #[test]
    fn test_blocked_capability_fails_with_message() {
        let dispatcher = GuardDispatcher::new(Policy::parse("block=jndi"));
        let err = dispatcher.check(Capability::Jndi).unwrap_err();
        assert_eq!(err.kind(), BlockedKind::Lookup);
        assert_eq!(err.to_string(), "JNDI context creation blocked by aegis4j");

        let err = dispatcher
            .check_with(Capability::Jndi, "lookup refused")
            .unwrap_err();
        assert_eq!(err.message(), "lookup refused");
    }

    #[test]
    fn test_clones_share_policy() {
        let dispatcher = GuardDispatcher::new(Policy::all_blocked());
        let clone = dispatcher.clone();
        assert!(std::ptr::eq(dispatcher.policy(), clone.policy()));
    }
}
