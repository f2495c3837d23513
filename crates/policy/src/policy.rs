//! Blocked-set configuration and enforcement.

use crate::{Blocked, Capability, CapabilitySet};
use serde::{Deserialize, Serialize};

/// Directive names accepted before the `=`.
const BLOCK: &str = "block";
const UNBLOCK: &str = "unblock";

/// The set of blocked capabilities for a process.
///
/// Built once from operator configuration and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    blocked: CapabilitySet,
}

/// Result of a capability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { capability: Capability },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::all_blocked()
    }
}

impl Policy {
    /// Block every capability.
    pub fn all_blocked() -> Self {
        Self {
            blocked: CapabilitySet::all(),
        }
    }

    /// Block exactly the given capabilities.
    pub fn from_blocked(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            blocked: caps.into_iter().collect(),
        }
    }

    /// Parse a policy string such as `unblock=serialization,process`.
    ///
    /// Never fails. Empty, malformed, or unrecognized input blocks everything;
    /// only a well-formed `block=` or `unblock=` directive relaxes protection.
    /// Unknown tokens are dropped without affecting the others.
    pub fn parse(config: &str) -> Self {
        let config = config.trim();
        if config.is_empty() {
            return Self::all_blocked();
        }

        let Some((directive, payload)) = config.split_once('=') else {
            return Self::all_blocked();
        };

        let listed: CapabilitySet = payload.split(',').filter_map(Capability::from_token).collect();

        let directive = directive.trim();
        if directive.eq_ignore_ascii_case(BLOCK) {
            Self { blocked: listed }
        } else if directive.eq_ignore_ascii_case(UNBLOCK) {
            Self {
                blocked: CapabilitySet::all().difference(listed),
            }
        } else {
            Self::all_blocked()
        }
    }

    pub fn blocked(&self) -> CapabilitySet {
        self.blocked
    }

    pub fn is_blocked(&self, cap: Capability) -> bool {
        self.blocked.contains(cap)
    }

    /// Check whether `cap` may be used.
    pub fn check(&self, cap: Capability) -> Decision {
        if self.blocked.contains(cap) {
            Decision::Deny { capability: cap }
        } else {
            Decision::Allow
        }
    }

    /// Like [`Policy::check`], but yields the error to raise on denial.
    pub fn require(&self, cap: Capability, message: &'static str) -> Result<(), Blocked> {
        match self.check(cap) {
            Decision::Allow => Ok(()),
            Decision::Deny { capability } => Err(Blocked::new(capability, message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Capability::*;

    fn blocked(config: &str) -> Vec<Capability> {
        Policy::parse(config).blocked().iter().collect()
    }

    const ALL: [Capability; 6] = [Jndi, Rmi, Process, HttpServer, Serialization, Unsafe];

    #[test]
    fn test_malformed_blocks_everything() {
        for config in ["", "   ", "blahblah", "foo=bar", "unblock=incorrect", "=jndi", "blocked=jndi"] {
            assert_eq!(blocked(config), ALL, "config {config:?}");
        }
    }

    #[test]
    fn test_unblock() {
        assert_eq!(blocked("unblock=serialization"), vec![Jndi, Rmi, Process, HttpServer, Unsafe]);
        assert_eq!(blocked("unblock=serialization,process"), vec![Jndi, Rmi, HttpServer, Unsafe]);
        assert_eq!(blocked("UNbloCk=SERIALIZATION,Process"), vec![Jndi, Rmi, HttpServer, Unsafe]);
        assert_eq!(
            blocked(" unblock\t=    serialization      , process\t"),
            vec![Jndi, Rmi, HttpServer, Unsafe]
        );
        assert_eq!(
            blocked("unblock=serialization,process,incorrect1,incorrect2"),
            vec![Jndi, Rmi, HttpServer, Unsafe]
        );
        assert!(blocked("unblock=jndi,rmi,process,httpserver,serialization,unsafe").is_empty());
    }

    #[test]
    fn test_block() {
        assert_eq!(blocked("block=jndi"), vec![Jndi]);
        assert_eq!(blocked("block=jndi,rmi,process"), vec![Jndi, Rmi, Process]);
        assert_eq!(blocked("block = jndi\t, rmi ,\nprocess"), vec![Jndi, Rmi, Process]);
        assert_eq!(blocked("BLOck = JNDI\t, rmi ,\nProcESs"), vec![Jndi, Rmi, Process]);
    }

    #[test]
    fn test_block_with_nothing_valid_blocks_nothing() {
        assert!(blocked("block=").is_empty());
        assert!(blocked("block=nothing,known").is_empty());
    }

    #[test]
    fn test_duplicates_collapse() {
        assert_eq!(blocked("block=jndi,JNDI, jndi"), vec![Jndi]);
        assert_eq!(blocked("unblock=unsafe,unsafe"), vec![Jndi, Rmi, Process, HttpServer, Serialization]);
    }

    #[test]
    fn test_extra_equals_is_an_invalid_token() {
        assert_eq!(blocked("block=jndi=rmi,process"), vec![Process]);
    }

    #[test]
    fn test_check_and_require() {
        let policy = Policy::parse("block=process");
        assert!(!policy.check(Process).is_allowed());
        assert!(policy.check(Jndi).is_allowed());

        let err = policy.require(Process, Process.message()).unwrap_err();
        assert_eq!(err.to_string(), "Process execution blocked by aegis4j");
        assert!(policy.require(Unsafe, Unsafe.message()).is_ok());
    }

    #[test]
    fn test_default_is_fail_safe() {
        assert_eq!(Policy::default(), Policy::all_blocked());
    }
}
