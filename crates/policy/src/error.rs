//! Policy error types.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use thiserror::Error;

use crate::Capability;

/// Policy errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A token does not name a known capability.
    #[error("unknown capability: {0}")]
    UnknownCapability(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Kind of error raised for a blocked capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockedKind {
    Lookup,
    Registry,
    Execution,
    Provider,
    Serialization,
    Unsafe,
}

impl fmt::Display for BlockedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lookup => "LookupBlocked",
            Self::Registry => "RegistryBlocked",
            Self::Execution => "ExecutionBlocked",
            Self::Provider => "ProviderBlocked",
            Self::Serialization => "SerializationBlocked",
            Self::Unsafe => "UnsafeBlocked",
        };
        f.write_str(name)
    }
}

/// Raised in place of a guarded operation whose capability is blocked.
///
/// The display form is the message, verbatim. Callers match on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct Blocked {
    capability: Capability,
    message: &'static str,
}

impl Blocked {
    pub fn new(capability: Capability, message: &'static str) -> Self {
        Self {
            capability,
            message,
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn kind(&self) -> BlockedKind {
        self.capability.error_kind()
    }

    pub fn message(&self) -> &'static str {
        self.message
    }
}

impl From<Capability> for Blocked {
    fn from(capability: Capability) -> Self {
        Self::new(capability, capability.message())
    }
}

/// Innermost cause of `err`.
///
/// Follows `source()` links and looks through the custom payload of
/// `io::Error`, whose own `source()` skips the payload.
pub fn root_cause<'a>(err: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    let mut current = err;
    loop {
        if let Some(inner) = current.downcast_ref::<io::Error>().and_then(|e| e.get_ref()) {
            current = inner;
            continue;
        }
        match current.source() {
            Some(next) => current = next,
            None => return current,
        }
    }
}

/// The blocked-capability error at the root of `err`, if any.
pub fn blocked_cause<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a Blocked> {
    root_cause(err).downcast_ref::<Blocked>()
}
