//! Aegis agent: capability guards for the host runtime.
//!
//! Installing the agent registers an [`Interceptor`] with the runtime's
//! loading pipeline. The interceptor puts a [`CapabilityGuard`] in front of
//! every guarded entry point; at call time the guard asks the
//! [`GuardDispatcher`] whether the capability is blocked.
//!
//! ```
//! use policy::Capability;
//! use runtime::{Runtime, process::ProcessRuntime};
//!
//! let rt = Runtime::new();
//! let agent = agent::Agent::install(&rt, "unblock=serialization").unwrap();
//! assert!(agent.policy().is_blocked(Capability::Process));
//!
//! let err = ProcessRuntime::new(&rt).unwrap().exec("ls").unwrap_err();
//! let blocked = policy::blocked_cause(&err).unwrap();
//! assert_eq!(blocked.message(), "Process execution blocked by aegis4j");
//! ```

mod dispatcher;
mod error;
mod install;
mod interceptor;

pub use dispatcher::GuardDispatcher;
pub use error::{InstallError, Result};
pub use install::{Agent, install_global};
pub use interceptor::{AGENT_NAME, CapabilityGuard, DEFAULT_EXCLUSIONS, Interceptor, guard_id};
