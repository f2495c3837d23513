//! Capability registry and blocked-set policy.
//!
//! Core principle: **everything is blocked unless a well-formed directive
//! says otherwise.**
//!
//! The registry lists the six guarded capabilities, the operations each one
//! gates, and the error raised when a blocked operation is invoked. The
//! [`Policy`] type turns an operator string into the set of blocked
//! capabilities.
//!
//! ```
//! use policy::{Capability, Policy};
//!
//! let policy = Policy::parse("unblock=serialization,process");
//! assert!(policy.is_blocked(Capability::Jndi));
//! assert!(!policy.is_blocked(Capability::Process));
//! ```

mod capability;
mod error;
mod policy;

pub use capability::{
    Capability, CapabilitySet, EntryPoint, all_capabilities, all_entry_points, capability_for,
    entry_points_for,
};
pub use error::{Blocked, BlockedKind, Error, Result, blocked_cause, root_cause};
pub use policy::{Decision, Policy};
