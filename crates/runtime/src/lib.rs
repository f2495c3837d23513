//! Aegis host runtime: loadable code units and the surfaces built on them.
//!
//! Code is organized in named [`CodeUnit`]s. A unit is *defined* once and
//! *loaded* on first use; loading links the unit after every registered
//! [`Transformer`] has had the chance to rewrite it. Transformers insert
//! [`Hook`]s into method prologues, and the host surfaces run the prologue
//! before doing any work.
//!
//! # Overview
//!
//! - **Runtime**: definitions, load-once linking, retransformation and the
//!   attach state of agents.
//! - **Surfaces**: naming, remote registries, processes, an HTTP server,
//!   object streams, raw memory, and reflective instantiation.
//!
//! # Example
//!
//! ```
//! use runtime::{CodeUnit, Runtime};
//!
//! let rt = Runtime::new();
//! rt.define(CodeUnit::new("app.Main").method("run")).unwrap();
//!
//! let main = rt.load("app.Main").unwrap();
//! assert!(main.enter("run").is_ok());
//! assert_eq!(rt.loaded_units(), vec!["app.Main".to_string()]);
//! ```

mod error;
mod instrument;
mod loader;
mod unit;

pub mod http;
pub mod memory;
pub mod naming;
pub mod process;
pub mod reflect;
pub mod registry;
pub mod serial;

pub use error::{Error, Result};
pub use instrument::{AgentState, Attachment, TransformError, Transformer};
pub use loader::{Builder, Runtime, UnitHandle};
pub use unit::{CodeUnit, Hook, HookError, Method};
