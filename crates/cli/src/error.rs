//! CLI error types.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that end an `aegis` invocation with a failure exit code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The configuration file could not be read or parsed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The agent could not be installed. Nothing was run.
    #[error("install failed: {0}")]
    Install(#[from] agent::InstallError),

    /// A host unit could not be loaded.
    #[error(transparent)]
    Runtime(#[from] runtime::Error),

    /// Unknown capability name.
    #[error(transparent)]
    Policy(#[from] policy::Error),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
