//! Configuration loading from aegis.toml.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default config file, looked up in the working directory.
pub const CONFIG_FILE: &str = "aegis.toml";

/// Environment variable holding a policy string.
pub const POLICY_ENV: &str = "AEGIS_POLICY";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Policy string, e.g. `unblock=serialization,process`.
    pub policy: Option<String>,

    /// Log filter directives used when no environment filter is set.
    pub log: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load `explicit` if given, else `aegis.toml` in `dir` if it exists.
    ///
    /// A file that was asked for explicitly must exist.
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let default = dir.join(CONFIG_FILE);
        if default.is_file() {
            Self::load(default)
        } else {
            Ok(Self::default())
        }
    }
}

/// Pick the policy string: flag, then environment, then config file.
///
/// With none set the result is empty, which blocks everything.
pub fn resolve_policy(flag: Option<&str>, env: Option<&str>, config: &Config) -> String {
    flag.or(env)
        .or(config.policy.as_deref())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),
}
