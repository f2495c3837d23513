use thiserror::Error;

/// Errors raised by the loading pipeline.
///
/// Host surfaces have their own error types; see each module.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("unit not defined: {0}")]
    NotDefined(String),

    #[error("unit already defined: {0}")]
    AlreadyDefined(String),

    #[error("host runtime does not support {0}")]
    Unsupported(&'static str),

    #[error("transformer already registered: {0}")]
    DuplicateTransformer(String),

    #[error("agent already attached: {0}")]
    AlreadyAttached(String),
}

pub type Result<T> = std::result::Result<T, Error>;
