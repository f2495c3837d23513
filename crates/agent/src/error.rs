use thiserror::Error;

/// Installation failures. All of them are fatal to the host.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InstallError {
    #[error("aegis agent already installed")]
    AlreadyInstalled,

    #[error("an earlier aegis install failed; the runtime cannot be re-armed")]
    PreviouslyFailed,

    #[error("cannot register interceptor")]
    Registration(#[source] runtime::Error),

    #[error("cannot retransform loaded units")]
    Retransform(#[source] runtime::Error),
}

pub type Result<T> = std::result::Result<T, InstallError>;
