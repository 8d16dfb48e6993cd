//! Runtime error type.
//!
//! Subsystem init and free steps share [`RtError`] so that a context can surface the first init
//! error, or the last free error, whatever step produced it.

use exo_log::LogError;
use exo_svc::{
    context::ContextError,
    error::{ErrorKind, ResultCode, ToRawResultCode},
    mem::{MapError, UnmapError},
    signal::SigAltStackError,
};
use exo_sys_thread::{JoinError, SpawnError};
use exo_sys_thread_tls::{TlsFreeError, TlsInitError};

use crate::{arena::ArenaError, blockmap::BlockMapError, config::ConfigError};

/// Error type for runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RtError {
    /// A plain error kind, e.g. use of a static sub-object.
    #[error("{0}")]
    Kind(#[from] ErrorKind),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Static arena: {0}")]
    Arena(#[from] ArenaError),
    #[error("Block map: {0}")]
    BlockMap(#[from] BlockMapError),
    #[error("Log: {0}")]
    Log(#[from] LogError),
    #[error("Map: {0}")]
    Map(#[from] MapError),
    #[error("Unmap: {0}")]
    Unmap(#[from] UnmapError),
    #[error("TLS init: {0}")]
    TlsInit(#[from] TlsInitError),
    #[error("TLS free: {0}")]
    TlsFree(#[from] TlsFreeError),
    #[error("Alternate signal stack: {0}")]
    SigAltStack(#[from] SigAltStackError),
    #[error("Context switch: {0}")]
    Context(#[from] ContextError),
    #[error("Spawn: {0}")]
    Spawn(#[from] SpawnError),
    #[error("Join: {0}")]
    Join(#[from] JoinError),
}

impl RtError {
    /// The error a static sub-object reports when used.
    pub(crate) const fn invalid_state() -> Self {
        Self::Kind(ErrorKind::InvalidState)
    }
}

impl ToRawResultCode for RtError {
    fn to_rc(self) -> ResultCode {
        match self {
            Self::Kind(kind) => kind.to_rc(),
            Self::Config(err) => err.to_rc(),
            Self::Arena(err) => err.to_rc(),
            Self::BlockMap(err) => err.to_rc(),
            Self::Log(err) => err.to_rc(),
            Self::Map(err) => err.to_rc(),
            Self::Unmap(err) => err.to_rc(),
            Self::TlsInit(err) => err.to_rc(),
            Self::TlsFree(err) => err.to_rc(),
            Self::SigAltStack(err) => err.to_rc(),
            Self::Context(err) => err.to_rc(),
            Self::Spawn(err) => err.to_rc(),
            Self::Join(err) => err.to_rc(),
        }
    }
}
