//! Runtime configuration.

use core::{fmt, str::FromStr};

use exo_svc::error::{ErrorKind, ResultCode, ToRawResultCode};
use exo_sys_thread_tls::{TlsLayout, USER_AREA_OFFSET};
use log::LevelFilter;

use crate::{process::ProcessContext, thread_context::ThreadContext};

/// Default static arena size in bytes.
pub const DEFAULT_ARENA_SIZE: usize = 4 * 1024;

/// Alignment of the runtime records placed in a TLS user area.
pub(crate) const AREA_ALIGN: usize = 64;

/// How thread contexts map onto OS threads.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Topology {
    /// Every runtime thread owns a thread context; all share the process context.
    #[default]
    PerThread,
    /// The process runs a single thread context. Spawning runtime threads is rejected.
    Shared,
}

impl FromStr for Topology {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-thread" => Ok(Self::PerThread),
            "shared" => Ok(Self::Shared),
            _ => Err(ConfigError::UnknownTopology),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PerThread => "per-thread",
            Self::Shared => "shared",
        })
    }
}

/// Process-wide runtime settings. Copied into the process context at init.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub topology: Topology,
    pub log_level: LevelFilter,
    /// Pages per thread log buffer.
    pub log_pages: usize,
    /// Bytes of the static arena carved from the main thread's TLS user area.
    pub arena_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            topology: Topology::PerThread,
            log_level: LevelFilter::Info,
            log_pages: 1,
            arena_size: DEFAULT_ARENA_SIZE,
        }
    }
}

impl RuntimeConfig {
    /// The default configuration with overrides from `EXO_LOG`, `EXO_TOPOLOGY` and
    /// `EXO_LOG_PAGES`. Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up through `var`.
    pub fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = var("EXO_LOG") {
            match value.parse::<LevelFilter>() {
                Ok(level) => self.log_level = level,
                Err(_) => log::warn!("config: ignoring EXO_LOG={value}"),
            }
        }
        if let Some(value) = var("EXO_TOPOLOGY") {
            match value.parse::<Topology>() {
                Ok(topology) => self.topology = topology,
                Err(_) => log::warn!("config: ignoring EXO_TOPOLOGY={value}"),
            }
        }
        if let Some(value) = var("EXO_LOG_PAGES") {
            match value.parse::<usize>() {
                Ok(pages) => self.log_pages = pages,
                Err(_) => log::warn!("config: ignoring EXO_LOG_PAGES={value}"),
            }
        }
        self
    }

    /// Checks the settings against the TLS layout of this system.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_pages == 0 {
            return Err(ConfigError::ZeroLogPages);
        }
        let max = max_arena_size();
        if self.arena_size > max {
            return Err(ConfigError::ArenaTooLarge {
                size: self.arena_size,
                max,
            });
        }
        Ok(())
    }
}

/// Bytes of the main thread's user area left for the static arena once the process and thread
/// contexts are placed.
pub fn max_arena_size() -> usize {
    let user_area = TlsLayout::current().vars_size - USER_AREA_OFFSET;
    user_area.saturating_sub(contexts_size())
}

/// Bytes taken by the context records at the start of a user area.
pub(crate) const fn contexts_size() -> usize {
    round_up(size_of::<ThreadContext>(), AREA_ALIGN)
        + round_up(size_of::<ProcessContext>(), AREA_ALIGN)
}

pub(crate) const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Error type for [`RuntimeConfig::validate`] and parsing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Thread log needs at least one page")]
    ZeroLogPages,
    #[error("Arena of {size} bytes exceeds the {max} available")]
    ArenaTooLarge { size: usize, max: usize },
    #[error("Unknown topology")]
    UnknownTopology,
}

impl ToRawResultCode for ConfigError {
    fn to_rc(self) -> ResultCode {
        ErrorKind::InvalidArgument.to_rc()
    }
}
