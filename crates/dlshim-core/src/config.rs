//! Runtime configuration.
//!
//! Read from the environment once, when a context is created:
//! - `DLSHIM_MODE`: `strict` (default) forwards handles to the host as-is.
//!   `hardened` checks a real handle against the host module table before
//!   `dlclose` or a scoped `dlsym`, reporting an invalid-handle error instead
//!   of handing the host a stale handle.
//! - `DLSHIM_ERROR_SCOPE`: `process` (default) keeps one `dlerror` slot for
//!   the whole process; `thread` keeps one per thread.
//! - `DLSHIM_LOG`: path of a JSONL structured log. Unset disables logging.

use std::path::PathBuf;

pub const ENV_MODE: &str = "DLSHIM_MODE";
pub const ENV_ERROR_SCOPE: &str = "DLSHIM_ERROR_SCOPE";
pub const ENV_LOG: &str = "DLSHIM_LOG";

/// Handle validation level.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafetyLevel {
    /// Forward every handle to the host untouched, like the host loader would.
    #[default]
    Strict,
    /// Reject handles the host module table does not know.
    Hardened,
}

impl SafetyLevel {
    /// Parse from string (case-insensitive). Unknown values mean `Strict`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "hardened" | "validate" | "checked" => Self::Hardened,
            _ => Self::Strict,
        }
    }

    #[must_use]
    pub const fn validates_handles(self) -> bool {
        matches!(self, Self::Hardened)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Hardened => "hardened",
        }
    }
}

/// Where pending `dlerror` messages live.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorScope {
    #[default]
    Process,
    Thread,
}

impl ErrorScope {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" | "per-thread" | "tls" => Self::Thread,
            _ => Self::Process,
        }
    }
}

/// Complete shim configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShimConfig {
    pub mode: SafetyLevel,
    pub error_scope: ErrorScope,
    pub log_path: Option<PathBuf>,
}

impl ShimConfig {
    /// Read the `DLSHIM_*` variables from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mode = lookup(ENV_MODE)
            .map(|v| SafetyLevel::from_str_loose(&v))
            .unwrap_or_default();
        let error_scope = lookup(ENV_ERROR_SCOPE)
            .map(|v| ErrorScope::from_str_loose(&v))
            .unwrap_or_default();
        let log_path = lookup(ENV_LOG)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        Self {
            mode,
            error_scope,
            log_path,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: SafetyLevel) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_error_scope(mut self, scope: ErrorScope) -> Self {
        self.error_scope = scope;
        self
    }
}
