//! Warden configuration (`.warden.toml`).
//!
//! Typed configuration for the coordination core. Missing fields use
//! defaults; a missing file means all defaults (no error). Unknown keys are
//! collected for a logged warning rather than rejected — hook invocations
//! must not start failing because a newer config key landed on disk before
//! the binary was upgraded.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// WardenConfig
// ---------------------------------------------------------------------------

/// Top-level warden configuration.
///
/// Parsed from `<root>/.warden.toml`. Call [`WardenConfig::normalize`] after
/// loading to clamp out-of-range values back to defaults and collect
/// warnings for the caller to log.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct WardenConfig {
    /// Overall budget for reading and parsing one hook event from stdin.
    #[serde(default = "default_hook_timeout_ms")]
    pub hook_timeout_ms: u64,

    /// Maximum accepted hook payload size in bytes.
    #[serde(default = "default_hook_max_bytes")]
    pub hook_max_bytes: usize,

    /// Maximum accepted JSON nesting depth.
    #[serde(default = "default_hook_max_depth")]
    pub hook_max_depth: usize,

    /// Age after which a held lock is considered stale and reclaimable.
    #[serde(default = "default_lock_ttl_sec")]
    pub lock_ttl_sec: u64,

    /// Default bounded acquisition budget for tool-call locks.
    #[serde(default = "default_lock_acquire_timeout_ms")]
    pub lock_acquire_timeout_ms: u64,

    /// Workspace provisioning strategy.
    #[serde(default)]
    pub workspace_strategy: WorkspaceStrategy,

    /// Age after which a completed agent's workspace may be reaped.
    #[serde(default = "default_workspace_ttl_hours")]
    pub workspace_ttl_hours: u64,

    /// Age after which a fully-completed session is archived.
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: u64,

    /// Branch names protected from force-push and hard reset.
    #[serde(default = "default_protected_branches")]
    pub protected_branches: Vec<String>,

    /// Run an opportunistic reaper pass once per this many hook invocations.
    #[serde(default = "default_reaper_sample_every")]
    pub reaper_sample_every: u64,

    /// Bounded capacity of the async log queue.
    #[serde(default = "default_log_queue_capacity")]
    pub log_queue_capacity: usize,

    /// Root-relative glob patterns for paths any agent may write without
    /// workspace confinement. Empty by default.
    #[serde(default)]
    pub shared_artifacts: Vec<String>,

    /// Unknown keys, preserved for a warning. Never acted on.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, toml::Value>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            hook_timeout_ms: default_hook_timeout_ms(),
            hook_max_bytes: default_hook_max_bytes(),
            hook_max_depth: default_hook_max_depth(),
            lock_ttl_sec: default_lock_ttl_sec(),
            lock_acquire_timeout_ms: default_lock_acquire_timeout_ms(),
            workspace_strategy: WorkspaceStrategy::default(),
            workspace_ttl_hours: default_workspace_ttl_hours(),
            session_ttl_hours: default_session_ttl_hours(),
            protected_branches: default_protected_branches(),
            reaper_sample_every: default_reaper_sample_every(),
            log_queue_capacity: default_log_queue_capacity(),
            shared_artifacts: Vec::new(),
            unknown: BTreeMap::new(),
        }
    }
}

const fn default_hook_timeout_ms() -> u64 {
    100
}

const fn default_hook_max_bytes() -> usize {
    1_048_576
}

const fn default_hook_max_depth() -> usize {
    32
}

const fn default_lock_ttl_sec() -> u64 {
    300
}

const fn default_lock_acquire_timeout_ms() -> u64 {
    100
}

const fn default_workspace_ttl_hours() -> u64 {
    24
}

const fn default_session_ttl_hours() -> u64 {
    168
}

fn default_protected_branches() -> Vec<String> {
    vec!["main".to_owned(), "master".to_owned()]
}

const fn default_reaper_sample_every() -> u64 {
    100
}

const fn default_log_queue_capacity() -> usize {
    1024
}

// ---------------------------------------------------------------------------
// WorkspaceStrategy
// ---------------------------------------------------------------------------

/// How per-agent workspaces are materialized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkspaceStrategy {
    /// VCS worktree only; provisioning fails when the root is not a repo.
    VcsOnly,
    /// Plain directory only.
    PlainOnly,
    /// Prefer a VCS worktree, fall back to a plain directory.
    #[default]
    VcsOrFallback,
}

impl fmt::Display for WorkspaceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VcsOnly => write!(f, "vcs-only"),
            Self::PlainOnly => write!(f, "plain-only"),
            Self::VcsOrFallback => write!(f, "vcs-or-fallback"),
        }
    }
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

impl WardenConfig {
    /// Hook read budget as a [`Duration`].
    #[must_use]
    pub const fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }

    /// Stale-lock threshold as a [`Duration`].
    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_sec)
    }

    /// Default lock acquisition budget as a [`Duration`].
    #[must_use]
    pub const fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_ms)
    }

    /// Workspace reap threshold as a [`Duration`].
    #[must_use]
    pub const fn workspace_ttl(&self) -> Duration {
        Duration::from_secs(self.workspace_ttl_hours * 3600)
    }

    /// Session archive threshold as a [`Duration`].
    #[must_use]
    pub const fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_hours * 3600)
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

impl WardenConfig {
    /// Clamp out-of-range values back to their defaults.
    ///
    /// Returns one human-readable warning per substitution or unknown key.
    /// The config is left fully usable either way — hook invocations
    /// degrade to defaults instead of refusing to run.
    pub fn normalize(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.hook_timeout_ms == 0 {
            warnings.push(format!(
                "hook_timeout_ms must be positive; using default {}",
                default_hook_timeout_ms()
            ));
            self.hook_timeout_ms = default_hook_timeout_ms();
        }
        if self.hook_max_bytes == 0 {
            warnings.push(format!(
                "hook_max_bytes must be positive; using default {}",
                default_hook_max_bytes()
            ));
            self.hook_max_bytes = default_hook_max_bytes();
        }
        if self.hook_max_depth == 0 {
            warnings.push(format!(
                "hook_max_depth must be positive; using default {}",
                default_hook_max_depth()
            ));
            self.hook_max_depth = default_hook_max_depth();
        }
        if self.lock_ttl_sec == 0 {
            warnings.push(format!(
                "lock_ttl_sec must be positive; using default {}",
                default_lock_ttl_sec()
            ));
            self.lock_ttl_sec = default_lock_ttl_sec();
        }
        if self.reaper_sample_every == 0 {
            warnings.push(format!(
                "reaper_sample_every must be positive; using default {}",
                default_reaper_sample_every()
            ));
            self.reaper_sample_every = default_reaper_sample_every();
        }
        if self.log_queue_capacity == 0 {
            warnings.push(format!(
                "log_queue_capacity must be positive; using default {}",
                default_log_queue_capacity()
            ));
            self.log_queue_capacity = default_log_queue_capacity();
        }
        for key in self.unknown.keys() {
            warnings.push(format!("unknown config key '{key}' ignored"));
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading a warden configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<std::path::PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl WardenConfig {
    /// Load configuration from a TOML file.
    ///
    /// - If the file does not exist, returns all defaults (not an error).
    /// - If the file exists but contains invalid TOML, returns a
    ///   [`ConfigError`] with line-level detail.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found) or parse
    /// errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML or mistyped values.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
