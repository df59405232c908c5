//! Process-wide context: resolved paths, configuration, log handle.
//!
//! One immutable [`Context`] value is built at startup and threaded through
//! every component — there is no global mutable state. The only process-wide
//! resource is the logging worker, whose guard the caller holds until exit.

use glob::Pattern;

use crate::config::WardenConfig;
use crate::error::WardenError;
use crate::lock::LockManager;
use crate::logging::{EventLog, LogGuard};
use crate::paths::ProjectPaths;
use crate::state::StateStore;
use crate::workspace::WorkspaceProvisioner;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Immutable per-process context.
#[derive(Clone)]
pub struct Context {
    /// Canonical project directories.
    pub paths: ProjectPaths,
    /// Validated configuration.
    pub config: WardenConfig,
    /// Non-blocking log handle.
    pub log: EventLog,
}

impl Context {
    /// Build a context for a hook invocation: config problems degrade to
    /// defaults (the hook must fail open), logging starts if possible.
    ///
    /// Returns the context, the log guard to hold until exit, and any
    /// configuration warnings to report.
    ///
    /// # Errors
    /// Only [`crate::paths::RootResolutionError`] is fatal, surfaced as
    /// [`WardenError::Infra`].
    pub fn for_hook() -> Result<(Self, LogGuard, Vec<String>), WardenError> {
        let paths = ProjectPaths::resolve()
            .map_err(|e| WardenError::Infra(std::io::Error::other(e.to_string())))?;
        let (config, mut warnings) = match WardenConfig::load(&paths.config_path()) {
            Ok(cfg) => (cfg, Vec::new()),
            Err(e) => (WardenConfig::default(), vec![e.to_string()]),
        };
        let mut config = config;
        warnings.extend(config.normalize());

        let (log, guard) = crate::logging::init(paths.logs_dir(), config.log_queue_capacity);
        Ok((Self { paths, config, log }, guard, warnings))
    }

    /// Build a context for an operator command: a broken config file is an
    /// error, not a silent default.
    ///
    /// # Errors
    /// [`WardenError::Config`] on config problems, [`WardenError::Infra`]
    /// when the root cannot be resolved.
    pub fn for_command() -> Result<(Self, LogGuard, Vec<String>), WardenError> {
        let paths = ProjectPaths::resolve()
            .map_err(|e| WardenError::Infra(std::io::Error::other(e.to_string())))?;
        let mut config = WardenConfig::load(&paths.config_path())?;
        let warnings = config.normalize();

        let (log, guard) = crate::logging::init(paths.logs_dir(), config.log_queue_capacity);
        Ok((Self { paths, config, log }, guard, warnings))
    }

    /// Build a context over explicit parts (tests, embedding).
    #[must_use]
    pub fn from_parts(paths: ProjectPaths, config: WardenConfig, log: EventLog) -> Self {
        Self { paths, config, log }
    }

    /// The session/agent registry.
    #[must_use]
    pub fn store(&self) -> StateStore {
        StateStore::new(self.paths.sessions_dir())
    }

    /// The lock manager.
    #[must_use]
    pub fn locks(&self) -> LockManager {
        LockManager::new(
            self.paths.locks_dir(),
            self.paths.root().to_owned(),
            self.config.lock_ttl(),
        )
    }

    /// The workspace provisioner.
    #[must_use]
    pub fn provisioner(&self) -> WorkspaceProvisioner {
        WorkspaceProvisioner::new(
            self.paths.root().to_owned(),
            self.paths.worktrees_dir(),
            self.paths.workspaces_dir(),
            self.config.workspace_strategy,
            self.store(),
            self.locks(),
        )
    }

    /// Compiled shared-artifact allow-list patterns. Invalid globs are
    /// skipped with a diagnostic rather than taking the hook down.
    #[must_use]
    pub fn shared_artifact_patterns(&self) -> Vec<Pattern> {
        self.config
            .shared_artifacts
            .iter()
            .filter_map(|raw| match Pattern::new(raw) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!(pattern = raw, error = %e, "invalid shared_artifacts glob");
                    None
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
