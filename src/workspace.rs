//! Lazy per-agent workspace provisioning.
//!
//! A workspace does not exist until its agent first writes a file; the
//! first file-mutating tool call materializes it exactly once, no matter
//! how many hook processes race on it. The preferred strategy checks out a
//! dedicated branch (`agent/<agent_id>`) into a git worktree under
//! `worktrees/`; when that is unavailable the fallback is a bare directory
//! under `.state/workspaces/` — the agent then sees only what it creates.
//!
//! Idempotence is a per-agent provisioning lock plus a double-checked read
//! of the agent's metadata. The provisioner never removes a workspace;
//! teardown belongs to the reaper.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::config::WorkspaceStrategy;
use crate::error::WardenError;
use crate::lock::LockManager;
use crate::state::StateStore;

/// Strategy markers recorded in agent metadata.
pub const STRATEGY_VCS: &str = "vcs_worktree";
pub const STRATEGY_PLAIN: &str = "plain_dir";

/// Budget for the per-agent provisioning lock. Worktree creation can be
/// slow on large repos; this bounds how long a racing second call waits
/// for the winner rather than how long provisioning itself may take.
const PROVISION_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// WorkspaceProvisioner
// ---------------------------------------------------------------------------

/// Materializes isolated working trees for agents.
#[derive(Clone, Debug)]
pub struct WorkspaceProvisioner {
    root: PathBuf,
    worktrees_dir: PathBuf,
    workspaces_dir: PathBuf,
    strategy: WorkspaceStrategy,
    store: StateStore,
    locks: LockManager,
}

impl WorkspaceProvisioner {
    /// Create a provisioner.
    #[must_use]
    pub const fn new(
        root: PathBuf,
        worktrees_dir: PathBuf,
        workspaces_dir: PathBuf,
        strategy: WorkspaceStrategy,
        store: StateStore,
        locks: LockManager,
    ) -> Self {
        Self {
            root,
            worktrees_dir,
            workspaces_dir,
            strategy,
            store,
            locks,
        }
    }

    /// Ensure the agent's workspace exists and return its path.
    ///
    /// Idempotent: repeated and concurrent calls converge on the same path,
    /// created exactly once.
    ///
    /// # Errors
    /// [`WardenError::WorkspaceFailure`] when every configured strategy
    /// failed; the originating write should then be denied.
    pub fn ensure_workspace(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> Result<PathBuf, WardenError> {
        if let Some(existing) = self.bound_workspace(session_id, agent_id) {
            return Ok(existing);
        }

        let lock_key = self.provision_lock_key(agent_id);
        let lease = self
            .locks
            .acquire(&lock_key, agent_id, "workspace-provision", PROVISION_LOCK_TIMEOUT)
            .map_err(|e| match e {
                WardenError::LockContention { .. } => WardenError::WorkspaceFailure {
                    agent_id: agent_id.to_owned(),
                    detail: "another provisioning attempt is stuck holding the lock".to_owned(),
                },
                other => other,
            })?;

        // Double-checked: the lock winner may have bound it already.
        let result = match self.bound_workspace(session_id, agent_id) {
            Some(existing) => Ok(existing),
            None => self.provision(session_id, agent_id),
        };

        let _ = self.locks.release(&lease);
        result
    }

    /// The workspace already recorded in the agent's metadata, if any.
    fn bound_workspace(&self, session_id: &str, agent_id: &str) -> Option<PathBuf> {
        self.store
            .find_agent(session_id, agent_id)?
            .meta
            .workspace_path
    }

    fn provision_lock_key(&self, agent_id: &str) -> PathBuf {
        self.workspaces_dir.join(format!(".provision-{agent_id}"))
    }

    fn provision(&self, session_id: &str, agent_id: &str) -> Result<PathBuf, WardenError> {
        let (path, strategy) = match self.strategy {
            WorkspaceStrategy::VcsOnly => (self.provision_worktree(agent_id)?, STRATEGY_VCS),
            WorkspaceStrategy::PlainOnly => (self.provision_plain(agent_id)?, STRATEGY_PLAIN),
            WorkspaceStrategy::VcsOrFallback => match self.provision_worktree(agent_id) {
                Ok(path) => (path, STRATEGY_VCS),
                Err(vcs_err) => {
                    tracing::warn!(
                        agent = agent_id,
                        error = %vcs_err,
                        "worktree provisioning failed, falling back to plain directory"
                    );
                    (self.provision_plain(agent_id)?, STRATEGY_PLAIN)
                }
            },
        };

        self.store
            .update_agent_meta(session_id, agent_id, |meta| {
                meta.workspace_path = Some(path.clone());
                meta.workspace_strategy = Some(strategy.to_owned());
            })?;
        Ok(path)
    }

    /// Create a dedicated branch from `HEAD` and check it out as a worktree.
    fn provision_worktree(&self, agent_id: &str) -> Result<PathBuf, WardenError> {
        let target = self.worktrees_dir.join(agent_id);
        if target.join(".git").exists() {
            // A previous attempt finished the checkout but died before the
            // metadata write.
            return Ok(target);
        }
        if !self.root.join(".git").exists() {
            return Err(self.workspace_failure(agent_id, "project root is not a git repository"));
        }
        std::fs::create_dir_all(&self.worktrees_dir)?;

        let branch = format!("agent/{agent_id}");
        let target_str = target.to_string_lossy().into_owned();
        self.git(&["worktree", "add", "-b", &branch, &target_str, "HEAD"])
            .map_err(|stderr| self.workspace_failure(agent_id, &stderr))?;
        Ok(target)
    }

    fn provision_plain(&self, agent_id: &str) -> Result<PathBuf, WardenError> {
        let target = self.workspaces_dir.join(agent_id);
        std::fs::create_dir_all(&target).map_err(|e| {
            self.workspace_failure(agent_id, &format!("could not create fallback dir: {e}"))
        })?;
        Ok(target)
    }

    /// Remove an agent's workspace. Reaper-only; validates that the target
    /// descends from a directory this provisioner owns.
    ///
    /// # Errors
    /// [`WardenError::Infra`] when the path is outside the owned roots or
    /// removal fails.
    pub fn teardown(&self, agent_id: &str, path: &Path, strategy: Option<&str>) -> Result<(), WardenError> {
        let under_worktrees = path.starts_with(&self.worktrees_dir);
        let under_workspaces = path.starts_with(&self.workspaces_dir);
        if !under_worktrees && !under_workspaces {
            return Err(WardenError::Infra(std::io::Error::other(format!(
                "refusing to remove '{}': not under a workspace root",
                path.display()
            ))));
        }
        if !path.exists() {
            return Ok(());
        }

        if strategy == Some(STRATEGY_VCS) && under_worktrees {
            let path_str = path.to_string_lossy().into_owned();
            let removed = self
                .git(&["worktree", "remove", "--force", &path_str])
                .is_ok();
            let _ = self.git(&["branch", "-D", &format!("agent/{agent_id}")]);
            if removed {
                return Ok(());
            }
            // Fall through to a plain delete when git has lost track of it.
        }
        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    fn workspace_failure(&self, agent_id: &str, detail: &str) -> WardenError {
        WardenError::WorkspaceFailure {
            agent_id: agent_id.to_owned(),
            detail: detail.to_owned(),
        }
    }

    /// Run a git command at the project root, returning stderr on failure.
    fn git(&self, args: &[&str]) -> Result<String, String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|e| format!("could not run git: {e}"))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(format!(
                "`git {}` failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
