//! Background cleanup of locks, workspaces, and sessions.
//!
//! The reaper runs in three places: explicitly at session stop,
//! opportunistically once per N hook invocations, and as the standalone
//! `warden reap` command. Every removal target is validated against the
//! canonical roots before anything is deleted; a path that does not
//! descend from an expected root is refused and logged.

use std::path::Path;
use std::time::Duration;

use serde_json::json;

use crate::context::Context;
use crate::lock::LockManager;
use crate::logging::{EventLog, Stream};
use crate::state::{AgentView, Phase, SessionStatus, StateStore, now_ns};
use crate::workspace::WorkspaceProvisioner;

// ---------------------------------------------------------------------------
// SweepReport
// ---------------------------------------------------------------------------

/// What one reaper pass cleaned up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale locks reclaimed.
    pub stale_locks: usize,
    /// Workspaces torn down.
    pub workspaces_removed: usize,
    /// Sessions archived under `sessions/.archive/`.
    pub sessions_archived: usize,
    /// Archived sessions old enough to delete outright.
    pub sessions_deleted: usize,
}

impl SweepReport {
    /// Whether the pass changed anything.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.stale_locks == 0
            && self.workspaces_removed == 0
            && self.sessions_archived == 0
            && self.sessions_deleted == 0
    }
}

// ---------------------------------------------------------------------------
// Reaper
// ---------------------------------------------------------------------------

/// Sweeps expired coordination state.
pub struct Reaper {
    store: StateStore,
    locks: LockManager,
    provisioner: WorkspaceProvisioner,
    log: EventLog,
    sessions_dir: std::path::PathBuf,
    workspace_ttl: Duration,
    session_ttl: Duration,
}

impl Reaper {
    /// Build a reaper from the process context.
    #[must_use]
    pub fn new(ctx: &Context) -> Self {
        Self {
            store: ctx.store(),
            locks: ctx.locks(),
            provisioner: ctx.provisioner(),
            log: ctx.log.clone(),
            sessions_dir: ctx.paths.sessions_dir(),
            workspace_ttl: ctx.config.workspace_ttl(),
            session_ttl: ctx.config.session_ttl(),
        }
    }

    /// Run all three passes: stale locks, expired workspaces, old sessions.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport {
            stale_locks: self.locks.cleanup_stale(),
            ..SweepReport::default()
        };

        for (session_id, _meta) in self.store.sessions() {
            report.workspaces_removed += self.sweep_workspaces(&session_id);
        }
        let (archived, deleted) = self.sweep_sessions();
        report.sessions_archived = archived;
        report.sessions_deleted = deleted;

        if !report.is_empty() {
            self.log.log(
                Stream::Lifecycle,
                json!({
                    "event": "reaper_sweep",
                    "stale_locks": report.stale_locks,
                    "workspaces_removed": report.workspaces_removed,
                    "sessions_archived": report.sessions_archived,
                    "sessions_deleted": report.sessions_deleted,
                }),
            );
        }
        report
    }

    /// Remove workspaces of completed agents past the TTL, unless a live
    /// lock references the workspace or a live dependent agent names the
    /// owner in its lineage.
    fn sweep_workspaces(&self, session_id: &str) -> usize {
        let all = self.store.list_agents(session_id, None);
        let mut removed = 0;

        for view in &all {
            if view.phase != Phase::Completed {
                continue;
            }
            let Some(workspace) = view.meta.workspace_path.clone() else {
                continue;
            };
            if !workspace.exists() {
                continue;
            }
            let finished = view.meta.finished_ns.unwrap_or(view.meta.created_ns);
            if !self.expired(finished, self.workspace_ttl) {
                continue;
            }
            if self.locks.any_lock_under(&workspace) {
                continue;
            }
            if has_live_dependents(&all, &view.agent_id) {
                continue;
            }

            match self.provisioner.teardown(
                &view.agent_id,
                &workspace,
                view.meta.workspace_strategy.as_deref(),
            ) {
                Ok(()) => {
                    removed += 1;
                    self.log.log(
                        Stream::Lifecycle,
                        json!({
                            "event": "workspace_reaped",
                            "session": session_id,
                            "agent": view.agent_id,
                        }),
                    );
                }
                Err(e) => {
                    self.log.log(
                        Stream::Security,
                        json!({
                            "event": "workspace_reap_refused",
                            "session": session_id,
                            "agent": view.agent_id,
                            "error": e.to_string(),
                        }),
                    );
                }
            }
        }
        removed
    }

    /// Archive sessions whose agents have all completed and whose age is
    /// past the TTL; delete archived sessions past twice the TTL.
    fn sweep_sessions(&self) -> (usize, usize) {
        let mut archived = 0;
        let archive_dir = self.sessions_dir.join(".archive");

        for (session_id, meta) in self.store.sessions() {
            if !self.expired(meta.created_ns, self.session_ttl) {
                continue;
            }
            let agents = self.store.list_agents(&session_id, None);
            let all_done = agents.iter().all(|a| a.phase == Phase::Completed);
            if !all_done {
                continue;
            }
            if meta.status == SessionStatus::Active {
                // Stop never arrived; record the inferred terminal state
                // before archiving.
                let _ = self.store.mark_session(&session_id, SessionStatus::Completed);
            }

            let from = self.sessions_dir.join(&session_id);
            let to = archive_dir.join(&session_id);
            if !from.starts_with(&self.sessions_dir) {
                continue;
            }
            if std::fs::create_dir_all(&archive_dir).is_ok()
                && std::fs::rename(&from, &to).is_ok()
            {
                archived += 1;
            }
        }

        let deleted = self.sweep_archive(&archive_dir);
        (archived, deleted)
    }

    /// Delete archived sessions past twice the session TTL.
    fn sweep_archive(&self, archive_dir: &Path) -> usize {
        let Ok(entries) = std::fs::read_dir(archive_dir) else {
            return 0;
        };
        let mut deleted = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.starts_with(&self.sessions_dir) {
                continue;
            }
            let created_ns: Option<u64> = std::fs::read(path.join("meta.json"))
                .ok()
                .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
                .and_then(|meta| meta["created_ns"].as_u64());
            let Some(created_ns) = created_ns else {
                continue;
            };
            if self.expired(created_ns, self.session_ttl * 2)
                && std::fs::remove_dir_all(&path).is_ok()
            {
                deleted += 1;
            }
        }
        deleted
    }

    fn expired(&self, since_ns: u64, ttl: Duration) -> bool {
        let age_ns = now_ns().saturating_sub(since_ns);
        Duration::from_nanos(age_ns) >= ttl
    }
}

/// Whether any non-completed agent names `agent_id` as its parent.
fn has_live_dependents(agents: &[AgentView], agent_id: &str) -> bool {
    agents.iter().any(|view| {
        view.phase != Phase::Completed && view.meta.lineage.as_deref() == Some(agent_id)
    })
}

// ---------------------------------------------------------------------------
// Opportunistic sampling
// ---------------------------------------------------------------------------

/// Increment the persistent invocation counter and report whether this
/// invocation should run a sweep.
///
/// Best-effort read-modify-write: two concurrent hooks may observe the same
/// count, which at worst runs one extra sweep (sweeps are idempotent).
#[must_use]
pub fn should_sample(state_dir: &Path, every: u64) -> bool {
    let counter_path = state_dir.join("hook_counter");
    let count: u64 = std::fs::read_to_string(&counter_path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    let next = count.wrapping_add(1);
    if std::fs::create_dir_all(state_dir).is_ok() {
        let _ = std::fs::write(&counter_path, format!("{next}\n"));
    }
    every > 0 && next % every == 0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WardenConfig;
    use crate::logging::EventLog;
    use crate::paths::ProjectPaths;

    struct Fixture {
        dir: tempfile::TempDir,
        ctx: Context,
    }

    fn fixture(config_toml: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::resolve_from(dir.path());
        let mut config = WardenConfig::parse(config_toml).unwrap();
        config.normalize();
        let ctx = Context::from_parts(paths, config, EventLog::noop());
        Fixture { dir, ctx }
    }

    /// Register, activate, complete an agent with a plain workspace, then
    /// age it out by rewriting its timestamps.
    fn completed_agent_with_workspace(fx: &Fixture, finished_ns: u64) -> (String, std::path::PathBuf) {
        let store = fx.ctx.store();
        store.open_session("s1", fx.dir.path()).unwrap();
        let id = store.register_pending_agent("s1", "backend", None).unwrap();
        store.activate_agent("s1", &id).unwrap();
        let ws = fx.ctx.provisioner().ensure_workspace("s1", &id).unwrap();
        store.complete_agent("s1", &id, None).unwrap();
        store
            .update_agent_meta("s1", &id, |meta| {
                meta.finished_ns = Some(finished_ns);
            })
            .unwrap();
        (id, ws)
    }

    #[test]
    fn sweep_removes_expired_completed_workspace() {
        let fx = fixture(
            "workspace_strategy = \"plain-only\"\nworkspace_ttl_hours = 1\n",
        );
        let old = now_ns() - Duration::from_secs(2 * 3600).as_nanos() as u64;
        let (_id, ws) = completed_agent_with_workspace(&fx, old);
        assert!(ws.exists());

        let report = Reaper::new(&fx.ctx).sweep();
        assert_eq!(report.workspaces_removed, 1);
        assert!(!ws.exists());
    }

    #[test]
    fn sweep_keeps_fresh_workspace() {
        let fx = fixture(
            "workspace_strategy = \"plain-only\"\nworkspace_ttl_hours = 24\n",
        );
        let (_id, ws) = completed_agent_with_workspace(&fx, now_ns());

        let report = Reaper::new(&fx.ctx).sweep();
        assert_eq!(report.workspaces_removed, 0);
        assert!(ws.exists());
    }

    #[test]
    fn sweep_keeps_workspace_with_live_lock() {
        let fx = fixture(
            "workspace_strategy = \"plain-only\"\nworkspace_ttl_hours = 1\n",
        );
        let old = now_ns() - Duration::from_secs(2 * 3600).as_nanos() as u64;
        let (_id, ws) = completed_agent_with_workspace(&fx, old);

        let inside = ws.join("held.rs");
        std::fs::write(&inside, "x").unwrap();
        fx.ctx
            .locks()
            .try_acquire(&inside, "someone", "edit")
            .unwrap()
            .unwrap();

        let report = Reaper::new(&fx.ctx).sweep();
        assert_eq!(report.workspaces_removed, 0);
        assert!(ws.exists());
    }

    #[test]
    fn sweep_keeps_workspace_with_live_dependent() {
        let fx = fixture(
            "workspace_strategy = \"plain-only\"\nworkspace_ttl_hours = 1\n",
        );
        let old = now_ns() - Duration::from_secs(2 * 3600).as_nanos() as u64;
        let (parent, ws) = completed_agent_with_workspace(&fx, old);

        // A pending child keeps the parent's workspace alive.
        fx.ctx
            .store()
            .register_pending_agent("s1", "tester", Some(&parent))
            .unwrap();

        let report = Reaper::new(&fx.ctx).sweep();
        assert_eq!(report.workspaces_removed, 0);
        assert!(ws.exists());
    }

    #[test]
    fn sweep_reclaims_stale_locks() {
        let fx = fixture("lock_ttl_sec = 1\n");
        fx.ctx
            .locks()
            .try_acquire(Path::new("f.rs"), "agent-a", "edit")
            .unwrap()
            .unwrap();
        std::thread::sleep(Duration::from_millis(1100));

        let report = Reaper::new(&fx.ctx).sweep();
        assert_eq!(report.stale_locks, 1);
    }

    #[test]
    fn old_completed_session_is_archived() {
        let fx = fixture("session_ttl_hours = 1\nworkspace_strategy = \"plain-only\"\n");
        let store = fx.ctx.store();
        store.open_session("old-one", fx.dir.path()).unwrap();
        let id = store
            .register_pending_agent("old-one", "backend", None)
            .unwrap();
        store
            .complete_pending_agent("old-one", &id, Some("session_stopped_before_activation"))
            .unwrap();
        store
            .mark_session("old-one", SessionStatus::Completed)
            .unwrap();

        // Age the session by rewriting its creation stamp.
        let meta_path = store.session_dir("old-one").join("meta.json");
        let mut meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&meta_path).unwrap()).unwrap();
        meta["created_ns"] =
            json!(now_ns() - Duration::from_secs(2 * 3600).as_nanos() as u64);
        std::fs::write(&meta_path, serde_json::to_vec(&meta).unwrap()).unwrap();

        let report = Reaper::new(&fx.ctx).sweep();
        assert_eq!(report.sessions_archived, 1);
        assert!(!store.session_dir("old-one").exists());
        assert!(
            fx.ctx
                .paths
                .sessions_dir()
                .join(".archive/old-one")
                .is_dir()
        );
    }

    #[test]
    fn session_with_live_agents_is_not_archived() {
        let fx = fixture("session_ttl_hours = 0\n");
        let store = fx.ctx.store();
        store.open_session("busy", fx.dir.path()).unwrap();
        store.register_pending_agent("busy", "backend", None).unwrap();

        // With a zero TTL every session is old enough, so only the live
        // pending agent is holding the session back.
        let report = Reaper::new(&fx.ctx).sweep();
        assert_eq!(report.sessions_archived, 0);
        assert!(store.session_dir("busy").exists());
    }

    #[test]
    fn should_sample_fires_on_the_modulus() {
        let dir = tempfile::tempdir().unwrap();
        let mut fires = 0;
        for _ in 0..10 {
            if should_sample(dir.path(), 5) {
                fires += 1;
            }
        }
        assert_eq!(fires, 2);
    }

    #[test]
    fn empty_sweep_reports_empty() {
        let fx = fixture("");
        let report = Reaper::new(&fx.ctx).sweep();
        assert!(report.is_empty());
    }
}
