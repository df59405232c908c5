//! Coordination of agents, workspaces, and locks.
//!
//! The coordinator is the integration point behind the dispatcher: it
//! watches spawn tool calls to register pending agents, promotes them to
//! active on their first observed activity, materializes workspaces lazily
//! on first write, rewrites tool paths into the owning workspace, and
//! arbitrates cross-workspace writes through the lock manager.
//!
//! Locks taken for a tool call live on disk, not in this process: the
//! matching `post_tool_use` event arrives in a fresh process, which
//! releases the lease by path and holder. A missing release is bounded by
//! the lock TTL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value, json};

use crate::context::Context;
use crate::error::WardenError;
use crate::event::{
    Decision, EventKind, HookEvent, ToolKind, tool_input_path, tool_input_path_entry,
};
use crate::lock::LockManager;
use crate::logging::{EventLog, Stream};
use crate::paths::canonicalize_best;
use crate::security::{Verdict, check_workspace_escape};
use crate::state::{AgentView, Phase, SessionStatus, StateStore};
use crate::workspace::{STRATEGY_VCS, WorkspaceProvisioner};

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Routes validated events to state, workspace, and lock operations.
pub struct Coordinator {
    store: StateStore,
    locks: LockManager,
    provisioner: WorkspaceProvisioner,
    log: EventLog,
    root: PathBuf,
    lock_timeout: Duration,
    shared: Vec<glob::Pattern>,
}

impl Coordinator {
    /// Build a coordinator from the process context.
    #[must_use]
    pub fn new(ctx: &Context) -> Self {
        Self {
            store: ctx.store(),
            locks: ctx.locks(),
            provisioner: ctx.provisioner(),
            log: ctx.log.clone(),
            root: canonicalize_best(ctx.paths.root(), ctx.paths.root()),
            lock_timeout: ctx.config.lock_acquire_timeout(),
            shared: ctx.shared_artifact_patterns(),
        }
    }

    /// Handle one validated event.
    ///
    /// # Errors
    /// Coordination failures surface as [`WardenError`]; the dispatcher
    /// maps them to allow or deny per the fail-open/fail-closed policy.
    pub fn handle(&self, event: &HookEvent) -> Result<Decision, WardenError> {
        match &event.kind {
            EventKind::PreToolUse {
                tool_name,
                tool_input,
            } => self.handle_pre_tool(event, tool_name, tool_input),
            EventKind::PostToolUse {
                tool_name,
                tool_input,
                ..
            } => self.handle_post_tool(event, tool_name, tool_input),
            EventKind::Stop { .. } => self.handle_stop(event),
            EventKind::SubagentStop { .. } => self.handle_subagent_stop(event),
            EventKind::SessionStart { .. }
            | EventKind::UserPromptSubmit { .. }
            | EventKind::Notification { .. }
            | EventKind::PreCompact { .. } => {
                self.store.open_session(&event.session_id, &event.cwd)?;
                Ok(Decision::Allow)
            }
            EventKind::Unknown { name } => {
                self.log.log(
                    Stream::Lifecycle,
                    json!({
                        "event": "unknown_hook_event",
                        "name": name,
                        "session": event.session_id,
                    }),
                );
                Ok(Decision::Allow)
            }
        }
    }

    // -- pre-tool --

    fn handle_pre_tool(
        &self,
        event: &HookEvent,
        tool_name: &str,
        tool_input: &Map<String, Value>,
    ) -> Result<Decision, WardenError> {
        self.store.open_session(&event.session_id, &event.cwd)?;
        let kind = ToolKind::of(tool_name);

        if kind == ToolKind::Spawn {
            return self.observe_spawn(event, tool_input);
        }

        let Some(agent) = self.resolve_agent(event) else {
            // Top-level conversation: no isolation, no locks.
            return Ok(Decision::Allow);
        };

        if agent.phase == Phase::Pending {
            self.store.activate_agent(&event.session_id, &agent.agent_id)?;
            self.log.log(
                Stream::Lifecycle,
                json!({
                    "event": "agent_activated",
                    "session": event.session_id,
                    "agent": agent.agent_id,
                }),
            );
        }

        if kind.mutates_files() {
            if let Some((field, raw)) = tool_input_path_entry(tool_input) {
                return self.route_write(event, &agent.agent_id, tool_name, field, raw);
            }
        }
        Ok(Decision::Allow)
    }

    /// A spawn tool call registers a pending agent; the workspace waits for
    /// the agent's first write.
    fn observe_spawn(
        &self,
        event: &HookEvent,
        tool_input: &Map<String, Value>,
    ) -> Result<Decision, WardenError> {
        let role = tool_input
            .get("subagent_type")
            .and_then(Value::as_str)
            .unwrap_or("agent");
        let parent = tool_input
            .get("parent_agent_id")
            .and_then(Value::as_str)
            .or(event.agent_id.as_deref());

        let agent_id = self
            .store
            .register_pending_agent(&event.session_id, role, parent)?;
        self.log.log(
            Stream::Lifecycle,
            json!({
                "event": "agent_registered",
                "session": event.session_id,
                "agent": agent_id,
                "role": role,
                "parent": parent,
            }),
        );
        Ok(Decision::Allow)
    }

    /// Route a file-mutating tool call from an active agent: materialize
    /// the workspace, rewrite the path, check the boundary, take a lock
    /// when the target lives outside the workspace.
    fn route_write(
        &self,
        event: &HookEvent,
        agent_id: &str,
        tool_name: &str,
        field: &'static str,
        raw: &str,
    ) -> Result<Decision, WardenError> {
        let workspace = self
            .provisioner
            .ensure_workspace(&event.session_id, agent_id)?;
        let workspace = canonicalize_best(&workspace, &self.root);

        let strategy = self
            .store
            .find_agent(&event.session_id, agent_id)
            .and_then(|view| view.meta.workspace_strategy);
        let rewrite_enabled = strategy.as_deref() == Some(STRATEGY_VCS);

        let raw_path = Path::new(raw);
        let (target, patched) = if raw_path.is_absolute() {
            let canonical = canonicalize_best(raw_path, &event.cwd);
            if !canonical.starts_with(&workspace)
                && canonical.starts_with(&self.root)
                && rewrite_enabled
            {
                // Redirect a root-relative write into the agent's worktree;
                // the worktree mirrors the repository layout by construction.
                let rel = canonical.strip_prefix(&self.root).unwrap_or(&canonical);
                if self.is_shared_artifact(rel) {
                    (canonical, None)
                } else {
                    let redirected = workspace.join(rel);
                    (canonicalize_best(&redirected, &workspace), Some(redirected))
                }
            } else {
                (canonical, None)
            }
        } else {
            // Relative paths resolve against the workspace, not the cwd.
            let resolved = workspace.join(raw_path);
            (canonicalize_best(&resolved, &workspace), Some(resolved))
        };

        let verdict = check_workspace_escape(&target, &workspace, &self.root, &self.shared);
        if let Verdict::Deny { reason } = verdict {
            self.log.log(
                Stream::Security,
                json!({
                    "event": "workspace_escape_denied",
                    "session": event.session_id,
                    "agent": agent_id,
                    "tool": tool_name,
                    "reason": reason,
                }),
            );
            return Ok(Decision::Deny { reason });
        }

        // Workspace-local writes take no global lock.
        if !target.starts_with(&workspace) {
            match self
                .locks
                .acquire(&target, agent_id, tool_name, self.lock_timeout)
            {
                Ok(lease) => {
                    self.log.log(
                        Stream::Audit,
                        json!({
                            "event": "lease_acquired",
                            "agent": agent_id,
                            "digest": lease.digest,
                            "tool": tool_name,
                        }),
                    );
                }
                Err(WardenError::LockContention { path, holder }) => {
                    let shown = path.strip_prefix(&self.root).unwrap_or(&path);
                    let reason =
                        format!("blocked: file {} locked by {holder}", shown.display());
                    self.log.log(
                        Stream::Audit,
                        json!({
                            "event": "lease_contended",
                            "agent": agent_id,
                            "holder": holder,
                            "tool": tool_name,
                        }),
                    );
                    return Ok(Decision::Deny { reason });
                }
                Err(other) => return Err(other),
            }
        }

        match patched {
            Some(new_path) if new_path != raw_path => {
                let mut patch = Map::new();
                patch.insert(
                    field.to_owned(),
                    Value::String(new_path.to_string_lossy().into_owned()),
                );
                Ok(Decision::Rewrite {
                    reason: "redirected into agent workspace".to_owned(),
                    tool_input_patch: patch,
                })
            }
            _ => Ok(Decision::Allow),
        }
    }

    // -- post-tool --

    fn handle_post_tool(
        &self,
        event: &HookEvent,
        tool_name: &str,
        tool_input: &Map<String, Value>,
    ) -> Result<Decision, WardenError> {
        self.store.open_session(&event.session_id, &event.cwd)?;

        if ToolKind::of(tool_name).mutates_files() {
            if let Some(raw) = tool_input_path(tool_input) {
                let target = canonicalize_best(Path::new(raw), &event.cwd);
                // The releasing identity: the resolved agent, or — when the
                // event carries no usable identity — whichever session agent
                // the lock metadata names.
                let holder = self
                    .resolve_agent(event)
                    .map(|view| view.agent_id)
                    .or_else(|| {
                        self.locks
                            .holder_of(&target)
                            .filter(|info| {
                                self.store.find_agent(&event.session_id, &info.holder).is_some()
                            })
                            .map(|info| info.holder)
                    });
                if let Some(holder) = holder {
                    let outcome = self.locks.release_path(&target, &holder)?;
                    self.log.log(
                        Stream::Audit,
                        json!({
                            "event": "lease_release",
                            "agent": holder,
                            "outcome": format!("{outcome:?}"),
                            "tool": tool_name,
                        }),
                    );
                }
            }
        }
        Ok(Decision::Allow)
    }

    // -- stop events --

    /// Session stop: every still-live agent is inferred completed, pending
    /// ones with a detail recording that they never activated.
    fn handle_stop(&self, event: &HookEvent) -> Result<Decision, WardenError> {
        self.store.open_session(&event.session_id, &event.cwd)?;
        let sid = &event.session_id;

        for view in self.store.list_agents(sid, Some(Phase::Active)) {
            self.release_agent_locks(&view.agent_id);
            self.store
                .complete_agent(sid, &view.agent_id, Some("session_stopped"))?;
        }
        for view in self.store.list_agents(sid, Some(Phase::Pending)) {
            self.store.complete_pending_agent(
                sid,
                &view.agent_id,
                Some("session_stopped_before_activation"),
            )?;
        }
        self.store.mark_session(sid, SessionStatus::Completed)?;
        self.log.log(
            Stream::Lifecycle,
            json!({ "event": "session_stopped", "session": sid }),
        );
        Ok(Decision::Allow)
    }

    fn handle_subagent_stop(&self, event: &HookEvent) -> Result<Decision, WardenError> {
        self.store.open_session(&event.session_id, &event.cwd)?;
        let sid = &event.session_id;

        let Some(agent) = self.resolve_stopping_agent(event) else {
            self.log.log(
                Stream::Lifecycle,
                json!({
                    "event": "subagent_stop_unresolved",
                    "session": sid,
                }),
            );
            return Ok(Decision::Allow);
        };

        self.release_agent_locks(&agent.agent_id);
        match agent.phase {
            Phase::Pending => self.store.complete_pending_agent(
                sid,
                &agent.agent_id,
                Some("stopped_before_activation"),
            )?,
            Phase::Active => {
                self.store
                    .complete_agent(sid, &agent.agent_id, Some("subagent_stop"))?;
            }
            Phase::Completed => {}
        }
        self.log.log(
            Stream::Lifecycle,
            json!({
                "event": "agent_completed",
                "session": sid,
                "agent": agent.agent_id,
            }),
        );
        Ok(Decision::Allow)
    }

    // -- resolution --

    /// Which agent an event belongs to: explicit id, then workspace
    /// containment of the cwd, then the oldest pending agent awaiting its
    /// first activity, then an unambiguous single active agent.
    fn resolve_agent(&self, event: &HookEvent) -> Option<AgentView> {
        let sid = &event.session_id;
        if let Some(id) = &event.agent_id {
            if let Some(view) = self.store.find_agent(sid, id) {
                return Some(view);
            }
        }
        if let Some(view) = self.store.find_agent_by_workspace(sid, &event.cwd) {
            return Some(view);
        }
        let canonical_cwd = canonicalize_best(&event.cwd, &self.root);
        if let Some(view) = self.store.find_agent_by_workspace(sid, &canonical_cwd) {
            return Some(view);
        }
        if let Some(pending) = self.store.find_pending_for_spawn(sid, None) {
            return self.store.find_agent(sid, &pending);
        }
        let active = self.store.list_agents(sid, Some(Phase::Active));
        match active.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        }
    }

    /// Which agent a `subagent_stop` refers to. Without an explicit id or a
    /// workspace-bound cwd, an unambiguous single active agent is used.
    fn resolve_stopping_agent(&self, event: &HookEvent) -> Option<AgentView> {
        let sid = &event.session_id;
        if let Some(id) = &event.agent_id {
            if let Some(view) = self.store.find_agent(sid, id) {
                return Some(view);
            }
        }
        if let Some(view) = self.store.find_agent_by_workspace(sid, &event.cwd) {
            return Some(view);
        }
        let active = self.store.list_agents(sid, Some(Phase::Active));
        match active.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        }
    }

    fn is_shared_artifact(&self, root_relative: &Path) -> bool {
        self.shared.iter().any(|p| p.matches_path(root_relative))
    }

    /// Best-effort release of every lease an agent still holds.
    fn release_agent_locks(&self, agent_id: &str) {
        for info in self.locks.held() {
            if info.holder == agent_id {
                let _ = self.locks.release_path(Path::new(&info.path), agent_id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
