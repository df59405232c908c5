//! Test infrastructure — self-contained warden projects in temp dirs.
#![allow(dead_code)]
//!
//! Provides [`TestProject`], an isolated project root with its own state
//! tree, config, and dispatcher. Each instance gets a unique temp dir,
//! optionally git-initialized for worktree-strategy tests, and cleans up
//! on drop.
//!
//! Events are fed through the real wire path: a JSON payload on an
//! in-memory reader, through the bounded reader, classifier, validator,
//! and coordinator.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::{Value, json};
use tempfile::TempDir;

use warden::config::WardenConfig;
use warden::context::Context;
use warden::coordinator::Coordinator;
use warden::dispatch::HookDispatcher;
use warden::event::Decision;
use warden::lock::LockManager;
use warden::logging::EventLog;
use warden::paths::ProjectPaths;
use warden::state::StateStore;
use warden::workspace::WorkspaceProvisioner;

// ---------------------------------------------------------------------------
// TestProject
// ---------------------------------------------------------------------------

/// A self-contained warden project in a temporary directory.
pub struct TestProject {
    dir: TempDir,
    pub ctx: Context,
    pub dispatcher: HookDispatcher,
}

impl TestProject {
    /// Plain-directory workspace strategy, default everything else.
    pub fn new() -> Self {
        Self::with_config("workspace_strategy = \"plain-only\"\n")
    }

    /// Custom `.warden.toml` contents.
    pub fn with_config(config_toml: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::resolve_from(dir.path());
        let mut config = WardenConfig::parse(config_toml).expect("test config");
        config.normalize();
        // In-memory readers never stall; keep the budget generous so a
        // slow CI machine cannot flake the read.
        config.hook_timeout_ms = 5000;
        let ctx = Context::from_parts(paths, config, EventLog::noop());
        let dispatcher = HookDispatcher::new(ctx.clone());
        Self {
            dir,
            ctx,
            dispatcher,
        }
    }

    /// Like [`TestProject::new`], but with the real logging worker so
    /// tests can assert on the JSONL streams. Drop the guard before
    /// reading the log files.
    pub fn new_logged() -> (Self, warden::logging::LogGuard) {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::resolve_from(dir.path());
        let mut config =
            WardenConfig::parse("workspace_strategy = \"plain-only\"\n").expect("test config");
        config.normalize();
        config.hook_timeout_ms = 5000;
        let (log, guard) = warden::logging::init(paths.logs_dir(), config.log_queue_capacity);
        let ctx = Context::from_parts(paths, config, log);
        let dispatcher = HookDispatcher::new(ctx.clone());
        (
            Self {
                dir,
                ctx,
                dispatcher,
            },
            guard,
        )
    }

    /// Git-initialized project with one seed commit, preferring the
    /// worktree workspace strategy.
    pub fn new_git() -> Self {
        let project = Self::with_config("workspace_strategy = \"vcs-or-fallback\"\n");
        project.git(&["init", "-q"]);
        project.git(&["config", "user.email", "test@example.com"]);
        project.git(&["config", "user.name", "test"]);
        std::fs::create_dir_all(project.root().join("src")).expect("mkdir src");
        project.write_file("src/lib.rs", "pub fn seed() {}\n");
        project.write_file("README.md", "seed\n");
        project.git(&["add", "."]);
        project.git(&["commit", "-q", "-m", "seed"]);
        project
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn store(&self) -> StateStore {
        self.ctx.store()
    }

    pub fn locks(&self) -> LockManager {
        self.ctx.locks()
    }

    pub fn provisioner(&self) -> WorkspaceProvisioner {
        self.ctx.provisioner()
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(&self.ctx)
    }

    pub fn write_file(&self, rel: &str, contents: &str) {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, contents).expect("write");
    }

    pub fn git(&self, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .expect("run git");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    // -- event plumbing --

    /// Base event payload for this project's session.
    pub fn event(&self, hook_event_name: &str) -> Value {
        json!({
            "hook_event_name": hook_event_name,
            "session_id": "sess01",
            "cwd": self.root().to_string_lossy(),
        })
    }

    /// Dispatch a JSON payload through the full wire path.
    pub fn dispatch(&self, payload: &Value) -> Decision {
        let bytes = serde_json::to_vec(payload).expect("serialize payload");
        self.dispatcher.dispatch(Cursor::new(bytes))
    }

    /// `pre_tool_use` shorthand.
    pub fn pre_tool(&self, tool_name: &str, tool_input: Value) -> Decision {
        let mut payload = self.event("pre_tool_use");
        payload["tool_name"] = json!(tool_name);
        payload["tool_input"] = tool_input;
        self.dispatch(&payload)
    }

    /// `post_tool_use` shorthand.
    pub fn post_tool(&self, tool_name: &str, tool_input: Value) -> Decision {
        let mut payload = self.event("post_tool_use");
        payload["tool_name"] = json!(tool_name);
        payload["tool_input"] = tool_input;
        payload["tool_response"] = json!({"ok": true});
        self.dispatch(&payload)
    }

    /// Spawn a sub-agent and return its freshly-registered pending id.
    pub fn spawn_agent(&self, role: &str) -> String {
        let decision = self.pre_tool("Task", json!({"subagent_type": role}));
        assert_eq!(decision, Decision::Allow, "spawn should be allowed");
        self.store()
            .find_pending_for_spawn("sess01", Some(role))
            .expect("pending agent registered")
    }
}

/// Whether git is runnable in this environment.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Logs directory contents of one stream as parsed JSON records.
pub fn read_stream(root: &Path, file_name: &str) -> Vec<Value> {
    let path = root.join("logs").join(file_name);
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .map(|line| serde_json::from_str(line).expect("valid JSONL record"))
        .collect()
}

/// Convenience for tests asserting on rewritten paths.
pub fn patched_path(decision: &Decision) -> Option<PathBuf> {
    match decision {
        Decision::Rewrite {
            tool_input_patch, ..
        } => tool_input_patch
            .get("file_path")
            .or_else(|| tool_input_patch.get("notebook_path"))
            .or_else(|| tool_input_patch.get("path"))
            .and_then(Value::as_str)
            .map(PathBuf::from),
        _ => None,
    }
}
