//! End-to-end hook scenarios through the full wire path.
//!
//! Each test feeds JSON payloads through the bounded reader, classifier,
//! security validator, and coordinator, and asserts on the decision plus
//! the on-disk state it leaves behind.

mod common;

use serde_json::json;

use common::{TestProject, git_available, patched_path, read_stream};
use warden::event::Decision;
use warden::state::Phase;

// ---------------------------------------------------------------------------
// S1 — dangerous command blocked
// ---------------------------------------------------------------------------

#[test]
fn dangerous_rm_is_denied_and_audited() {
    let (project, guard) = TestProject::new_logged();

    let decision = project.pre_tool("Bash", json!({"command": "rm -rf /"}));
    assert_eq!(
        decision,
        Decision::Deny {
            reason: "blocked: dangerous rm pattern".to_owned()
        }
    );
    assert_eq!(decision.exit_code(), 2);
    assert_eq!(
        decision.to_json(),
        json!({"decision": "deny", "reason": "blocked: dangerous rm pattern"})
    );

    drop(guard);
    let security = read_stream(project.root(), "security.jsonl");
    assert!(
        security
            .iter()
            .any(|r| r["event"] == "security_deny"
                && r["reason"]
                    .as_str()
                    .is_some_and(|s| s.contains("dangerous rm"))),
        "security stream should record the deny: {security:?}"
    );
}

// ---------------------------------------------------------------------------
// S2 — env file blocked, safe suffix allowed
// ---------------------------------------------------------------------------

#[test]
fn env_file_read_is_denied() {
    let project = TestProject::new();
    let decision = project.pre_tool("Read", json!({"file_path": "/repo/.env"}));
    let Decision::Deny { reason } = decision else {
        panic!("expected deny, got {decision:?}");
    };
    assert!(reason.contains(".env"), "reason: {reason}");
}

#[test]
fn env_example_read_is_allowed() {
    let project = TestProject::new();
    let decision = project.pre_tool("Read", json!({"file_path": "/repo/.env.example"}));
    assert_eq!(decision, Decision::Allow);
}

// ---------------------------------------------------------------------------
// S3 — lazy workspace on first write
// ---------------------------------------------------------------------------

#[test]
fn spawn_registers_then_first_write_activates_and_rewrites() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let project = TestProject::new_git();

    // (1) spawn observation: pending agent, nothing materialized.
    let agent_id = project.spawn_agent("backend");
    assert_eq!(
        project.store().find_agent("sess01", &agent_id).unwrap().phase,
        Phase::Pending
    );
    assert!(!project.root().join("worktrees").join(&agent_id).exists());

    // (2) first write: activation + workspace + rewrite under the worktree.
    let target = project.root().join("src/x.rs");
    let decision = project.pre_tool(
        "Write",
        json!({"file_path": target.to_string_lossy(), "content": "pub fn x() {}"}),
    );
    let rewritten = patched_path(&decision).expect("decision should carry a rewrite");
    let workspace = project.root().join("worktrees").join(&agent_id);
    assert!(workspace.is_dir(), "worktree materialized");
    assert!(rewritten.starts_with(workspace.canonicalize().unwrap()));
    assert!(rewritten.ends_with("src/x.rs"));

    let view = project.store().find_agent("sess01", &agent_id).unwrap();
    assert_eq!(view.phase, Phase::Active);
    assert_eq!(
        view.meta.workspace_strategy.as_deref(),
        Some(warden::workspace::STRATEGY_VCS)
    );

    // (3) post_tool_use: state unchanged, nothing held.
    let post = project.post_tool(
        "Write",
        json!({"file_path": rewritten.to_string_lossy()}),
    );
    assert_eq!(post, Decision::Allow);
    assert_eq!(
        project.store().find_agent("sess01", &agent_id).unwrap().phase,
        Phase::Active
    );
    assert!(project.locks().held().is_empty());
}

#[test]
fn worktree_workspace_sees_repository_contents() {
    if !git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let project = TestProject::new_git();
    let agent_id = project.spawn_agent("backend");
    project.pre_tool("Write", json!({"file_path": "notes.txt"}));

    let workspace = project.root().join("worktrees").join(&agent_id);
    assert!(workspace.join("README.md").exists());
    assert!(workspace.join("src/lib.rs").exists());
}

// ---------------------------------------------------------------------------
// S4 — lock contention between two agents
// ---------------------------------------------------------------------------

#[test]
fn second_writer_is_denied_until_first_releases() {
    let project = TestProject::with_config(
        "workspace_strategy = \"plain-only\"\n\
         lock_acquire_timeout_ms = 20\n\
         shared_artifacts = [\"src/shared.rs\"]\n",
    );
    project.write_file("src/shared.rs", "// shared\n");
    let shared = project.root().join("src/shared.rs");
    let input = json!({"file_path": shared.to_string_lossy()});

    let agent_a = project.spawn_agent("backend");
    let first = project.pre_tool("Write", input.clone());
    assert_eq!(first, Decision::Allow, "agent A takes the lock");
    assert_eq!(project.locks().holder_of(&shared).unwrap().holder, agent_a);

    // A second agent spawns and tries the same path while A holds it. The
    // event is stamped so resolution cannot fall back to A.
    let agent_b = project.spawn_agent("tester");
    project
        .store()
        .activate_agent("sess01", &agent_b)
        .unwrap();
    let mut contended = project.event("pre_tool_use");
    contended["tool_name"] = json!("Write");
    contended["tool_input"] = input.clone();
    contended["agent_id"] = json!(agent_b);
    let decision = project.dispatch(&contended);
    let Decision::Deny { reason } = decision else {
        panic!("expected contention deny, got {decision:?}");
    };
    assert!(reason.contains(&agent_a), "reason names holder: {reason}");

    // A's post_tool_use releases; B's retry succeeds.
    let mut release = project.event("post_tool_use");
    release["tool_name"] = json!("Write");
    release["tool_input"] = input.clone();
    release["tool_response"] = json!({});
    release["agent_id"] = json!(agent_a);
    project.dispatch(&release);
    assert!(project.locks().holder_of(&shared).is_none());

    let mut retry = project.event("pre_tool_use");
    retry["tool_name"] = json!("Write");
    retry["tool_input"] = input;
    retry["agent_id"] = json!(agent_b);
    assert_eq!(project.dispatch(&retry), Decision::Allow);
    assert_eq!(project.locks().holder_of(&shared).unwrap().holder, agent_b);
}

// ---------------------------------------------------------------------------
// S5 — stale lock recovery
// ---------------------------------------------------------------------------

#[test]
fn crashed_holder_is_reclaimed_after_ttl() {
    let project = TestProject::with_config(
        "workspace_strategy = \"plain-only\"\nlock_ttl_sec = 1\n",
    );
    let path = project.root().join("contested.rs");

    // Simulate a holder that dies without releasing.
    project
        .locks()
        .try_acquire(&path, "dead-agent-1", "edit")
        .unwrap()
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(1100));

    let lease = project
        .locks()
        .acquire(
            &path,
            "survivor-2",
            "edit",
            std::time::Duration::from_millis(100),
        )
        .unwrap();
    assert_eq!(lease.holder, "survivor-2");
}

// ---------------------------------------------------------------------------
// S6 — session stop reaps pending agents
// ---------------------------------------------------------------------------

#[test]
fn stop_completes_pending_agent_with_detail() {
    let project = TestProject::new();
    let agent_id = project.spawn_agent("backend");

    let mut stop = project.event("stop");
    stop["stop_hook_active"] = json!(false);
    assert_eq!(project.dispatch(&stop), Decision::Allow);

    let view = project.store().find_agent("sess01", &agent_id).unwrap();
    assert_eq!(view.phase, Phase::Completed);
    assert_eq!(
        view.meta.status_detail.as_deref(),
        Some("session_stopped_before_activation")
    );
}

#[test]
fn stop_then_ttl_reaps_the_workspace() {
    let project = TestProject::with_config(
        "workspace_strategy = \"plain-only\"\nworkspace_ttl_hours = 1\n",
    );
    let agent_id = project.spawn_agent("backend");
    project.pre_tool("Write", json!({"file_path": "out.txt"}));
    let workspace = project
        .store()
        .find_agent("sess01", &agent_id)
        .unwrap()
        .meta
        .workspace_path
        .unwrap();
    assert!(workspace.exists());

    let mut stop = project.event("stop");
    stop["stop_hook_active"] = json!(false);
    project.dispatch(&stop);

    // Not old enough yet: the sweep keeps it.
    assert!(workspace.exists());

    // Age the completion stamp past the TTL, then sweep.
    project
        .store()
        .update_agent_meta("sess01", &agent_id, |meta| {
            meta.finished_ns = Some(
                warden::state::now_ns()
                    - std::time::Duration::from_secs(2 * 3600).as_nanos() as u64,
            );
        })
        .unwrap();
    let report = warden::reaper::Reaper::new(&project.ctx).sweep();
    assert_eq!(report.workspaces_removed, 1);
    assert!(!workspace.exists());
}

// ---------------------------------------------------------------------------
// Fail-open behaviors
// ---------------------------------------------------------------------------

#[test]
fn garbage_payload_is_allowed() {
    let project = TestProject::new();
    let decision = project
        .dispatcher
        .dispatch(std::io::Cursor::new(b"}{ bad".to_vec()));
    assert_eq!(decision, Decision::Allow);
}

#[test]
fn unknown_event_is_allowed() {
    let project = TestProject::new();
    let payload = project.event("hologram_sync");
    assert_eq!(project.dispatch(&payload), Decision::Allow);
}

#[test]
fn unknown_tool_with_env_path_is_still_denied() {
    let project = TestProject::new();
    let decision = project.pre_tool("FancyNewTool", json!({"file_path": ".env.production"}));
    assert!(matches!(decision, Decision::Deny { .. }));
}
