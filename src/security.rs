//! Stateless security predicates.
//!
//! Each rule is a total function over the event: it either allows or denies
//! with a short user-visible reason, in O(|input|) time, and never panics.
//! Evaluation order is payload bounds, sensitive files, dangerous commands,
//! workspace escape (applied by the coordinator after path rewriting), then
//! git safety. First deny wins.
//!
//! False positives are acceptable; false negatives are not. The rules here
//! are a tripwire for catastrophic agent mistakes, not a sandbox.

use std::path::{Component, Path};

use serde_json::{Map, Value};

use crate::event::{EventKind, HookEvent, ToolKind, tool_input_path};

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Outcome of a security predicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// No rule fired.
    Allow,
    /// A rule fired; the tool call must be blocked.
    Deny {
        /// Short user-visible reason (≤200 chars).
        reason: String,
    },
}

impl Verdict {
    fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    /// Whether this verdict blocks the call.
    #[must_use]
    pub const fn is_deny(&self) -> bool {
        matches!(self, Self::Deny { .. })
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the stateless rules against one event.
///
/// Covers payload bounds (R4 is normally enforced at intake; a payload that
/// somehow reaches this layer oversized is denied), sensitive files,
/// dangerous shell commands, and git safety. Workspace-escape checks need
/// the agent's workspace binding and run in the coordinator.
#[must_use]
pub fn validate(event: &HookEvent, payload_len: usize, max_bytes: usize,
                protected_branches: &[String]) -> Verdict {
    if payload_len > max_bytes {
        return Verdict::deny(format!("blocked: payload exceeds {max_bytes} bytes"));
    }

    let EventKind::PreToolUse {
        tool_name,
        tool_input,
    } = &event.kind
    else {
        return Verdict::Allow;
    };

    let verdict = check_sensitive_file(tool_input);
    if verdict.is_deny() {
        return verdict;
    }

    if ToolKind::of(tool_name) == ToolKind::Shell {
        if let Some(command) = tool_input.get("command").and_then(Value::as_str) {
            let verdict = check_dangerous_command(command);
            if verdict.is_deny() {
                return verdict;
            }
            let verdict = check_git_safety(command, protected_branches);
            if verdict.is_deny() {
                return verdict;
            }
        }
    }

    Verdict::Allow
}

// ---------------------------------------------------------------------------
// R2 — sensitive files
// ---------------------------------------------------------------------------

/// Suffixes after `.env.` that are safe to expose.
const ENV_SAFE_SUFFIXES: [&str; 4] = ["example", "sample", "template", "test"];

/// Deny access to `.env` and `.env.<anything>` outside the safe-suffix
/// allow-list. Applies to every tool that names a file path, read or write.
#[must_use]
pub fn check_sensitive_file(tool_input: &Map<String, Value>) -> Verdict {
    let Some(path) = tool_input_path(tool_input) else {
        return Verdict::Allow;
    };
    let Some(name) = Path::new(path).file_name().and_then(|n| n.to_str()) else {
        return Verdict::Allow;
    };

    if name == ".env" {
        return Verdict::deny("blocked: .env access denied");
    }
    if let Some(suffix) = name.strip_prefix(".env.") {
        let safe = ENV_SAFE_SUFFIXES
            .iter()
            .any(|ok| suffix.eq_ignore_ascii_case(ok));
        if !safe {
            return Verdict::deny("blocked: .env access denied");
        }
    }
    Verdict::Allow
}

// ---------------------------------------------------------------------------
// R1 — dangerous commands
// ---------------------------------------------------------------------------

/// Filesystem roots that `rm -rf` must never target.
const RM_FORBIDDEN_TARGETS: [&str; 8] = ["/", "/*", "/.*", "~", "~/", "$HOME", "$HOME/", ".*"];

/// Deny catastrophic shell commands: recursive force-removal of roots,
/// device-level writes, filesystem creation, fork bombs.
///
/// The check runs on the whitespace-normalized command and again on a
/// trivially-unescaped form (backslashes and quotes stripped), so quoting
/// does not hide a pattern.
#[must_use]
pub fn check_dangerous_command(command: &str) -> Verdict {
    let normalized = normalize_command(command);
    let decoded = normalize_command(&trivial_unescape(command));

    for form in [normalized.as_str(), decoded.as_str()] {
        let verdict = check_one_form(form);
        if verdict.is_deny() {
            return verdict;
        }
    }
    Verdict::Allow
}

fn check_one_form(command: &str) -> Verdict {
    if command.contains(":(){") || command.contains(":|:&") {
        return Verdict::deny("blocked: fork bomb pattern");
    }

    let tokens: Vec<&str> = command.split(' ').filter(|t| !t.is_empty()).collect();

    for (i, token) in tokens.iter().enumerate() {
        let bare = token.rsplit('/').next().unwrap_or(token);

        if bare.starts_with("mkfs") {
            return Verdict::deny("blocked: dangerous mkfs command");
        }

        if bare == "dd" {
            let rest = &tokens[i + 1..];
            let zero_in = rest.iter().any(|t| *t == "if=/dev/zero");
            let dev_out = rest.iter().any(|t| t.starts_with("of=/dev/"));
            if zero_in && dev_out {
                return Verdict::deny("blocked: dangerous dd write to device");
            }
        }

        if bare == "rm" && rm_is_dangerous(&tokens[i + 1..]) {
            return Verdict::deny("blocked: dangerous rm pattern");
        }
    }

    Verdict::Allow
}

/// Whether the arguments after an `rm` token combine recursive+force flags
/// with a forbidden target.
fn rm_is_dangerous(args: &[&str]) -> bool {
    let mut recursive = false;
    let mut force = false;
    let mut hit_target = false;

    for arg in args {
        // Stop scanning at a shell separator; the next command is checked
        // by the outer token walk.
        if matches!(*arg, "&&" | "||" | ";" | "|") {
            break;
        }
        if let Some(flags) = arg.strip_prefix('-') {
            if !flags.starts_with('-') {
                recursive |= flags.contains('r') || flags.contains('R');
                force |= flags.contains('f');
            } else {
                recursive |= *arg == "--recursive";
                force |= *arg == "--force";
            }
            continue;
        }
        hit_target |= RM_FORBIDDEN_TARGETS.contains(arg);
    }

    recursive && force && hit_target
}

/// Collapse whitespace runs to single spaces and trim.
fn normalize_command(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip backslashes and quote characters so trivially-escaped commands
/// match the same patterns.
fn trivial_unescape(command: &str) -> String {
    command
        .chars()
        .filter(|c| !matches!(c, '\\' | '\'' | '"'))
        .collect()
}

// ---------------------------------------------------------------------------
// R3 — workspace escape
// ---------------------------------------------------------------------------

/// Check a file-mutating target against an agent's workspace boundary.
///
/// Called by the coordinator after path rewriting, so the common redirect
/// case has already succeeded by the time this runs. Targets outside the
/// project root entirely are left to the host's own permission model.
#[must_use]
pub fn check_workspace_escape(
    target: &Path,
    workspace: &Path,
    root: &Path,
    shared_artifacts: &[glob::Pattern],
) -> Verdict {
    if target.starts_with(workspace) {
        return Verdict::Allow;
    }
    if !target.starts_with(root) {
        return Verdict::Allow;
    }
    if let Ok(rel) = target.strip_prefix(root) {
        if shared_artifacts.iter().any(|p| p.matches_path(rel)) {
            return Verdict::Allow;
        }
    }
    Verdict::deny(format!(
        "blocked: write outside workspace ({})",
        mask_path(target.strip_prefix(root).unwrap_or(target))
    ))
}

// ---------------------------------------------------------------------------
// R5 — git safety
// ---------------------------------------------------------------------------

/// Deny force-pushes to and hard resets of protected branches. Heuristic,
/// best-effort: the branch must be named in the command to be recognized.
#[must_use]
pub fn check_git_safety(command: &str, protected_branches: &[String]) -> Verdict {
    let normalized = normalize_command(command);
    let tokens: Vec<&str> = normalized.split(' ').collect();

    let Some(git_pos) = tokens.iter().position(|t| {
        *t == "git" || t.rsplit('/').next() == Some("git")
    }) else {
        return Verdict::Allow;
    };
    let rest = &tokens[git_pos + 1..];

    let names_protected = |branch: &str| -> bool {
        rest.iter().any(|t| {
            *t == branch || t.rsplit('/').next() == Some(branch)
        })
    };

    if rest.contains(&"push") && (rest.contains(&"--force") || rest.contains(&"-f")) {
        for branch in protected_branches {
            if names_protected(branch) {
                return Verdict::deny(format!(
                    "blocked: force push to protected branch '{branch}'"
                ));
            }
        }
    }

    if rest.contains(&"reset") && rest.contains(&"--hard") {
        for branch in protected_branches {
            if names_protected(branch) {
                return Verdict::deny(format!(
                    "blocked: hard reset on protected branch '{branch}'"
                ));
            }
        }
    }

    Verdict::Allow
}

// ---------------------------------------------------------------------------
// Log masking
// ---------------------------------------------------------------------------

/// Mask a path for log records: keep the first component, elide the rest.
#[must_use]
pub fn mask_path(path: &Path) -> String {
    let mut components = path.components();
    let Some(first) = components.next() else {
        return String::new();
    };
    let first = match first {
        Component::RootDir => "/".to_owned(),
        other => other.as_os_str().to_string_lossy().into_owned(),
    };
    if components.next().is_some() {
        if first == "/" {
            "/…".to_owned()
        } else {
            format!("{first}/…")
        }
    } else {
        first
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
