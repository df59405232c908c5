//! Hook event intake and decision emission.
//!
//! One warden process handles exactly one hook event: a single JSON
//! document on standard input, a single JSON decision on standard output.
//! The reader is bounded three ways — aggregate timeout, payload size with
//! progressive tier checks, and JSON nesting depth — so a hostile or broken
//! host can never wedge the hook.
//!
//! Event classification uses tagged variants rather than duck-typed maps:
//! unknown event names degrade to [`EventKind::Unknown`] (allow + warn)
//! without any structural assumptions about their payload.

use std::io::Read;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::error::WardenError;

// ---------------------------------------------------------------------------
// Read limits
// ---------------------------------------------------------------------------

/// Bounds applied to one hook payload read.
#[derive(Clone, Copy, Debug)]
pub struct ReadLimits {
    /// Aggregate budget for the whole read-and-parse.
    pub timeout: Duration,
    /// Maximum accepted payload size in bytes.
    pub max_bytes: usize,
    /// Maximum accepted JSON nesting depth.
    pub max_depth: usize,
}

impl Default for ReadLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(100),
            max_bytes: 1_048_576,
            max_depth: 32,
        }
    }
}

/// Size checkpoints at which an accumulating read re-checks the ceiling, so
/// a gradually-growing payload is rejected at the first tier past the limit
/// instead of after a full megabyte.
const SIZE_TIERS: [usize; 4] = [1 << 10, 10 << 10, 100 << 10, 1 << 20];

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

/// One inbound hook event, classified and validated.
#[derive(Clone, Debug, PartialEq)]
pub struct HookEvent {
    /// Host conversation id; generated when the host omitted one.
    pub session_id: String,
    /// Working directory the host reported for the event.
    pub cwd: PathBuf,
    /// Path to the conversation transcript, when the host provides one.
    pub transcript_path: Option<String>,
    /// Explicit agent identity, when the host stamps one on the event.
    pub agent_id: Option<String>,
    /// The classified event payload.
    pub kind: EventKind,
}

/// The eight known hook event kinds, plus a degrade-gracefully unknown.
#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    /// A tool is about to run. The only kind warden can block or rewrite.
    PreToolUse {
        tool_name: String,
        tool_input: Map<String, Value>,
    },
    /// A tool finished running.
    PostToolUse {
        tool_name: String,
        tool_input: Map<String, Value>,
        tool_response: Value,
    },
    /// The host surfaced a notification to the user.
    Notification { message: String },
    /// The user submitted a prompt.
    UserPromptSubmit { prompt: String },
    /// The main conversation is stopping.
    Stop { stop_hook_active: bool },
    /// A sub-agent finished.
    SubagentStop { stop_hook_active: bool },
    /// The host is about to compact the conversation.
    PreCompact {
        trigger: CompactTrigger,
        custom_instructions: String,
    },
    /// A session started.
    SessionStart { source: SessionSource },
    /// An event name this build does not know. Allowed with a warning.
    Unknown { name: String },
}

impl EventKind {
    /// Stable name for log records.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::PreToolUse { .. } => "pre_tool_use",
            Self::PostToolUse { .. } => "post_tool_use",
            Self::Notification { .. } => "notification",
            Self::UserPromptSubmit { .. } => "user_prompt_submit",
            Self::Stop { .. } => "stop",
            Self::SubagentStop { .. } => "subagent_stop",
            Self::PreCompact { .. } => "pre_compact",
            Self::SessionStart { .. } => "session_start",
            Self::Unknown { name } => name,
        }
    }
}

/// Why a pre-compact event fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactTrigger {
    Manual,
    Auto,
}

/// How a session came into being.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    Startup,
    Resume,
    Clear,
}

// ---------------------------------------------------------------------------
// Tool model
// ---------------------------------------------------------------------------

/// Coarse classification of a tool by its side effects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolKind {
    /// The host's sub-agent launcher.
    Spawn,
    /// Shell execution.
    Shell,
    /// Mutates a file named in its input.
    FileWrite,
    /// Reads a file named in its input.
    FileRead,
    /// Anything else.
    Other,
}

impl ToolKind {
    /// Classify a tool by its host-facing name.
    #[must_use]
    pub fn of(tool_name: &str) -> Self {
        match tool_name {
            "Task" => Self::Spawn,
            "Bash" => Self::Shell,
            "Write" | "Edit" | "MultiEdit" | "NotebookEdit" => Self::FileWrite,
            "Read" | "Glob" | "Grep" => Self::FileRead,
            _ => Self::Other,
        }
    }

    /// Whether this tool mutates the file named in its input.
    #[must_use]
    pub const fn mutates_files(self) -> bool {
        matches!(self, Self::FileWrite)
    }
}

/// The file path named by a tool input, if any.
///
/// Checked fields, in order: `file_path`, `notebook_path`, `path`.
#[must_use]
pub fn tool_input_path(tool_input: &Map<String, Value>) -> Option<&str> {
    tool_input_path_entry(tool_input).map(|(_, path)| path)
}

/// The path-carrying field of a tool input: `(field_name, path)`.
///
/// The field name is what a rewrite decision must patch.
#[must_use]
pub fn tool_input_path_entry(tool_input: &Map<String, Value>) -> Option<(&'static str, &str)> {
    ["file_path", "notebook_path", "path"]
        .iter()
        .find_map(|key| {
            tool_input
                .get(*key)
                .and_then(Value::as_str)
                .map(|path| (*key, path))
        })
}

// ---------------------------------------------------------------------------
// Bounded reading
// ---------------------------------------------------------------------------

/// Read and classify one hook event from standard input.
///
/// Returns the event together with the payload size in bytes.
///
/// # Errors
/// Returns [`WardenError::Input`] on timeout, size overflow, depth
/// overflow, or malformed JSON. The caller treats all of these as allow
/// (fail-open) and logs to the `security` stream.
pub fn read_event(limits: ReadLimits) -> Result<(HookEvent, usize), WardenError> {
    read_event_from(std::io::stdin(), limits)
}

/// Read and classify one hook event from an arbitrary reader.
///
/// The read and parse run on a worker thread so the aggregate timeout can
/// cover both; a reader that never reaches EOF leaves the detached worker
/// blocked, which is acceptable for a process that exits immediately after.
///
/// # Errors
/// See [`read_event`].
pub fn read_event_from<R>(reader: R, limits: ReadLimits) -> Result<(HookEvent, usize), WardenError>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    std::thread::spawn(move || {
        let outcome = read_and_parse(reader, limits);
        // The receiver may have timed out and gone away.
        let _ = tx.send(outcome);
    });

    match rx.recv_timeout(limits.timeout) {
        Ok(outcome) => outcome,
        Err(_) => Err(WardenError::Input {
            detail: format!("hook read timed out after {:?}", limits.timeout),
        }),
    }
}

fn read_and_parse<R: Read>(
    mut reader: R,
    limits: ReadLimits,
) -> Result<(HookEvent, usize), WardenError> {
    let mut buf: Vec<u8> = Vec::with_capacity(SIZE_TIERS[0]);
    let mut tier_idx = 0;

    loop {
        // One extra byte so a payload of exactly max_bytes is distinguishable
        // from an oversized one.
        let target = SIZE_TIERS
            .get(tier_idx)
            .copied()
            .unwrap_or(limits.max_bytes)
            .min(limits.max_bytes)
            + 1;
        let read = (&mut reader)
            .take((target - buf.len()) as u64)
            .read_to_end(&mut buf)
            .map_err(|e| WardenError::Input {
                detail: format!("could not read hook payload: {e}"),
            })?;

        if buf.len() > limits.max_bytes {
            return Err(WardenError::Input {
                detail: format!(
                    "payload exceeds {} bytes (rejected at {} bytes)",
                    limits.max_bytes,
                    buf.len()
                ),
            });
        }
        if read == 0 {
            break;
        }
        while tier_idx < SIZE_TIERS.len() && buf.len() >= SIZE_TIERS[tier_idx] {
            tier_idx += 1;
        }
    }

    check_depth(&buf, limits.max_depth)?;
    let payload_bytes = buf.len();
    parse_event(&buf).map(|event| (event, payload_bytes))
}

/// Scan raw JSON bytes and reject nesting deeper than `max_depth`.
///
/// Linear pre-pass over the bytes, tracking string/escape state, so depth
/// is bounded before the real parser ever recurses.
fn check_depth(bytes: &[u8], max_depth: usize) -> Result<(), WardenError> {
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;

    for &b in bytes {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                if depth > max_depth {
                    return Err(WardenError::Input {
                        detail: format!("JSON nesting exceeds {max_depth} levels"),
                    });
                }
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

fn parse_event(bytes: &[u8]) -> Result<HookEvent, WardenError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| WardenError::Input {
        detail: format!("malformed JSON: {e}"),
    })?;
    let Value::Object(fields) = value else {
        return Err(WardenError::Input {
            detail: "hook payload must be a JSON object".to_owned(),
        });
    };

    let name = required_str(&fields, "hook_event_name")?;
    let session_id = match fields.get("session_id").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s.to_owned(),
        _ => generated_session_id(),
    };
    let cwd = PathBuf::from(required_str(&fields, "cwd")?);
    let transcript_path = fields
        .get("transcript_path")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let agent_id = fields
        .get("agent_id")
        .and_then(Value::as_str)
        .map(str::to_owned);

    let kind = match name.as_str() {
        "pre_tool_use" => EventKind::PreToolUse {
            tool_name: required_str(&fields, "tool_name")?,
            tool_input: required_object(&fields, "tool_input")?,
        },
        "post_tool_use" => EventKind::PostToolUse {
            tool_name: required_str(&fields, "tool_name")?,
            tool_input: required_object(&fields, "tool_input")?,
            tool_response: fields
                .get("tool_response")
                .cloned()
                .unwrap_or(Value::Object(Map::new())),
        },
        "notification" => EventKind::Notification {
            message: required_str(&fields, "message")?,
        },
        "user_prompt_submit" => EventKind::UserPromptSubmit {
            prompt: required_str(&fields, "prompt")?,
        },
        "stop" => EventKind::Stop {
            stop_hook_active: optional_bool(&fields, "stop_hook_active"),
        },
        "subagent_stop" => EventKind::SubagentStop {
            stop_hook_active: optional_bool(&fields, "stop_hook_active"),
        },
        "pre_compact" => EventKind::PreCompact {
            trigger: typed_field(&fields, "trigger")?,
            custom_instructions: required_str(&fields, "custom_instructions")?,
        },
        "session_start" => EventKind::SessionStart {
            source: typed_field(&fields, "source")?,
        },
        other => EventKind::Unknown {
            name: other.to_owned(),
        },
    };

    Ok(HookEvent {
        session_id,
        cwd,
        transcript_path,
        agent_id,
        kind,
    })
}

fn required_str(fields: &Map<String, Value>, key: &str) -> Result<String, WardenError> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| WardenError::Input {
            detail: format!("missing or non-string field '{key}'"),
        })
}

fn required_object(fields: &Map<String, Value>, key: &str) -> Result<Map<String, Value>, WardenError> {
    match fields.get(key) {
        Some(Value::Object(map)) => Ok(map.clone()),
        _ => Err(WardenError::Input {
            detail: format!("missing or non-object field '{key}'"),
        }),
    }
}

fn optional_bool(fields: &Map<String, Value>, key: &str) -> bool {
    fields.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn typed_field<T: serde::de::DeserializeOwned>(
    fields: &Map<String, Value>,
    key: &str,
) -> Result<T, WardenError> {
    let value = fields.get(key).ok_or_else(|| WardenError::Input {
        detail: format!("missing field '{key}'"),
    })?;
    serde_json::from_value(value.clone()).map_err(|e| WardenError::Input {
        detail: format!("invalid field '{key}': {e}"),
    })
}

/// Session id for events the host sent without one.
fn generated_session_id() -> String {
    let ns = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    format!("anon-{ns:x}-{}", std::process::id())
}

// ---------------------------------------------------------------------------
// Decision emission
// ---------------------------------------------------------------------------

/// The outcome of one hook invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Let the tool call proceed unchanged.
    Allow,
    /// Let the tool call proceed with patched input fields.
    Rewrite {
        reason: String,
        tool_input_patch: Map<String, Value>,
    },
    /// Block the tool call.
    Deny { reason: String },
}

impl Decision {
    /// Process exit code mirroring the decision: `0` allow/rewrite, `2` deny.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Allow | Self::Rewrite { .. } => 0,
            Self::Deny { .. } => 2,
        }
    }

    /// The wire form written to standard output.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Allow => json!({ "decision": "allow" }),
            Self::Rewrite {
                reason,
                tool_input_patch,
            } => json!({
                "decision": "rewrite",
                "reason": reason,
                "rewrite": { "tool_input_patch": tool_input_patch },
            }),
            Self::Deny { reason } => json!({ "decision": "deny", "reason": reason }),
        }
    }

    /// Short label for log records.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Rewrite { .. } => "rewrite",
            Self::Deny { .. } => "deny",
        }
    }
}

/// Write the decision JSON to a writer (one line, newline-terminated).
///
/// # Errors
/// Propagates the underlying write error.
pub fn write_decision<W: std::io::Write>(mut w: W, decision: &Decision) -> std::io::Result<()> {
    serde_json::to_writer(&mut w, &decision.to_json())?;
    writeln!(w)
}

// ---------------------------------------------------------------------------
// Log excerpts
// ---------------------------------------------------------------------------

/// Maximum length of a string field in a log excerpt.
const EXCERPT_STRING_MAX: usize = 65_536;

/// Clone a JSON value with long strings truncated for logging.
///
/// Routing always sees the untruncated payload; only log records are
/// clipped.
#[must_use]
pub fn log_excerpt(value: &Value) -> Value {
    match value {
        Value::String(s) if s.len() > EXCERPT_STRING_MAX => {
            let mut end = EXCERPT_STRING_MAX;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            Value::String(format!("{}…[truncated]", &s[..end]))
        }
        Value::Array(items) => Value::Array(items.iter().map(log_excerpt).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), log_excerpt(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
