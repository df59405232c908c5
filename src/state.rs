//! Session and agent registry on the filesystem.
//!
//! Every mutation goes through an atomic primitive: exclusive `mkdir` for
//! creation, `rename` for phase transitions and metadata replacement. There
//! is no read-modify-write on shared JSON anywhere — a reader sees either
//! the old state or the new state, never a half-written one.
//!
//! An agent's phase is encoded by which directory holds it:
//! `agents/pending/<id>`, `agents/active/<id>`, or `agents/completed/<id>`.
//! Exactly one of the three exists at any observable moment, because the
//! transition is a single `rename`.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::WardenError;

/// Bounded retries for the agent counter allocation race.
const COUNTER_RETRIES: u32 = 16;

/// Current time as nanoseconds since the epoch.
///
/// Saturates instead of failing on a pre-epoch clock; a warped clock should
/// never take the coordination plane down.
#[must_use]
pub fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Agent lifecycle phase, encoded as the containing directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Pending,
    Active,
    Completed,
}

impl Phase {
    /// All phases, in lifecycle order.
    pub const ALL: [Self; 3] = [Self::Pending, Self::Active, Self::Completed];

    /// Directory name under `agents/`.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Session status recorded in `meta.json`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

/// Per-session metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    /// Creation time, nanoseconds since the epoch.
    pub created_ns: u64,
    /// Current status.
    pub status: SessionStatus,
    /// Working directory at session start.
    pub cwd: PathBuf,
    /// Parent session for forked sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<String>,
}

/// Per-agent metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMeta {
    /// The role the agent was spawned with.
    pub role: String,
    /// Registration time.
    pub created_ns: u64,
    /// First observed activity, set on activation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_ns: Option<u64>,
    /// Completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_ns: Option<u64>,
    /// Materialized workspace, once provisioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<PathBuf>,
    /// How the workspace was materialized (`vcs_worktree` | `plain_dir`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_strategy: Option<String>,
    /// Parent agent id, when the spawn event carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<String>,
    /// Free-form detail for the final transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_detail: Option<String>,
}

/// One agent as observed in the registry.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentView {
    pub agent_id: String,
    pub phase: Phase,
    pub meta: AgentMeta,
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Handle on the sessions tree (`<state>/sessions`).
#[derive(Clone, Debug)]
pub struct StateStore {
    sessions_dir: PathBuf,
}

impl StateStore {
    /// Create a store rooted at the given sessions directory.
    #[must_use]
    pub const fn new(sessions_dir: PathBuf) -> Self {
        Self { sessions_dir }
    }

    /// The directory of one session.
    #[must_use]
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(sanitize_component(session_id))
    }

    fn agents_dir(&self, session_id: &str, phase: Phase) -> PathBuf {
        self.session_dir(session_id)
            .join("agents")
            .join(phase.dir_name())
    }

    fn agent_dir(&self, session_id: &str, phase: Phase, agent_id: &str) -> PathBuf {
        self.agents_dir(session_id, phase).join(agent_id)
    }

    // -- sessions --

    /// Open (or create) a session. Idempotent.
    ///
    /// Creation writes `meta.json` exactly once; concurrent opens race on
    /// the exclusive create and the loser reads the winner's file. A legacy
    /// `pending_agents.json` in the session directory is migrated to the
    /// directory layout on first open.
    ///
    /// # Errors
    /// Propagates filesystem errors as [`WardenError::Infra`].
    pub fn open_session(&self, session_id: &str, cwd: &Path) -> Result<SessionMeta, WardenError> {
        let dir = self.session_dir(session_id);
        for phase in Phase::ALL {
            std::fs::create_dir_all(self.agents_dir(session_id, phase))?;
        }

        let meta_path = dir.join("meta.json");
        let meta = SessionMeta {
            created_ns: now_ns(),
            status: SessionStatus::Active,
            cwd: cwd.to_owned(),
            parent_session: None,
        };
        match write_json_new(&meta_path, &meta) {
            Ok(()) => {
                self.migrate_legacy_pending(session_id)?;
                Ok(meta)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                self.migrate_legacy_pending(session_id)?;
                Ok(read_json(&meta_path).unwrap_or(meta))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a session's metadata, if the session exists.
    #[must_use]
    pub fn session_meta(&self, session_id: &str) -> Option<SessionMeta> {
        read_json(&self.session_dir(session_id).join("meta.json"))
    }

    /// Update a session's status by atomic metadata replacement.
    ///
    /// # Errors
    /// Fails when the session does not exist.
    pub fn mark_session(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), WardenError> {
        let meta_path = self.session_dir(session_id).join("meta.json");
        let mut meta: SessionMeta =
            read_json(&meta_path).ok_or_else(|| WardenError::StateConflict {
                detail: format!("session '{session_id}' has no metadata"),
            })?;
        meta.status = status;
        write_json_replace(&meta_path, &meta)?;
        Ok(())
    }

    /// All known sessions with their metadata.
    #[must_use]
    pub fn sessions(&self) -> Vec<(String, SessionMeta)> {
        let Ok(entries) = std::fs::read_dir(&self.sessions_dir) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if let Some(meta) = read_json(&entry.path().join("meta.json")) {
                out.push((name, meta));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    // -- agent registration --

    /// Register a new pending agent and return its id.
    ///
    /// The counter is the next integer absent from both `pending/` and
    /// `active/`; concurrent registrars race on the exclusive `mkdir` and
    /// the loser retries with the next counter, bounded at 16 attempts.
    ///
    /// # Errors
    /// [`WardenError::StateConflict`] when every retry lost its race;
    /// [`WardenError::Infra`] on filesystem errors.
    pub fn register_pending_agent(
        &self,
        session_id: &str,
        role: &str,
        parent: Option<&str>,
    ) -> Result<String, WardenError> {
        let role = sanitize_role(role);
        let short = session_short(session_id);

        let mut counter = self.next_counter(session_id)?;
        for _ in 0..COUNTER_RETRIES {
            let agent_id = format!("{role}-{short}-{counter}");
            let dir = self.agent_dir(session_id, Phase::Pending, &agent_id);
            match std::fs::create_dir(&dir) {
                Ok(()) => {
                    let meta = AgentMeta {
                        role,
                        created_ns: now_ns(),
                        lineage: parent.map(str::to_owned),
                        ..AgentMeta::default()
                    };
                    write_json_replace(&dir.join("meta.json"), &meta)?;
                    return Ok(agent_id);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    counter += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Session skeleton missing (first event raced open_session).
                    std::fs::create_dir_all(self.agents_dir(session_id, Phase::Pending))?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(WardenError::StateConflict {
            detail: format!(
                "agent counter collision after {COUNTER_RETRIES} retries in session '{session_id}'"
            ),
        })
    }

    /// Highest counter present in `pending/` or `active/`, plus one.
    fn next_counter(&self, session_id: &str) -> Result<u64, WardenError> {
        let mut max = 0;
        for phase in [Phase::Pending, Phase::Active] {
            for view in self.list_agents(session_id, Some(phase)) {
                if let Some(n) = counter_of(&view.agent_id) {
                    max = max.max(n);
                }
            }
        }
        Ok(max + 1)
    }

    // -- transitions --

    /// Promote a pending agent to active.
    ///
    /// Idempotent: if the agent is already active, succeeds without change.
    ///
    /// # Errors
    /// [`WardenError::StateConflict`] when the agent is completed (backward
    /// transitions are forbidden) or unknown.
    pub fn activate_agent(&self, session_id: &str, agent_id: &str) -> Result<(), WardenError> {
        let from = self.agent_dir(session_id, Phase::Pending, agent_id);
        let to = self.agent_dir(session_id, Phase::Active, agent_id);

        match std::fs::rename(&from, &to) {
            Ok(()) => {
                self.update_agent_meta(session_id, agent_id, |meta| {
                    meta.started_ns = Some(now_ns());
                })?;
                Ok(())
            }
            Err(_) if to.exists() => Ok(()),
            Err(_)
                if self
                    .agent_dir(session_id, Phase::Completed, agent_id)
                    .exists() =>
            {
                Err(WardenError::StateConflict {
                    detail: format!("agent '{agent_id}' is already completed"),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(WardenError::StateConflict {
                    detail: format!("agent '{agent_id}' is not registered in session"),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move an active agent to completed.
    ///
    /// Idempotent: completing a completed agent is a no-op.
    ///
    /// # Errors
    /// [`WardenError::StateConflict`] when the agent is unknown.
    pub fn complete_agent(
        &self,
        session_id: &str,
        agent_id: &str,
        status_detail: Option<&str>,
    ) -> Result<(), WardenError> {
        let from = self.agent_dir(session_id, Phase::Active, agent_id);
        self.complete_from(session_id, agent_id, &from, status_detail)
    }

    /// Move a pending agent straight to completed.
    ///
    /// Only legal at session teardown, for agents that never activated.
    ///
    /// # Errors
    /// [`WardenError::StateConflict`] when the agent is unknown.
    pub fn complete_pending_agent(
        &self,
        session_id: &str,
        agent_id: &str,
        status_detail: Option<&str>,
    ) -> Result<(), WardenError> {
        let from = self.agent_dir(session_id, Phase::Pending, agent_id);
        self.complete_from(session_id, agent_id, &from, status_detail)
    }

    fn complete_from(
        &self,
        session_id: &str,
        agent_id: &str,
        from: &Path,
        status_detail: Option<&str>,
    ) -> Result<(), WardenError> {
        let to = self.agent_dir(session_id, Phase::Completed, agent_id);
        match std::fs::rename(from, &to) {
            Ok(()) => {
                self.update_agent_meta(session_id, agent_id, |meta| {
                    meta.finished_ns = Some(now_ns());
                    meta.status_detail = status_detail.map(str::to_owned);
                })?;
                Ok(())
            }
            Err(_) if to.exists() => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(WardenError::StateConflict {
                    detail: format!("agent '{agent_id}' is not registered in session"),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    // -- queries --

    /// List agents of a session, optionally filtered to one phase.
    ///
    /// A directory listing may miss an in-flight rename; callers that need
    /// a consistent count must re-list.
    #[must_use]
    pub fn list_agents(&self, session_id: &str, phase: Option<Phase>) -> Vec<AgentView> {
        let phases: &[Phase] = match phase {
            Some(ref p) => std::slice::from_ref(p),
            None => &Phase::ALL,
        };
        let mut out = Vec::new();
        for &phase in phases {
            let Ok(entries) = std::fs::read_dir(self.agents_dir(session_id, phase)) else {
                continue;
            };
            for entry in entries.flatten() {
                let agent_id = entry.file_name().to_string_lossy().into_owned();
                let meta = read_json(&entry.path().join("meta.json"))
                    .unwrap_or_else(|| recovered_meta(&agent_id));
                out.push(AgentView {
                    agent_id,
                    phase,
                    meta,
                });
            }
        }
        out.sort_by(|a, b| {
            counter_of(&a.agent_id)
                .cmp(&counter_of(&b.agent_id))
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        out
    }

    /// Find one agent in any phase.
    #[must_use]
    pub fn find_agent(&self, session_id: &str, agent_id: &str) -> Option<AgentView> {
        for phase in Phase::ALL {
            let dir = self.agent_dir(session_id, phase, agent_id);
            if dir.exists() {
                let meta = read_json(&dir.join("meta.json"))
                    .unwrap_or_else(|| recovered_meta(agent_id));
                return Some(AgentView {
                    agent_id: agent_id.to_owned(),
                    phase,
                    meta,
                });
            }
        }
        None
    }

    /// The oldest pending agent a spawn-matching tool call should resolve
    /// to, optionally restricted to a role.
    #[must_use]
    pub fn find_pending_for_spawn(&self, session_id: &str, role: Option<&str>) -> Option<String> {
        self.list_agents(session_id, Some(Phase::Pending))
            .into_iter()
            .find(|view| role.is_none_or(|r| view.meta.role == sanitize_role(r)))
            .map(|view| view.agent_id)
    }

    /// The agent (any phase) whose materialized workspace contains `path`.
    #[must_use]
    pub fn find_agent_by_workspace(&self, session_id: &str, path: &Path) -> Option<AgentView> {
        self.list_agents(session_id, None).into_iter().find(|view| {
            view.meta
                .workspace_path
                .as_deref()
                .is_some_and(|ws| path.starts_with(ws))
        })
    }

    /// Replace an agent's metadata via closure, atomically.
    ///
    /// Read-modify-write through a temp file and rename; callers that can
    /// race (workspace binding) serialize through the provisioning lock.
    ///
    /// # Errors
    /// [`WardenError::StateConflict`] when the agent is unknown.
    pub fn update_agent_meta(
        &self,
        session_id: &str,
        agent_id: &str,
        mutate: impl FnOnce(&mut AgentMeta),
    ) -> Result<(), WardenError> {
        let view = self
            .find_agent(session_id, agent_id)
            .ok_or_else(|| WardenError::StateConflict {
                detail: format!("agent '{agent_id}' is not registered in session"),
            })?;
        let mut meta = view.meta;
        mutate(&mut meta);
        let path = self
            .agent_dir(session_id, view.phase, agent_id)
            .join("meta.json");
        write_json_replace(&path, &meta)?;
        Ok(())
    }

    // -- legacy migration --

    /// One-shot conversion of a legacy `pending_agents.json` list into the
    /// directory layout. Idempotent: the file is renamed to `.migrated`
    /// after conversion, and repeat runs see nothing to do.
    fn migrate_legacy_pending(&self, session_id: &str) -> Result<(), WardenError> {
        let legacy = self.session_dir(session_id).join("pending_agents.json");
        if !legacy.exists() {
            return Ok(());
        }

        #[derive(Deserialize)]
        struct LegacyEntry {
            role: String,
            #[serde(default)]
            parent: Option<String>,
        }

        let entries: Vec<LegacyEntry> = read_json(&legacy).unwrap_or_default();
        for entry in entries {
            self.register_pending_agent(session_id, &entry.role, entry.parent.as_deref())?;
        }

        let migrated = self.session_dir(session_id).join("pending_agents.json.migrated");
        std::fs::rename(&legacy, &migrated)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Id helpers
// ---------------------------------------------------------------------------

/// Short session fingerprint used inside agent ids.
#[must_use]
pub fn session_short(session_id: &str) -> String {
    let short: String = session_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(6)
        .collect::<String>()
        .to_ascii_lowercase();
    if short.is_empty() { "anon".to_owned() } else { short }
}

/// Normalize a role to lowercase alphanumeric-and-hyphen.
#[must_use]
pub fn sanitize_role(role: &str) -> String {
    let cleaned: String = role
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    if cleaned.is_empty() {
        "agent".to_owned()
    } else {
        cleaned
    }
}

/// The monotonic counter at the end of an agent id.
#[must_use]
pub fn counter_of(agent_id: &str) -> Option<u64> {
    agent_id.rsplit('-').next()?.parse().ok()
}

/// Strip path-hostile characters from an externally-supplied id so it can
/// name a directory.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    let cleaned = cleaned.trim_matches('.').to_owned();
    if cleaned.is_empty() { "anon".to_owned() } else { cleaned }
}

// ---------------------------------------------------------------------------
// Atomic JSON files
// ---------------------------------------------------------------------------

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Write a JSON file that must not already exist (exclusive create).
fn write_json_new<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Replace a JSON file atomically: temp file in the same directory, then
/// rename over the target.
fn write_json_replace<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Fallback metadata for an agent directory whose `meta.json` is missing
/// (crash between `mkdir` and the metadata write).
fn recovered_meta(agent_id: &str) -> AgentMeta {
    let role = agent_id
        .rsplitn(3, '-')
        .nth(2)
        .unwrap_or("agent")
        .to_owned();
    AgentMeta {
        role,
        ..AgentMeta::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
