//! Coordination error types for warden.
//!
//! Defines [`WardenError`], the unified error type for all coordination
//! operations. Error messages are designed to be agent-friendly: each
//! variant describes what went wrong in terms the blocked tool call can act
//! on, without leaking absolute paths beyond the project root.
//!
//! The dispatcher maps each kind onto its fail-open / fail-closed policy:
//! input and infrastructure errors permit the tool call and log, while
//! security denials, lock contention, and workspace failures block it.

use std::fmt;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// WardenError
// ---------------------------------------------------------------------------

/// Unified error type for warden coordination operations.
#[derive(Debug)]
pub enum WardenError {
    /// The inbound hook payload was over limits, malformed, or timed out.
    Input {
        /// What was wrong with the payload.
        detail: String,
    },

    /// A security rule fired. Always blocks the tool call.
    SecurityDeny {
        /// Short user-visible reason, e.g. `"blocked: dangerous rm pattern"`.
        reason: String,
    },

    /// A concurrent state transition raced and retries were exhausted.
    StateConflict {
        /// Description of the conflicting transition.
        detail: String,
    },

    /// A lock on the target path is held by another agent.
    LockContention {
        /// The contended path, relative to the project root when possible.
        path: PathBuf,
        /// The agent currently holding the lease.
        holder: String,
    },

    /// Workspace provisioning failed under every configured strategy.
    WorkspaceFailure {
        /// The agent whose workspace could not be materialized.
        agent_id: String,
        /// Why provisioning failed.
        detail: String,
    },

    /// A filesystem or OS error outside warden's control.
    Infra(std::io::Error),

    /// The configuration file could not be loaded or failed validation.
    Config(crate::config::ConfigError),
}

impl WardenError {
    /// Whether the dispatcher must fail open (allow and log) on this error.
    ///
    /// Security denials, contention, and workspace failures block the tool
    /// call; everything else degrades to allow so a coordination bug never
    /// halts the user's workflow.
    #[must_use]
    pub const fn fails_open(&self) -> bool {
        match self {
            Self::Input { .. } | Self::StateConflict { .. } | Self::Infra(_) | Self::Config(_) => {
                true
            }
            Self::SecurityDeny { .. }
            | Self::LockContention { .. }
            | Self::WorkspaceFailure { .. } => false,
        }
    }

    /// The short deny reason surfaced to the host (≤200 chars).
    #[must_use]
    pub fn deny_reason(&self) -> String {
        let full = self.to_string();
        let mut reason = full.lines().next().unwrap_or_default().to_owned();
        let mut end = reason.len().min(200);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
        reason
    }
}

// ---------------------------------------------------------------------------
// Display — agent-friendly error messages
// ---------------------------------------------------------------------------

impl fmt::Display for WardenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input { detail } => {
                write!(f, "invalid hook payload: {detail}")
            }
            Self::SecurityDeny { reason } => f.write_str(reason),
            Self::StateConflict { detail } => {
                write!(
                    f,
                    "state transition conflict: {detail}\n  Another warden process won the race; retry the operation."
                )
            }
            Self::LockContention { path, holder } => {
                write!(
                    f,
                    "blocked: file {} locked by {holder}\n  Wait for the holding agent to finish, or let the lock expire.",
                    path.display()
                )
            }
            Self::WorkspaceFailure { agent_id, detail } => {
                write!(
                    f,
                    "blocked: no workspace for agent {agent_id}: {detail}\n  Reads are still allowed; writes need a workspace."
                )
            }
            Self::Infra(err) => {
                write!(f, "I/O error: {err}")
            }
            Self::Config(err) => {
                write!(f, "{err}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// std::error::Error
// ---------------------------------------------------------------------------

impl std::error::Error for WardenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Infra(err) => Some(err),
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// From impls
// ---------------------------------------------------------------------------

impl From<std::io::Error> for WardenError {
    fn from(err: std::io::Error) -> Self {
        Self::Infra(err)
    }
}

impl From<crate::config::ConfigError> for WardenError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
