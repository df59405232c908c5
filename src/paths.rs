//! Project root resolution and canonical directory layout.
//!
//! Every component receives its directories from [`ProjectPaths`] — no
//! component composes state paths from strings on its own. Paths are
//! resolved once per process and never change afterwards.

use std::fmt;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Layout constants
// ---------------------------------------------------------------------------

/// Hidden state directory under the project root.
const STATE_DIR: &str = ".state";

/// Per-agent worktree checkouts (preferred workspace strategy).
const WORKTREES_DIR: &str = "worktrees";

/// Append-only JSONL event streams.
const LOGS_DIR: &str = "logs";

/// Configuration file name under the project root.
const CONFIG_FILE: &str = ".warden.toml";

// ---------------------------------------------------------------------------
// RootResolutionError
// ---------------------------------------------------------------------------

/// The current working directory could not be determined.
///
/// This is the only way root resolution can fail: a missing VCS marker just
/// means the working directory itself becomes the root.
#[derive(Debug)]
pub struct RootResolutionError(pub std::io::Error);

impl fmt::Display for RootResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not resolve the project root: {}\n  To fix: run warden from an accessible directory.",
            self.0
        )
    }
}

impl std::error::Error for RootResolutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ProjectPaths
// ---------------------------------------------------------------------------

/// Canonical directories for one project, resolved once per process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectPaths {
    root: PathBuf,
    /// Whether `root` was anchored by a `.git` marker (as opposed to
    /// falling back to the working directory).
    vcs_root: bool,
}

impl ProjectPaths {
    /// Resolve the project root from the current working directory.
    ///
    /// Probes upward for a `.git` marker; the first directory carrying one
    /// becomes the root. Without a marker the working directory itself is
    /// the root.
    ///
    /// # Errors
    /// Returns [`RootResolutionError`] only when the working directory is
    /// inaccessible.
    pub fn resolve() -> Result<Self, RootResolutionError> {
        let cwd = std::env::current_dir().map_err(RootResolutionError)?;
        Ok(Self::resolve_from(&cwd))
    }

    /// Resolve the project root starting from an explicit directory.
    ///
    /// Deterministic: the same `start` always yields the same root.
    #[must_use]
    pub fn resolve_from(start: &Path) -> Self {
        let mut dir = start;
        loop {
            if dir.join(".git").exists() {
                return Self {
                    root: dir.to_owned(),
                    vcs_root: true,
                };
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => {
                    return Self {
                        root: start.to_owned(),
                        vcs_root: false,
                    };
                }
            }
        }
    }

    /// The project root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the root was anchored by a VCS marker.
    #[must_use]
    pub const fn is_vcs_root(&self) -> bool {
        self.vcs_root
    }

    /// `<root>/.state` — all coordination state lives below here.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    /// `<root>/.state/sessions` — one directory per session.
    #[must_use]
    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir().join("sessions")
    }

    /// `<root>/.state/locks` — one directory per held lock.
    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    /// `<root>/.state/workspaces` — plain-directory workspace fallback.
    #[must_use]
    pub fn workspaces_dir(&self) -> PathBuf {
        self.state_dir().join("workspaces")
    }

    /// `<root>/worktrees` — per-agent VCS worktrees (preferred strategy).
    #[must_use]
    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join(WORKTREES_DIR)
    }

    /// `<root>/logs` — append-only JSONL streams.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    /// `<root>/.warden.toml` — the configuration file.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Create the full state tree. Idempotent.
    ///
    /// # Errors
    /// Returns the underlying I/O error if a directory cannot be created.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.sessions_dir(),
            self.locks_dir(),
            self.workspaces_dir(),
            self.worktrees_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Canonicalization
// ---------------------------------------------------------------------------

/// Produce a stable, absolute form of a path, resolving what the
/// filesystem can resolve.
///
/// An existing path is canonicalized outright (symlinks followed). For a
/// path that does not exist yet — the common case for a file about to be
/// written — the deepest existing ancestor is canonicalized and the
/// remaining components are appended after lexical `.`/`..` resolution.
/// Deterministic within one host; relative paths resolve against `base`.
#[must_use]
pub fn canonicalize_best(path: &Path, base: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_owned()
    } else {
        base.join(path)
    };
    if let Ok(resolved) = absolute.canonicalize() {
        return resolved;
    }

    // Dangling target: resolve `.`/`..` lexically, then canonicalize the
    // deepest existing ancestor and re-append the remainder.
    let absolute = lexical_normalize(&absolute);
    let mut existing = absolute.as_path();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();
    loop {
        if existing.exists() {
            break;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                remainder.push(name.to_owned());
                existing = parent;
            }
            _ => break,
        }
    }

    let mut result = existing
        .canonicalize()
        .unwrap_or_else(|_| existing.to_owned());
    for part in remainder.iter().rev() {
        result.push(part);
    }
    result
}

/// Resolve `.` and `..` components without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(parts.last(), Some(Component::Normal(_))) {
                    parts.pop();
                } else if !matches!(parts.last(), Some(Component::RootDir)) {
                    parts.push(component);
                }
            }
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
