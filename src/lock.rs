//! Atomic directory-based advisory locks.
//!
//! A lock on path `p` is the directory `locks/<sha256(p)>/`: exclusive
//! `mkdir` is the acquisition primitive, `rmdir` the release. Hashing the
//! canonical path means arbitrary byte sequences — separators, spaces,
//! unicode — key cleanly into one flat directory.
//!
//! Holders write an `info.json` beside the lock so contenders can name who
//! is in the way and detect staleness. A holder that died without releasing
//! is reclaimed by any contender after the TTL. Fairness is not promised:
//! contenders race on each backoff wakeup.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::WardenError;
use crate::paths::canonicalize_best;
use crate::state::now_ns;

/// Backoff schedule for contended acquisition.
const BACKOFF_START: Duration = Duration::from_millis(10);
const BACKOFF_CAP: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Lock key for a path: lowercase hex SHA-256 of its canonical UTF-8 form.
#[must_use]
pub fn path_digest(path: &Path, base: &Path) -> String {
    let canonical = canonicalize_best(path, base);
    let bytes = canonical.to_string_lossy();
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Lock metadata
// ---------------------------------------------------------------------------

/// Metadata written inside a held lock directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Agent holding the lease.
    pub holder: String,
    /// Acquisition time, nanoseconds since the epoch.
    pub acquired_ns: u64,
    /// Why the lock was taken (for audit).
    pub purpose: String,
    /// The canonical locked path (for audit; the digest is the key).
    pub path: String,
}

/// A held lock. Release is explicit — a lease must survive the process
/// boundary between `pre_tool_use` and `post_tool_use`, so dropping the
/// value does not release the lock.
#[derive(Clone, Debug, PartialEq)]
pub struct Lease {
    /// Digest key of the locked path.
    pub digest: String,
    /// The holder this lease was issued to.
    pub holder: String,
    /// The canonical locked path.
    pub path: PathBuf,
}

/// What a release attempt found on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lease was held by us and is now released.
    Released,
    /// No lock directory existed; nothing to do.
    NotHeld,
    /// The lock was reclaimed by (or reissued to) someone else; left alone.
    HeldByOther,
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

/// Manages the lock directory tree.
#[derive(Clone, Debug)]
pub struct LockManager {
    locks_dir: PathBuf,
    /// Base for resolving relative lock targets (the project root).
    base: PathBuf,
    ttl: Duration,
}

impl LockManager {
    /// Create a manager over `locks_dir`, resolving relative paths against
    /// `base`, with the given stale threshold.
    #[must_use]
    pub const fn new(locks_dir: PathBuf, base: PathBuf, ttl: Duration) -> Self {
        Self {
            locks_dir,
            base,
            ttl,
        }
    }

    fn lock_dir(&self, digest: &str) -> PathBuf {
        self.locks_dir.join(digest)
    }

    /// Attempt to take the lock without waiting.
    ///
    /// Performs at most one stale-reclaim step: an existing lock whose
    /// metadata is older than the TTL (or whose holder died before writing
    /// metadata) is torn down and the acquisition retried once.
    ///
    /// # Errors
    /// [`WardenError::Infra`] on filesystem errors other than contention.
    pub fn try_acquire(
        &self,
        path: &Path,
        holder: &str,
        purpose: &str,
    ) -> Result<Option<Lease>, WardenError> {
        self.try_acquire_inner(path, holder, purpose, true)
    }

    fn try_acquire_inner(
        &self,
        path: &Path,
        holder: &str,
        purpose: &str,
        may_reclaim: bool,
    ) -> Result<Option<Lease>, WardenError> {
        let canonical = canonicalize_best(path, &self.base);
        let digest = path_digest(path, &self.base);
        let dir = self.lock_dir(&digest);

        match std::fs::create_dir(&dir) {
            Ok(()) => {
                let info = LockInfo {
                    holder: holder.to_owned(),
                    acquired_ns: now_ns(),
                    purpose: purpose.to_owned(),
                    path: canonical.to_string_lossy().into_owned(),
                };
                write_info(&dir, &info)?;
                Ok(Some(Lease {
                    digest,
                    holder: holder.to_owned(),
                    path: canonical,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if may_reclaim && self.reclaim_if_stale(&dir) {
                    return self.try_acquire_inner(path, holder, purpose, false);
                }
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(&self.locks_dir)?;
                self.try_acquire_inner(path, holder, purpose, may_reclaim)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take the lock, waiting up to `timeout` with jittered exponential
    /// backoff. A zero timeout behaves exactly like [`Self::try_acquire`].
    ///
    /// # Errors
    /// [`WardenError::LockContention`] naming the current holder when the
    /// budget runs out; [`WardenError::Infra`] on filesystem errors.
    pub fn acquire(
        &self,
        path: &Path,
        holder: &str,
        purpose: &str,
        timeout: Duration,
    ) -> Result<Lease, WardenError> {
        let deadline = Instant::now() + timeout;
        let mut delay = BACKOFF_START;
        let mut may_reclaim = true;

        loop {
            if let Some(lease) = self.try_acquire_inner(path, holder, purpose, may_reclaim)? {
                return Ok(lease);
            }
            // One stale-reclaim step per acquire, not per wakeup.
            may_reclaim = false;

            let now = Instant::now();
            if now >= deadline {
                let holder = self
                    .holder_of(path)
                    .map_or_else(|| "unknown".to_owned(), |info| info.holder);
                return Err(WardenError::LockContention {
                    path: canonicalize_best(path, &self.base),
                    holder,
                });
            }

            let jitter = rand::rng().random_range(0.8..=1.2);
            let sleep = delay.mul_f64(jitter).min(deadline - now);
            std::thread::sleep(sleep);
            delay = (delay * 2).min(BACKOFF_CAP);
        }
    }

    /// Release a lease taken earlier (possibly by another process).
    ///
    /// Idempotent: releasing a lease that was already released, or that a
    /// contender reclaimed as stale and re-acquired, is a no-op reported in
    /// the outcome.
    ///
    /// # Errors
    /// [`WardenError::Infra`] on filesystem errors.
    pub fn release(&self, lease: &Lease) -> Result<ReleaseOutcome, WardenError> {
        self.release_digest(&lease.digest, &lease.holder)
    }

    /// Release by path and holder, for processes that never held the
    /// in-memory [`Lease`].
    ///
    /// # Errors
    /// [`WardenError::Infra`] on filesystem errors.
    pub fn release_path(&self, path: &Path, holder: &str) -> Result<ReleaseOutcome, WardenError> {
        let digest = path_digest(path, &self.base);
        self.release_digest(&digest, holder)
    }

    fn release_digest(&self, digest: &str, holder: &str) -> Result<ReleaseOutcome, WardenError> {
        let dir = self.lock_dir(digest);
        match read_info(&dir) {
            None if !dir.exists() => Ok(ReleaseOutcome::NotHeld),
            None => {
                // Lock dir without metadata: a crashed acquisition. Tear it
                // down; it cannot belong to a live holder.
                remove_lock_dir(&dir);
                Ok(ReleaseOutcome::Released)
            }
            Some(info) if info.holder == holder => {
                remove_lock_dir(&dir);
                Ok(ReleaseOutcome::Released)
            }
            Some(_) => Ok(ReleaseOutcome::HeldByOther),
        }
    }

    /// Whoever currently holds the lock on `path`.
    #[must_use]
    pub fn holder_of(&self, path: &Path) -> Option<LockInfo> {
        let digest = path_digest(path, &self.base);
        read_info(&self.lock_dir(&digest))
    }

    /// Remove every lock older than the TTL. Returns the count reclaimed.
    #[must_use]
    pub fn cleanup_stale(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.locks_dir) else {
            return 0;
        };
        let mut reclaimed = 0;
        for entry in entries.flatten() {
            if self.reclaim_if_stale(&entry.path()) {
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Whether any live lock names a path under `prefix`.
    #[must_use]
    pub fn any_lock_under(&self, prefix: &Path) -> bool {
        let Ok(entries) = std::fs::read_dir(&self.locks_dir) else {
            return false;
        };
        entries.flatten().any(|entry| {
            read_info(&entry.path())
                .is_some_and(|info| Path::new(&info.path).starts_with(prefix))
        })
    }

    /// All currently held locks.
    #[must_use]
    pub fn held(&self) -> Vec<LockInfo> {
        let Ok(entries) = std::fs::read_dir(&self.locks_dir) else {
            return Vec::new();
        };
        let mut out: Vec<LockInfo> = entries
            .flatten()
            .filter_map(|entry| read_info(&entry.path()))
            .collect();
        out.sort_by(|a, b| a.acquired_ns.cmp(&b.acquired_ns));
        out
    }

    /// Tear down one lock if it is stale. Returns whether it was removed.
    fn reclaim_if_stale(&self, dir: &Path) -> bool {
        match read_info(dir) {
            Some(info) => {
                let age_ns = now_ns().saturating_sub(info.acquired_ns);
                if Duration::from_nanos(age_ns) <= self.ttl {
                    return false;
                }
                remove_lock_dir(dir);
                true
            }
            None => {
                // No metadata: only reclaim when the bare directory itself
                // has been around long enough that the writer clearly died
                // between mkdir and the metadata write.
                let old_enough = std::fs::metadata(dir)
                    .and_then(|m| m.modified())
                    .map_or(true, |mtime| {
                        mtime.elapsed().map_or(true, |age| age > self.ttl)
                    });
                old_enough && std::fs::remove_dir(dir).is_ok()
            }
        }
    }
}

fn write_info(dir: &Path, info: &LockInfo) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, info)?;
    tmp.persist(dir.join("info.json")).map_err(|e| e.error)?;
    Ok(())
}

fn read_info(dir: &Path) -> Option<LockInfo> {
    let bytes = std::fs::read(dir.join("info.json")).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn remove_lock_dir(dir: &Path) {
    // Clear metadata and any temp file a crashed writer left behind, then
    // drop the directory itself. Only direct children are touched.
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let _ = std::fs::remove_file(entry.path());
        }
    }
    let _ = std::fs::remove_dir(dir);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
