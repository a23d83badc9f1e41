//! File-backed execution lock.
//!
//! One lock file per reports directory guards a portal against two mutation
//! runs at once. The lock is advisory and single-host: it protects the remote
//! portal from racing runs started by the same operator, not process memory.
//!
//! Records carry an expiry. A record whose `expires_at` has passed is treated
//! as abandoned by a crashed run and reclaimed on the next `acquire`, which
//! bounds how long a crash can block the portal without any heartbeat.
//!
//! The lock file is linked into place without clobbering, so two `acquire`
//! calls racing on one host cannot both win. Reclaiming an expired record
//! first renames it aside and checks it is still the record that was seen
//! expired, so a reclaim never deletes a lock another run just took.

use crate::error::{CrmError, Result};
use crate::io::{create_new, remove_if_exists};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(60 * 60);

// ---------------------------------------------------------------------------
// LockRecord
// ---------------------------------------------------------------------------

/// Sole content of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub portal_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub execution_id: String,
}

impl LockRecord {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl fmt::Display for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "execution '{}' on portal '{}' (acquired {}, expires {})",
            self.execution_id,
            self.portal_id,
            self.acquired_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
        )
    }
}

// ---------------------------------------------------------------------------
// ExecutionLock
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ExecutionLock {
    path: PathBuf,
    portal_id: String,
    expiry: Duration,
    /// Execution id this instance acquired, if it currently holds the lock.
    held: Option<String>,
}

impl ExecutionLock {
    pub fn new(reports_dir: &Path, portal_id: impl Into<String>) -> Self {
        Self::with_expiry(reports_dir, portal_id, DEFAULT_EXPIRY)
    }

    pub fn with_expiry(reports_dir: &Path, portal_id: impl Into<String>, expiry: Duration) -> Self {
        Self {
            path: paths::lock_path(reports_dir),
            portal_id: portal_id.into(),
            expiry,
            held: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock for `execution_id`.
    ///
    /// Fails with [`CrmError::LockHeld`] carrying the blocking record if a
    /// non-expired lock exists. An expired record is reclaimed and the
    /// create is retried once.
    pub fn acquire(&mut self, execution_id: &str) -> Result<LockRecord> {
        let now = Utc::now();
        let expiry = chrono::Duration::from_std(self.expiry)
            .map_err(|e| CrmError::InvalidConfig(format!("lock expiry out of range: {e}")))?;
        let record = LockRecord {
            portal_id: self.portal_id.clone(),
            acquired_at: now,
            expires_at: now + expiry,
            execution_id: execution_id.to_string(),
        };
        let data = serde_json::to_vec_pretty(&record)?;

        for _ in 0..2 {
            let created =
                create_new(&self.path, &data).map_err(|e| CrmError::lock_io(&self.path, e))?;
            if created {
                tracing::info!(
                    execution_id,
                    portal_id = %self.portal_id,
                    expires_at = %record.expires_at,
                    "execution lock acquired"
                );
                self.held = Some(execution_id.to_string());
                return Ok(record);
            }

            match self.read_record()? {
                Some(existing) if !existing.is_expired() => {
                    return Err(CrmError::LockHeld(Box::new(existing)));
                }
                Some(stale) => {
                    self.reclaim_stale(&stale)?;
                }
                // Removed between our create attempt and the read; try again.
                None => {}
            }
        }

        // Lost the retry to another writer.
        match self.read_record()? {
            Some(existing) => Err(CrmError::LockHeld(Box::new(existing))),
            None => Err(CrmError::lock_io(
                &self.path,
                std::io::Error::other("lock file changed repeatedly during acquire"),
            )),
        }
    }

    /// Release a lock this instance acquired.
    ///
    /// Releasing without holding the lock, or after another run has taken
    /// over an expired lock, logs a warning and leaves the file alone.
    pub fn release(&mut self) -> Result<()> {
        let Some(execution_id) = self.held.take() else {
            tracing::warn!("release called without holding the execution lock");
            return Ok(());
        };
        match self.read_record()? {
            Some(current) if current.execution_id == execution_id => {
                remove_if_exists(&self.path).map_err(|e| CrmError::lock_io(&self.path, e))?;
                tracing::info!(%execution_id, "execution lock released");
            }
            Some(current) => {
                tracing::warn!(
                    %execution_id,
                    holder = %current.execution_id,
                    "execution lock now belongs to another run; not releasing"
                );
            }
            None => {
                tracing::warn!(%execution_id, "execution lock file already gone");
            }
        }
        Ok(())
    }

    /// True if a non-expired lock record exists.
    pub fn is_locked(&self) -> Result<bool> {
        Ok(self.current_lock()?.is_some())
    }

    /// The current non-expired lock record, if any.
    pub fn current_lock(&self) -> Result<Option<LockRecord>> {
        Ok(self.read_record()?.filter(|r| !r.is_expired()))
    }

    /// Delete the lock file unconditionally.
    ///
    /// This is the operator's escape hatch for a stale lock. It is unsafe if
    /// the holding run is genuinely still active: that run keeps mutating
    /// while a new one may start.
    pub fn force_release(&mut self) -> Result<Option<LockRecord>> {
        let existing = self.read_record().unwrap_or(None);
        let removed = remove_if_exists(&self.path).map_err(|e| CrmError::lock_io(&self.path, e))?;
        self.held = None;
        if removed {
            tracing::warn!(
                holder = existing.as_ref().map(|r| r.execution_id.as_str()).unwrap_or("<unreadable>"),
                "execution lock force-released"
            );
        }
        Ok(existing)
    }

    /// Remove the lock only if it has expired.
    ///
    /// Returns the removed record, `None` when there was no lock, and
    /// [`CrmError::LockHeld`] when a live run holds it.
    pub fn clear_expired(&mut self) -> Result<Option<LockRecord>> {
        match self.read_record()? {
            None => Ok(None),
            Some(live) if !live.is_expired() => Err(CrmError::LockHeld(Box::new(live))),
            Some(stale) => {
                if self.reclaim_stale(&stale)? {
                    return Ok(Some(stale));
                }
                match self.current_lock()? {
                    Some(live) => Err(CrmError::LockHeld(Box::new(live))),
                    None => Ok(None),
                }
            }
        }
    }

    /// Delete the lock file if it still holds exactly `stale`.
    ///
    /// The file is renamed to a private name before it is checked, so no
    /// other process can swap in a fresh lock between check and delete. If
    /// the renamed file turns out to be a different record it is linked back.
    /// Returns whether `stale` was removed.
    fn reclaim_stale(&self, stale: &LockRecord) -> Result<bool> {
        let aside = self.path.with_file_name(format!(
            "{}.stale-{}",
            paths::LOCK_FILE,
            uuid::Uuid::new_v4()
        ));
        match std::fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(CrmError::lock_io(&self.path, e)),
        }

        let seen = std::fs::read_to_string(&aside)
            .ok()
            .and_then(|d| serde_json::from_str::<LockRecord>(&d).ok());
        if seen.as_ref() == Some(stale) {
            tracing::warn!(
                stale_execution_id = %stale.execution_id,
                expired_at = %stale.expires_at,
                "reclaimed expired execution lock"
            );
            remove_if_exists(&aside).map_err(|e| CrmError::lock_io(&aside, e))?;
            return Ok(true);
        }

        match std::fs::hard_link(&aside, &self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::warn!(
                    holder = seen.as_ref().map(|r| r.execution_id.as_str()).unwrap_or("<unreadable>"),
                    "lock was replaced while reclaiming; could not restore it"
                );
            }
            Err(e) => return Err(CrmError::lock_io(&self.path, e)),
        }
        remove_if_exists(&aside).map_err(|e| CrmError::lock_io(&aside, e))?;
        Ok(false)
    }

    /// Scoped acquisition: the returned guard releases the lock when dropped,
    /// on every exit path of the caller.
    pub fn hold(&mut self, execution_id: &str) -> Result<LockGuard<'_>> {
        let record = self.acquire(execution_id)?;
        Ok(LockGuard { lock: self, record })
    }

    fn read_record(&self) -> Result<Option<LockRecord>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CrmError::lock_io(&self.path, e)),
        };
        serde_json::from_str(&data).map(Some).map_err(|e| {
            CrmError::lock_io(
                &self.path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }
}

// ---------------------------------------------------------------------------
// LockGuard
// ---------------------------------------------------------------------------

/// Holds the execution lock until dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a mut ExecutionLock,
    record: LockRecord,
}

impl LockGuard<'_> {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            tracing::error!(
                execution_id = %self.record.execution_id,
                error = %e,
                "failed to release execution lock; it expires at {}",
                self.record.expires_at
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
