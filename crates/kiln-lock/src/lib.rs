//! Session lock file guarding a cache directory against concurrent kiln invocations.
//!
//! The lock file lives at `<cache_dir>/lock` and contains JSON metadata about
//! the lock holder (PID, hostname, timestamp, session id).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = "lock";

/// Information stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID of the lock holder.
    pub pid: u32,
    /// Hostname where the lock was acquired.
    pub hostname: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// Optional identifier of the build session in progress.
    pub session_id: Option<String>,
}

/// Lock file handle that automatically releases on drop.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    /// Acquire a lock file under `cache_dir`.
    ///
    /// Fails if a lock already exists and is not stale. Use [`SessionLock::is_locked`]
    /// first to check, or [`SessionLock::acquire_with_timeout`] for automatic
    /// stale-lock takeover.
    pub fn acquire(cache_dir: &Path) -> Result<Self> {
        let lock_path = cache_dir.join(LOCK_FILE);

        fs::create_dir_all(cache_dir)
            .with_context(|| format!("failed to create cache dir {}", cache_dir.display()))?;

        if lock_path.exists() {
            let existing = Self::read_lock_info(cache_dir)?;
            bail!(
                "lock already held by pid {} on {} since {} (session: {:?})",
                existing.pid,
                existing.hostname,
                existing.acquired_at,
                existing.session_id
            );
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            session_id: None,
        };

        write_lock_atomic(&lock_path, &info)?;

        Ok(Self { path: lock_path })
    }

    /// Acquire a lock, taking over and removing stale locks older than `timeout`.
    pub fn acquire_with_timeout(cache_dir: &Path, timeout: Duration) -> Result<Self> {
        let lock_path = cache_dir.join(LOCK_FILE);

        if lock_path.exists() {
            match Self::read_lock_info(cache_dir) {
                Ok(info) => {
                    let age = Utc::now() - info.acquired_at;
                    if age.num_seconds().unsigned_abs() > timeout.as_secs() {
                        fs::remove_file(&lock_path).with_context(|| {
                            format!("failed to remove stale lock file {}", lock_path.display())
                        })?;
                    } else {
                        bail!(
                            "lock already held by pid {} on {} since {} (age: {:?})",
                            info.pid,
                            info.hostname,
                            info.acquired_at,
                            age
                        );
                    }
                }
                Err(_) => {
                    fs::remove_file(&lock_path).with_context(|| {
                        format!("failed to remove corrupt lock file {}", lock_path.display())
                    })?;
                }
            }
        }

        Self::acquire(cache_dir)
    }

    /// Release the lock file.
    pub fn release(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock file {}", self.path.display()))?;
        }
        Ok(())
    }

    /// Record the build session identifier in the lock file.
    pub fn set_session_id(&self, session_id: &str) -> Result<()> {
        if !self.path.exists() {
            bail!("lock file does not exist at {}", self.path.display());
        }

        let mut info = read_lock_info_from_path(&self.path)?;
        info.session_id = Some(session_id.to_string());
        write_lock_atomic(&self.path, &info)
    }

    /// Check whether a lock file exists under `cache_dir`.
    pub fn is_locked(cache_dir: &Path) -> Result<bool> {
        Ok(cache_dir.join(LOCK_FILE).exists())
    }

    /// Read the lock file information under `cache_dir`.
    pub fn read_lock_info(cache_dir: &Path) -> Result<LockInfo> {
        read_lock_info_from_path(&cache_dir.join(LOCK_FILE))
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn write_lock_atomic(lock_path: &Path, info: &LockInfo) -> Result<()> {
    let tmp_path = lock_path.with_extension("tmp");
    let json = serde_json::to_string_pretty(info).context("failed to serialize lock info")?;

    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create lock tmp file {}", tmp_path.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write lock tmp file {}", tmp_path.display()))?;
        file.sync_all().context("failed to sync lock file")?;
    }

    fs::rename(&tmp_path, lock_path)
        .with_context(|| format!("failed to rename lock file to {}", lock_path.display()))?;

    Ok(())
}

fn read_lock_info_from_path(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    let info: LockInfo = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock JSON from {}", path.display()))?;
    Ok(info)
}

/// Path of the lock file under `cache_dir`.
pub fn lock_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(LOCK_FILE)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn lock_path_returns_expected_path() {
        let base = PathBuf::from("x");
        assert_eq!(lock_path(&base), PathBuf::from("x").join(LOCK_FILE));
    }

    #[test]
    fn acquire_creates_lock_file() {
        let td = tempdir().expect("tempdir");
        let mut lock = SessionLock::acquire(td.path()).expect("acquire");
        assert!(lock_path(td.path()).exists());
        lock.release().expect("release");
        assert!(!lock_path(td.path()).exists());
    }

    #[test]
    fn acquire_fails_when_locked() {
        let td = tempdir().expect("tempdir");
        let _lock1 = SessionLock::acquire(td.path()).expect("first acquire");

        let result = SessionLock::acquire(td.path());
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("lock already held")
        );
    }

    #[test]
    fn drop_releases_lock() {
        let td = tempdir().expect("tempdir");
        {
            let _lock = SessionLock::acquire(td.path()).expect("acquire");
            assert!(lock_path(td.path()).exists());
        }
        assert!(!lock_path(td.path()).exists());
    }

    #[test]
    fn read_lock_info_returns_correct_info() {
        let td = tempdir().expect("tempdir");
        let _lock = SessionLock::acquire(td.path()).expect("acquire");

        let info = SessionLock::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.pid, std::process::id());
        assert!(!info.hostname.is_empty());
        assert!(info.session_id.is_none());
    }

    #[test]
    fn set_session_id_updates_lock() {
        let td = tempdir().expect("tempdir");
        let lock = SessionLock::acquire(td.path()).expect("acquire");

        lock.set_session_id("session-123").expect("set session id");

        let info = SessionLock::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.session_id, Some("session-123".to_string()));
    }

    #[test]
    fn is_locked_returns_correct_status() {
        let td = tempdir().expect("tempdir");
        assert!(!SessionLock::is_locked(td.path()).expect("is_locked"));

        let _lock = SessionLock::acquire(td.path()).expect("acquire");
        assert!(SessionLock::is_locked(td.path()).expect("is_locked"));
    }

    #[test]
    fn acquire_with_timeout_removes_stale_locks() {
        let td = tempdir().expect("tempdir");

        let lock_path = lock_path(td.path());
        let old_info = LockInfo {
            pid: 12345,
            hostname: "test-host".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            session_id: None,
        };
        fs::write(
            &lock_path,
            serde_json::to_string(&old_info).expect("serialize"),
        )
        .expect("write stale lock");

        let _lock = SessionLock::acquire_with_timeout(td.path(), Duration::from_secs(3600))
            .expect("acquire with timeout");

        let info = SessionLock::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.pid, std::process::id());
        assert_ne!(info.pid, 12345);
    }

    #[test]
    fn acquire_with_timeout_fails_on_fresh_lock() {
        let td = tempdir().expect("tempdir");

        let _lock1 = SessionLock::acquire(td.path()).expect("first acquire");

        let result = SessionLock::acquire_with_timeout(td.path(), Duration::from_secs(3600));
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("lock already held")
        );
    }

    proptest! {
        #[test]
        fn lock_info_roundtrips_through_json(
            pid in any::<u32>(),
            hostname in "[a-zA-Z0-9.-]{1,32}",
            has_session in any::<bool>(),
            session_suffix in "[a-z0-9]{0,16}",
        ) {
            let info = LockInfo {
                pid,
                hostname,
                acquired_at: Utc::now(),
                session_id: has_session.then(|| format!("session-{session_suffix}")),
            };
            let json = serde_json::to_string(&info).expect("serialize");
            let back: LockInfo = serde_json::from_str(&json).expect("deserialize");
            prop_assert_eq!(back.pid, info.pid);
            prop_assert_eq!(back.hostname, info.hostname);
            prop_assert_eq!(back.session_id, info.session_id);
        }
    }
}
