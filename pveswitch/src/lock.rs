use std::io::ErrorKind;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const LOCKED: &str = "LOCKED";
const UNLOCKED: &str = "UNLOCKED";

#[derive(Debug, Error)]
#[error("lock flag persistence failed ({path}): {source}")]
pub struct LockStoreError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Pair-wide switch lock shared by every process using the same lock file.
/// The `flock` is released when this is dropped.
#[derive(Debug)]
pub struct SwitchFlock {
    _file: std::fs::File,
}

/// Durable "switching disabled" flag backed by a single file.
///
/// The file is read on every call so a flag written by another process (the
/// `lock`/`unlock` subcommands) is honoured by a running daemon.
pub struct LockStore {
    path: PathBuf,
    write_guard: Mutex<()>,
}

impl LockStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current flag. A missing file means unlocked. A file that cannot be read
    /// or holds anything unrecognised is treated as locked.
    pub async fn read(&self) -> bool {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => match content.trim() {
                LOCKED => true,
                UNLOCKED => false,
                other => {
                    warn!(
                        path = %self.path.display(),
                        content = %other,
                        "unrecognised lock flag content, treating as locked"
                    );
                    true
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to read lock flag, treating as locked"
                );
                true
            }
        }
    }

    /// Persist the flag. Writers are serialized; the file is replaced
    /// atomically so a crash leaves either the old or the new value.
    pub async fn write(&self, locked: bool) -> Result<(), LockStoreError> {
        let _guard = self.write_guard.lock().await;

        let err = |source| LockStoreError {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.parent_dir() {
            tokio::fs::create_dir_all(parent).await.map_err(err)?;
        }

        let tmp_path = self.tmp_path();
        if let Err(e) = self.replace_with(&tmp_path, locked).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err(e));
        }

        // Make the rename itself durable.
        if let Some(parent) = self.parent_dir() {
            match tokio::fs::File::open(parent).await {
                Ok(dir) => {
                    if let Err(e) = dir.sync_all().await {
                        debug!(path = %parent.display(), error = %e, "directory fsync failed");
                    }
                }
                Err(e) => debug!(path = %parent.display(), error = %e, "could not open directory for fsync"),
            }
        }

        info!(path = %self.path.display(), locked, "lock flag written");
        Ok(())
    }

    async fn replace_with(&self, tmp_path: &Path, locked: bool) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(tmp_path).await?;
        file.write_all(if locked { LOCKED } else { UNLOCKED }.as_bytes())
            .await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(tmp_path, &self.path).await
    }

    /// Take the switch lock on `<lock_file>.switch` without blocking.
    /// `Ok(None)` means another holder (usually another process) has it.
    pub fn try_acquire_switch(&self) -> Result<Option<SwitchFlock>, LockStoreError> {
        let path = self.sibling_path(".switch");
        let err = |source| LockStoreError {
            path: path.clone(),
            source,
        };

        if let Some(parent) = self.parent_dir() {
            std::fs::create_dir_all(parent).map_err(err)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(err)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(Some(SwitchFlock { _file: file }));
        }
        let e = std::io::Error::last_os_error();
        if e.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(None)
        } else {
            Err(err(e))
        }
    }

    fn parent_dir(&self) -> Option<&Path> {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => Some(p),
            _ => None,
        }
    }

    /// Unique per write so writers in different processes never share a
    /// temp file.
    fn tmp_path(&self) -> PathBuf {
        self.sibling_path(&format!(".{}.tmp", uuid::Uuid::new_v4().simple()))
    }

    fn sibling_path(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "lock".into());
        name.push(suffix);
        self.path.with_file_name(name)
    }
}
