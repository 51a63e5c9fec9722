// Durable state files

//! Atomic file replacement and the pending-transaction sidecar
//!
//! Everything the next boot's recovery path reads (sidecar, baseline, domain
//! store, deployed artifacts) is written through [`write_atomic`], so a crash
//! mid-write leaves either the old or the new contents, never a torn file.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Write `contents` to `path` via a temporary sibling, fsync, then rename.
/// `mode` sets the permission bits of the final file.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));

    {
        let mut f = File::create(&tmp)?;
        f.set_permissions(fs::Permissions::from_mode(mode))?;
        f.write_all(contents)?;
        f.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    // fsync parent dir so the rename itself is durable
    File::open(&dir)?.sync_all()?;
    Ok(())
}

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Status stored in the sidecar. Only pending transactions are ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
}

/// On-disk record of the transaction awaiting confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub status: TransactionStatus,
    /// Deadline as unix seconds
    pub expires_at: u64,
}

/// Sidecar file holding at most one [`TransactionRecord`]
#[derive(Debug, Clone)]
pub struct SidecarFile {
    path: PathBuf,
}

impl SidecarFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `record`, replacing any previous one
    pub fn save(&self, record: &TransactionRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.path, &json, 0o600)?;
        Ok(())
    }

    /// Read the record; `Ok(None)` when no sidecar exists
    pub fn load(&self) -> Result<Option<TransactionRecord>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the sidecar; a missing file is not an error
    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::error!("Failed to clear transaction sidecar {}: {}", self.path.display(), e),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
