// Domain store

//! Domain persistence seam
//!
//! The core never mutates domain entities; it reads a [`DomainSnapshot`] and,
//! for commit-confirm, takes and restores opaque [`StoreImage`]s. Restoring a
//! freshly taken image must yield byte-identical domain state.

use crate::error::{Error, Result};
use crate::state_file::write_atomic;
use crate::types::DomainSnapshot;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Opaque serialized domain state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreImage(pub Vec<u8>);

/// Persistence layer as seen by the deployment engine
pub trait DomainStore: Send + Sync {
    /// Consistent snapshot of the current domain
    fn load(&self) -> Result<DomainSnapshot>;

    /// Replace the stored domain with `snapshot`
    fn save(&self, snapshot: &DomainSnapshot) -> Result<()>;

    /// True once the store holds any data
    fn exists(&self) -> bool;

    /// Opaque image of the current state
    fn snapshot(&self) -> Result<StoreImage>;

    /// Replace the current state with `image`
    fn restore(&self, image: &StoreImage) -> Result<()>;

    /// Discard any in-process cached view of the data
    fn invalidate(&self);
}

/// Domain store kept as one JSON document on disk
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    cache: RwLock<Option<DomainSnapshot>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DomainStore for JsonFileStore {
    fn load(&self) -> Result<DomainSnapshot> {
        if let Ok(cache) = self.cache.read() {
            if let Some(snapshot) = cache.as_ref() {
                return Ok(snapshot.clone());
            }
        }

        let snapshot = match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => DomainSnapshot::default(),
            Err(e) => return Err(e.into()),
        };

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(snapshot.clone());
        }
        Ok(snapshot)
    }

    fn save(&self, snapshot: &DomainSnapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.path, &json, 0o600)?;
        self.invalidate();
        Ok(())
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn snapshot(&self) -> Result<StoreImage> {
        Ok(StoreImage(fs::read(&self.path)?))
    }

    fn restore(&self, image: &StoreImage) -> Result<()> {
        write_atomic(&self.path, &image.0, 0o600)?;
        self.invalidate();
        Ok(())
    }

    fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.write() {
            *cache = None;
        }
    }
}

/// Last-known-good image of the domain store
#[derive(Debug, Clone)]
pub struct Baseline {
    path: PathBuf,
}

impl Baseline {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Persist `image` as the new last-known-good state
    pub fn save(&self, image: &StoreImage) -> Result<()> {
        write_atomic(&self.path, &image.0, 0o600)?;
        Ok(())
    }

    /// The last-known-good image, or [`Error::RevertFailed`] when none exists
    pub fn load(&self) -> Result<StoreImage> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(StoreImage(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::RevertFailed {
                reason: format!("no last-known-good backup at {}", self.path.display()),
            }),
            Err(e) => Err(Error::RevertFailed {
                reason: format!("cannot read {}: {}", self.path.display(), e),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerConfig;

    fn snapshot(port: u16) -> DomainSnapshot {
        DomainSnapshot {
            server: ServerConfig {
                port,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_store_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("domain.json"));
        assert!(!store.exists());
        assert_eq!(store.load().unwrap(), DomainSnapshot::default());
    }

    #[test]
    fn test_restore_of_snapshot_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("domain.json"));
        store.save(&snapshot(51820)).unwrap();

        let image = store.snapshot().unwrap();
        store.save(&snapshot(4000)).unwrap();
        store.restore(&image).unwrap();

        assert_eq!(fs::read(store.path()).unwrap(), image.0);
        assert_eq!(store.load().unwrap().server.port, 51820);
    }

    #[test]
    fn test_cache_is_invalidated_explicitly() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("domain.json"));
        store.save(&snapshot(1)).unwrap();
        assert_eq!(store.load().unwrap().server.port, 1);

        // out-of-band write, as the CRUD layer would do
        fs::write(store.path(), serde_json::to_vec(&snapshot(2)).unwrap()).unwrap();
        assert_eq!(store.load().unwrap().server.port, 1);

        store.invalidate();
        assert_eq!(store.load().unwrap().server.port, 2);
    }

    #[test]
    fn test_baseline_missing_is_revert_failure() {
        let dir = tempfile::tempdir().unwrap();
        let baseline = Baseline::new(dir.path().join("domain.json.last_good"));
        assert!(matches!(baseline.load(), Err(Error::RevertFailed { .. })));

        baseline.save(&StoreImage(b"{}".to_vec())).unwrap();
        assert_eq!(baseline.load().unwrap(), StoreImage(b"{}".to_vec()));
    }
}
