//! On-disk snapshot registry keyed by function revision.
//!
//! A revision is either complete (all four artifact files present, info
//! decodes) and visible through [`SnapshotManager::lookup`], or absent from
//! the index. Partial directories left behind by a crash are deleted on
//! recovery.

mod snapshot;

pub use snapshot::{Snapshot, SnapshotInfo};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use firesnap_common::{Error, Result};
use tokio::sync::Mutex;
use tracing::{info, warn};

const MIB: u64 = 1 << 20;

struct Entry {
    snapshot: Snapshot,
    committed: bool,
    size_mib: u64,
}

#[derive(Default)]
struct Index {
    entries: HashMap<String, Entry>,
    used_mib: u64,
}

/// Registry of snapshot directories under one base directory, bounded by a
/// combined size capacity. All operations serialize on a single mutex.
pub struct SnapshotManager {
    base_dir: PathBuf,
    capacity_mib: u64,
    index: Mutex<Index>,
}

impl SnapshotManager {
    pub fn new(base_dir: impl Into<PathBuf>, capacity_mib: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            capacity_mib,
            index: Mutex::new(Index::default()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Rebuild the index from disk. Directories whose info file does not
    /// decode or that are missing artifacts are removed.
    pub async fn recover(&self) -> Result<()> {
        let mut index = self.index.lock().await;
        index.entries.clear();
        index.used_mib = 0;

        std::fs::create_dir_all(&self.base_dir)
            .map_err(|e| Error::io("creating snapshot base directory", &self.base_dir, e))?;
        let entries = std::fs::read_dir(&self.base_dir)
            .map_err(|e| Error::io("scanning", &self.base_dir, e))?;

        for dir_entry in entries {
            let dir_entry = dir_entry.map_err(|e| Error::io("scanning", &self.base_dir, e))?;
            let path = dir_entry.path();
            let revision = dir_entry.file_name().to_string_lossy().into_owned();

            if !path.is_dir() {
                warn!(path = %path.display(), "removing stray file from snapshot directory");
                let _ = std::fs::remove_file(&path);
                continue;
            }

            let snapshot = Snapshot::new(&revision, &self.base_dir);
            if !snapshot_is_complete(&snapshot) {
                warn!(revision = %revision, "removing partial snapshot directory");
                std::fs::remove_dir_all(&path)
                    .map_err(|e| Error::io("removing partial snapshot", &path, e))?;
                continue;
            }

            let size_mib = measure_mib(&snapshot)?;
            index.used_mib += size_mib;
            index.entries.insert(
                revision,
                Entry {
                    snapshot,
                    committed: true,
                    size_mib,
                },
            );
        }

        info!(
            snapshots = index.entries.len(),
            used_mib = index.used_mib,
            capacity_mib = self.capacity_mib,
            "recovered snapshot registry"
        );
        Ok(())
    }

    /// Reserve capacity and create the revision directory. The reservation
    /// is replaced by measured sizes at [`SnapshotManager::commit`].
    pub async fn register(&self, revision: &str, estimate_mib: u64) -> Result<Snapshot> {
        let mut index = self.index.lock().await;
        if index.entries.contains_key(revision) {
            return Err(Error::Conflict(format!(
                "revision {revision} is already registered"
            )));
        }
        if index.used_mib + estimate_mib > self.capacity_mib {
            return Err(Error::Resource(format!(
                "snapshot capacity exceeded: {} + {estimate_mib} MiB over {} MiB",
                index.used_mib, self.capacity_mib
            )));
        }

        let snapshot = Snapshot::new(revision, &self.base_dir);
        std::fs::create_dir_all(snapshot.base_dir())
            .map_err(|e| Error::io("creating snapshot directory", snapshot.base_dir(), e))?;

        index.used_mib += estimate_mib;
        index.entries.insert(
            revision.to_string(),
            Entry {
                snapshot: snapshot.clone(),
                committed: false,
                size_mib: estimate_mib,
            },
        );
        Ok(snapshot)
    }

    /// Committed snapshot for the revision, if any.
    pub async fn lookup(&self, revision: &str) -> Result<Snapshot> {
        let index = self.index.lock().await;
        index
            .entries
            .get(revision)
            .filter(|entry| entry.committed)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| Error::NotFound(format!("no snapshot for revision {revision}")))
    }

    /// Mark a registered revision available for lookup. All four artifact
    /// files must exist by now.
    pub async fn commit(&self, revision: &str) -> Result<()> {
        let mut index = self.index.lock().await;
        let index = &mut *index;
        let entry = index
            .entries
            .get_mut(revision)
            .ok_or_else(|| Error::NotFound(format!("revision {revision} is not registered")))?;
        if entry.committed {
            return Err(Error::Conflict(format!(
                "revision {revision} is already committed"
            )));
        }
        if !snapshot_is_complete(&entry.snapshot) {
            return Err(Error::Conflict(format!(
                "revision {revision} is missing snapshot artifacts"
            )));
        }

        let size_mib = measure_mib(&entry.snapshot)?;
        index.used_mib = index.used_mib - entry.size_mib + size_mib;
        entry.size_mib = size_mib;
        entry.committed = true;

        info!(revision, size_mib, "committed snapshot");
        Ok(())
    }

    /// Delete the revision's files and free its capacity.
    pub async fn remove(&self, revision: &str) -> Result<()> {
        let mut index = self.index.lock().await;
        let entry = index
            .entries
            .remove(revision)
            .ok_or_else(|| Error::NotFound(format!("revision {revision} is not registered")))?;
        index.used_mib -= entry.size_mib;

        std::fs::remove_dir_all(entry.snapshot.base_dir())
            .map_err(|e| Error::io("removing snapshot directory", entry.snapshot.base_dir(), e))?;
        info!(revision, "removed snapshot");
        Ok(())
    }

    /// Current combined size of all registered snapshots, in MiB.
    pub async fn usage_mib(&self) -> u64 {
        self.index.lock().await.used_mib
    }
}

fn snapshot_is_complete(snapshot: &Snapshot) -> bool {
    snapshot.mem_file_path().is_file()
        && snapshot.snap_file_path().is_file()
        && snapshot.patch_file_path().is_file()
        && snapshot.read_info().is_ok()
}

fn measure_mib(snapshot: &Snapshot) -> Result<u64> {
    let mut total: u64 = 0;
    for path in [
        snapshot.mem_file_path(),
        snapshot.snap_file_path(),
        snapshot.patch_file_path(),
        snapshot.info_file_path(),
    ] {
        match std::fs::metadata(&path) {
            Ok(metadata) => total += metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("reading metadata of", &path, e)),
        }
    }
    Ok(total.div_ceil(MIB))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_artifacts(snapshot: &Snapshot, image: &str) {
        std::fs::write(snapshot.mem_file_path(), b"memory").unwrap();
        std::fs::write(snapshot.snap_file_path(), b"machine state").unwrap();
        std::fs::write(snapshot.patch_file_path(), b"batch").unwrap();
        snapshot
            .write_info(&SnapshotInfo {
                image: image.to_string(),
                mem_size_mib: 256,
                vcpu_count: 1,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn commit_makes_a_revision_visible() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1024);

        let snapshot = manager.register("rev-1", 256).await.unwrap();
        assert!(matches!(
            manager.lookup("rev-1").await.unwrap_err(),
            Error::NotFound(_)
        ));

        write_artifacts(&snapshot, "helloworld");
        manager.commit("rev-1").await.unwrap();

        let found = manager.lookup("rev-1").await.unwrap();
        assert_eq!(found.read_info().unwrap().image, "helloworld");
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1024);

        manager.register("rev-1", 16).await.unwrap();
        let err = manager.register("rev-1", 16).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn capacity_is_reserved_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 300);

        let snapshot = manager.register("rev-1", 256).await.unwrap();
        let err = manager.register("rev-2", 256).await.unwrap_err();
        assert!(matches!(err, Error::Resource(_)));

        // Committing replaces the estimate with the (tiny) measured size.
        write_artifacts(&snapshot, "helloworld");
        manager.commit("rev-1").await.unwrap();
        assert!(manager.usage_mib().await <= 1);

        manager.register("rev-2", 256).await.unwrap();
    }

    #[tokio::test]
    async fn remove_deletes_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1024);

        let snapshot = manager.register("rev-1", 16).await.unwrap();
        write_artifacts(&snapshot, "helloworld");
        manager.commit("rev-1").await.unwrap();

        manager.remove("rev-1").await.unwrap();
        assert!(matches!(
            manager.lookup("rev-1").await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(!snapshot.base_dir().exists());

        assert!(matches!(
            manager.remove("rev-1").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn commit_requires_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), 1024);

        let snapshot = manager.register("rev-1", 16).await.unwrap();
        std::fs::write(snapshot.mem_file_path(), b"memory").unwrap();

        let err = manager.commit("rev-1").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
