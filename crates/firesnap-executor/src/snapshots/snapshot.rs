use std::path::{Path, PathBuf};

use firesnap_common::{Error, Result, DEFAULT_MEM_SIZE_MIB, DEFAULT_VCPU_COUNT};
use serde::{Deserialize, Serialize};

pub const MEM_FILE_NAME: &str = "memfile";
pub const SNAP_FILE_NAME: &str = "snapfile";
pub const PATCH_FILE_NAME: &str = "patchfile";
pub const INFO_FILE_NAME: &str = "infofile";

/// One revision's snapshot artifacts under the registry base directory.
///
/// The directory name equals the revision exactly; the four files inside it
/// have fixed names.
#[derive(Debug, Clone)]
pub struct Snapshot {
    revision: String,
    base_dir: PathBuf,
}

impl Snapshot {
    pub fn new(revision: &str, registry_dir: &Path) -> Self {
        Self {
            revision: revision.to_string(),
            base_dir: registry_dir.join(revision),
        }
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Guest RAM dump, sparsified after capture.
    pub fn mem_file_path(&self) -> PathBuf {
        self.base_dir.join(MEM_FILE_NAME)
    }

    /// Hypervisor machine state.
    pub fn snap_file_path(&self) -> PathBuf {
        self.base_dir.join(SNAP_FILE_NAME)
    }

    /// Filesystem delta over the image rootfs.
    pub fn patch_file_path(&self) -> PathBuf {
        self.base_dir.join(PATCH_FILE_NAME)
    }

    /// Serialized [`SnapshotInfo`].
    pub fn info_file_path(&self) -> PathBuf {
        self.base_dir.join(INFO_FILE_NAME)
    }

    pub fn write_info(&self, info: &SnapshotInfo) -> Result<()> {
        let path = self.info_file_path();
        let bytes = serde_json::to_vec(info)
            .map_err(|e| Error::io("encoding snapshot info for", &path, e.into()))?;
        std::fs::write(&path, bytes).map_err(|e| Error::io("writing", &path, e))
    }

    pub fn read_info(&self) -> Result<SnapshotInfo> {
        let path = self.info_file_path();
        let bytes = std::fs::read(&path).map_err(|e| Error::io("reading", &path, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::io("decoding snapshot info from", &path, e.into()))
    }
}

/// Metadata stored next to the snapshot artifacts.
///
/// The patch file is only meaningful relative to `image`; fields written by
/// newer versions are ignored on decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub image: String,
    #[serde(default = "default_mem_size")]
    pub mem_size_mib: u32,
    #[serde(default = "default_vcpu_count")]
    pub vcpu_count: u32,
}

fn default_mem_size() -> u32 {
    DEFAULT_MEM_SIZE_MIB
}

fn default_vcpu_count() -> u32 {
    DEFAULT_VCPU_COUNT
}
