//! File-level deltas between an image rootfs and a container rootfs.
//!
//! A patch is a byte-replayable batch: applied on top of a freshly prepared
//! snapshot of the same image, it reproduces the container tree that was
//! captured, including hard links, ACLs, and extended attributes.

use std::path::Path;

use async_trait::async_trait;
use firesnap_common::{Error, Result};
use tracing::debug;

use crate::command::run;
use crate::devmapper;

/// Produces and applies rootfs deltas over snapshot block devices.
///
/// Both device arguments must point at quiesced snapshots: the sources of an
/// extract are mounted read-only, the target of an apply is mounted writable
/// and must have no other user.
#[async_trait]
pub trait Patcher: Send + Sync {
    async fn extract(
        &self,
        image_dev: &Path,
        container_dev: &Path,
        patch_path: &Path,
    ) -> Result<()>;

    async fn apply(&self, container_dev: &Path, patch_path: &Path) -> Result<()>;
}

/// rsync batch-mode implementation.
pub struct RsyncPatcher;

#[async_trait]
impl Patcher for RsyncPatcher {
    async fn extract(
        &self,
        image_dev: &Path,
        container_dev: &Path,
        patch_path: &Path,
    ) -> Result<()> {
        // Suspend/resume waits out any in-flight I/O on the container
        // device, then the flush drops the host's stale cached view of it;
        // the guest wrote to the device without going through our cache.
        devmapper::suspend_device(container_dev).await?;
        devmapper::resume_device(container_dev).await?;
        devmapper::flush_buffers(container_dev)?;

        let image_mount = devmapper::mount_snapshot(image_dev, true)?;
        let container_mount = match devmapper::mount_snapshot(container_dev, true) {
            Ok(mount) => mount,
            Err(e) => {
                let _ = devmapper::unmount_snapshot(&image_mount);
                return Err(e);
            }
        };

        let result = create_patch(&image_mount, &container_mount, patch_path).await;
        let result = result.and(devmapper::unmount_snapshot(&container_mount));
        result.and(devmapper::unmount_snapshot(&image_mount))
    }

    async fn apply(&self, container_dev: &Path, patch_path: &Path) -> Result<()> {
        let container_mount = devmapper::mount_snapshot(container_dev, false)?;
        let result = apply_patch(&container_mount, patch_path).await;
        result.and(devmapper::unmount_snapshot(&container_mount))
    }
}

/// Write a batch delta turning the `image_root` tree into the
/// `container_root` tree.
pub async fn create_patch(
    image_root: &Path,
    container_root: &Path,
    patch_path: &Path,
) -> Result<()> {
    debug!(
        image_root = %image_root.display(),
        container_root = %container_root.display(),
        patch = %patch_path.display(),
        "creating patch"
    );
    let batch_arg = format!("--only-write-batch={}", patch_path.display());
    let image_root = with_trailing_slash(image_root);
    let container_root = with_trailing_slash(container_root);
    run("rsync", &["-aHAX", &batch_arg, &image_root, &container_root]).await?;

    // rsync emits a replay script next to the batch; the batch alone is kept.
    let script = format!("{}.sh", patch_path.display());
    std::fs::remove_file(&script).map_err(|e| Error::io("removing", script, e))?;
    Ok(())
}

/// Replay a batch delta in place on top of `container_root`.
pub async fn apply_patch(container_root: &Path, patch_path: &Path) -> Result<()> {
    debug!(
        container_root = %container_root.display(),
        patch = %patch_path.display(),
        "applying patch"
    );
    let batch_arg = format!("--read-batch={}", patch_path.display());
    let container_root = with_trailing_slash(container_root);
    run("rsync", &["-aHAX", &batch_arg, &container_root]).await
}

// rsync treats `dir` and `dir/` differently; batches are built over contents.
fn with_trailing_slash(path: &Path) -> String {
    let path = path.display().to_string();
    if path.ends_with('/') {
        path
    } else {
        format!("{path}/")
    }
}
