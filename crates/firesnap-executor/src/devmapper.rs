//! Thin-pool block device helpers.
//!
//! Container snapshots surface on the host as device-mapper thin devices.
//! These helpers activate and deactivate such devices, mount them as ext4,
//! quiesce them before host-side reads, and sparsify captured files.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use firesnap_common::{Error, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tracing::debug;
use uuid::Uuid;

use crate::command::run;

/// Size of the thin target in 512-byte sectors (10 GiB).
const THIN_DEV_SECTORS: u64 = 20_971_520;

/// Block granularity used when scanning a file for zero runs.
const SPARSIFY_BLOCK: usize = 4096;

// BLKFLSBUF: flush the kernel's cached buffers for a block device.
nix::ioctl_none!(blkflsbuf, 0x12, 97);

pub fn pool_path(pool_name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/mapper/{pool_name}"))
}

fn thin_table(snap_id: &str, pool_name: &str) -> String {
    format!(
        "0 {} thin {} {}",
        THIN_DEV_SECTORS,
        pool_path(pool_name).display(),
        snap_id
    )
}

/// Activate a thin snapshot as `/dev/mapper/<dev_name>`.
pub async fn activate_snapshot(dev_name: &str, snap_id: &str, pool_name: &str) -> Result<()> {
    let table = thin_table(snap_id, pool_name);
    run("dmsetup", &["create", dev_name, "--table", &table]).await
}

pub async fn deactivate_snapshot(dev_name: &str) -> Result<()> {
    run("dmsetup", &["remove", dev_name]).await
}

/// Quiesce all queued I/O on the device. Pair with [`resume_device`].
pub async fn suspend_device(dev: &Path) -> Result<()> {
    run("dmsetup", &["suspend", &dev.display().to_string()]).await
}

pub async fn resume_device(dev: &Path) -> Result<()> {
    run("dmsetup", &["resume", &dev.display().to_string()]).await
}

/// Flush dirty buffers for the device and drop the host's cached view, so a
/// following read-only mount observes what the guest actually wrote.
pub fn flush_buffers(dev: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(dev)
        .map_err(|e| Error::io("opening device", dev, e))?;
    file.sync_all()
        .map_err(|e| Error::io("syncing device", dev, e))?;
    unsafe { blkflsbuf(file.as_raw_fd()) }
        .map_err(|e| Error::io("BLKFLSBUF ioctl on", dev, e.into()))?;
    Ok(())
}

/// Mount an ext4 device.
///
/// All mounts are noatime/nodev/noexec/nosuid/silent. Read-only mounts skip
/// journal replay (`noload`) so a device captured mid-write stays readable.
pub fn mount_ext4(dev: &Path, mount_path: &Path, read_only: bool) -> Result<()> {
    let mut flags = MsFlags::MS_NOATIME
        | MsFlags::MS_NODEV
        | MsFlags::MS_NOEXEC
        | MsFlags::MS_NOSUID
        | MsFlags::MS_SILENT;
    let mut options: Vec<&str> = Vec::new();

    if read_only {
        flags |= MsFlags::MS_RDONLY;
        options.push("noload");
    }

    let data = options.join(",");
    mount(
        Some(dev),
        mount_path,
        Some("ext4"),
        flags,
        if data.is_empty() {
            None
        } else {
            Some(data.as_str())
        },
    )
    .map_err(|e| Error::io(format!("mounting {} at", dev.display()), mount_path, e.into()))
}

/// Mount a snapshot device at a fresh temporary mount point and return it.
pub fn mount_snapshot(dev: &Path, read_only: bool) -> Result<PathBuf> {
    let dev_name = dev
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snap".to_string());
    let mount_dir = std::env::temp_dir().join(format!("{dev_name}-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&mount_dir)
        .map_err(|e| Error::io("creating mount point", &mount_dir, e))?;

    if let Err(e) = mount_ext4(dev, &mount_dir, read_only) {
        let _ = std::fs::remove_dir_all(&mount_dir);
        return Err(e);
    }
    Ok(mount_dir)
}

/// Lazily unmount a snapshot mount point and remove it.
///
/// The detached unmount means a straggling open file does not block
/// teardown; the kernel finishes the unmount once the last user goes away.
pub fn unmount_snapshot(mount_path: &Path) -> Result<()> {
    umount2(mount_path, MntFlags::MNT_DETACH)
        .map_err(|e| Error::io("unmounting", mount_path, e.into()))?;
    std::fs::remove_dir_all(mount_path)
        .map_err(|e| Error::io("removing mount point", mount_path, e))
}

/// Punch holes over zero-filled blocks so on-disk size tracks logical
/// content. The file's length and contents are unchanged.
pub fn sparsify(path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::io("opening", path, e))?;
    let len = file
        .metadata()
        .map_err(|e| Error::io("reading metadata of", path, e))?
        .len();

    let mut buf = vec![0u8; SPARSIFY_BLOCK];
    let mut hole_start: Option<u64> = None;
    let mut punched: u64 = 0;
    let mut offset: u64 = 0;

    while offset < len {
        let chunk = (len - offset).min(SPARSIFY_BLOCK as u64) as usize;
        file.read_exact_at(&mut buf[..chunk], offset)
            .map_err(|e| Error::io("reading", path, e))?;

        if buf[..chunk].iter().all(|b| *b == 0) {
            hole_start.get_or_insert(offset);
        } else if let Some(start) = hole_start.take() {
            punch_hole(&file, path, start, offset - start)?;
            punched += offset - start;
        }
        offset += chunk as u64;
    }
    if let Some(start) = hole_start.take() {
        punch_hole(&file, path, start, len - start)?;
        punched += len - start;
    }

    debug!(path = %path.display(), punched, "sparsified file");
    Ok(())
}

fn punch_hole(file: &File, path: &Path, offset: u64, len: u64) -> Result<()> {
    use nix::fcntl::{fallocate, FallocateFlags};
    fallocate(
        file.as_raw_fd(),
        FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
        offset as i64,
        len as i64,
    )
    .map_err(|e| Error::io("punching holes in", path, e.into()))
}
