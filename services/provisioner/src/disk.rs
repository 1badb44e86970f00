//! Disk assembly.
//!
//! Gold disks are discovered in an unpacked image, ordered so boot disks
//! come before the seed (`configdrive`) disk, cloned into the machine's
//! private directory and attached to a single SATA controller together with
//! any optical media.
//!
//! # Invariants
//!
//! - Disk order is deterministic: `*.vdi` then `*.vmdk`, each sorted by
//!   name, seed disks moved last without reordering anything else
//! - A source disk gets a fresh UUID right before it is cloned, under the
//!   shared disk lock
//! - The controller always has one spare port beyond disks and optical media

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::hypervisor::{DriveType, Hypervisor, HypervisorError, StorageAttachment, StorageController};

/// Marker in a disk's file name identifying the seed disk.
pub const SEED_MARKER: &str = "configdrive";

/// Lock serializing heavy disk operations (unpack, UUID reset and clone).
pub type DiskLock = Arc<Mutex<()>>;

pub fn new_disk_lock() -> DiskLock {
    Arc::new(Mutex::new(()))
}

/// Errors from disk assembly.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("no virtual disks (*.vdi, *.vmdk) found in {}", .0.display())]
    NoDisks(PathBuf),

    #[error("failed to read disk directory {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("disk path {} has no file name", .0.display())]
    NoFileName(PathBuf),

    #[error("failed to copy optical disk {}: {source}", .path.display())]
    Optical {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e == ext)
}

fn is_seed(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().contains(SEED_MARKER))
}

/// Move seed disks after every other disk, keeping relative order otherwise.
pub fn sort_by_priority(disks: &mut [PathBuf]) {
    disks.sort_by_key(|disk| is_seed(disk));
}

/// List the virtual disks directly inside `dir`.
pub async fn gather_disks(dir: &Path) -> Result<Vec<PathBuf>, DiskError> {
    let read_error = |source| DiskError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_error)?;
    let mut vdis = Vec::new();
    let mut vmdks = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(read_error)? {
        let path = entry.path();
        if has_extension(&path, "vdi") {
            vdis.push(path);
        } else if has_extension(&path, "vmdk") {
            vmdks.push(path);
        }
    }

    vdis.sort();
    vmdks.sort();
    let mut disks = vdis;
    disks.append(&mut vmdks);

    if disks.is_empty() {
        return Err(DiskError::NoDisks(dir.to_path_buf()));
    }

    sort_by_priority(&mut disks);
    debug!(dir = %dir.display(), count = disks.len(), "Gathered disks");
    Ok(disks)
}

/// Clones gold disks and wires storage into machines.
pub struct DiskAssembler {
    hypervisor: Arc<dyn Hypervisor>,
    disk_lock: DiskLock,
}

impl DiskAssembler {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, disk_lock: DiskLock) -> Self {
        Self {
            hypervisor,
            disk_lock,
        }
    }

    /// Clone `src` into `dst_dir`, keeping its file name.
    pub async fn clone(&self, src: &Path, dst_dir: &Path) -> Result<PathBuf, DiskError> {
        let file_name = src
            .file_name()
            .ok_or_else(|| DiskError::NoFileName(src.to_path_buf()))?;
        let dst = dst_dir.join(file_name);

        let _guard = self.disk_lock.lock().await;
        self.hypervisor.set_disk_uuid(src).await?;
        self.hypervisor.clone_disk(src, &dst).await?;

        info!(src = %src.display(), dst = %dst.display(), "Disk cloned");
        Ok(dst)
    }

    /// Clone every disk in order.
    pub async fn clone_all(
        &self,
        disks: &[PathBuf],
        dst_dir: &Path,
    ) -> Result<Vec<PathBuf>, DiskError> {
        let mut cloned = Vec::with_capacity(disks.len());
        for disk in disks {
            cloned.push(self.clone(disk, dst_dir).await?);
        }
        Ok(cloned)
    }

    /// Create the SATA controller, attach `disks` as hard drives on ports
    /// `0..n`, then copy each optical image into `machine_dir` and attach it
    /// as a DVD drive on the following ports.
    pub async fn attach_all(
        &self,
        machine_id: &str,
        machine_dir: &Path,
        disks: &[PathBuf],
        optical: &[PathBuf],
    ) -> Result<(), DiskError> {
        let controller = StorageController::sata((disks.len() + optical.len() + 1) as u32);
        self.hypervisor
            .add_storage_controller(machine_id, &controller)
            .await?;

        for (port, disk) in disks.iter().enumerate() {
            self.hypervisor
                .attach_storage(
                    machine_id,
                    &controller.name,
                    &StorageAttachment {
                        port: port as u32,
                        device: 0,
                        drive: DriveType::Hdd,
                        medium: disk.clone(),
                    },
                )
                .await?;
        }

        for (i, image) in optical.iter().enumerate() {
            let copy = copy_optical(image, machine_dir).await?;
            self.hypervisor
                .attach_storage(
                    machine_id,
                    &controller.name,
                    &StorageAttachment {
                        port: (disks.len() + i) as u32,
                        device: 0,
                        drive: DriveType::Dvd,
                        medium: copy,
                    },
                )
                .await?;
        }

        info!(
            machine_id = %machine_id,
            disks = disks.len(),
            optical = optical.len(),
            ports = controller.port_count,
            "Storage attached"
        );
        Ok(())
    }
}

/// Copy an optical image into `dir`, flushed to disk and closed before
/// returning so the hypervisor can open it right away.
async fn copy_optical(src: &Path, dir: &Path) -> Result<PathBuf, DiskError> {
    let file_name = src
        .file_name()
        .ok_or_else(|| DiskError::NoFileName(src.to_path_buf()))?;
    let dst = dir.join(file_name);
    let copy_error = |source| DiskError::Optical {
        path: src.to_path_buf(),
        source,
    };

    let mut reader = tokio::fs::File::open(src).await.map_err(copy_error)?;
    let mut writer = tokio::fs::File::create(&dst).await.map_err(copy_error)?;
    tokio::io::copy(&mut reader, &mut writer)
        .await
        .map_err(copy_error)?;
    writer.flush().await.map_err(copy_error)?;
    writer.sync_all().await.map_err(copy_error)?;
    drop(writer);

    debug!(src = %src.display(), dst = %dst.display(), "Optical disk copied");
    Ok(dst)
}
