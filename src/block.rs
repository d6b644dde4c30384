//! Block device objects and the registry that owns them.
//!
//! Every block device the enumeration layer reports gets an object identity
//! (an object path). Arrays and members reference each other through these
//! identities, resolved on demand through the registry. Objects never hold
//! owning references to each other.

use std::collections::BTreeMap;
use std::path::Path;

use crate::daemon::{Daemon, Invocation, Options};
use crate::device::LinuxDevice;
use crate::error::{Error, Result};

/// Stable object identity, shaped like a D-Bus object path.
pub type ObjectId = String;

/// The object path for a block device, derived from its device node name.
pub fn object_path_for_device(device: &LinuxDevice) -> ObjectId {
    let name = device
        .device_file()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    let name: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("/org/storaged/Storaged/block_devices/{}", name)
}

/// A block device object.
#[derive(Debug, Clone)]
pub struct Block {
    object_path: ObjectId,
    device: LinuxDevice,
    mdraid: Option<ObjectId>,
    mdraid_member: Option<ObjectId>,
}

impl Block {
    pub fn new(object_path: ObjectId, device: LinuxDevice) -> Self {
        Self {
            object_path,
            device,
            mdraid: None,
            mdraid_member: None,
        }
    }

    /// Marks this block as the array device of the given RAID object.
    pub fn with_mdraid(mut self, mdraid: ObjectId) -> Self {
        self.mdraid = Some(mdraid);
        self
    }

    /// Marks this block as a member of the given RAID object.
    pub fn with_mdraid_member(mut self, mdraid: ObjectId) -> Self {
        self.mdraid_member = Some(mdraid);
        self
    }

    pub fn object_path(&self) -> &ObjectId {
        &self.object_path
    }

    pub fn device(&self) -> &LinuxDevice {
        &self.device
    }

    pub fn device_file(&self) -> &Path {
        self.device.device_file()
    }

    pub fn device_number(&self) -> u64 {
        self.device.device_number()
    }

    pub fn sysfs_path(&self) -> &Path {
        self.device.sysfs_path()
    }

    /// The RAID array this block is the array device of, if any.
    pub fn mdraid(&self) -> Option<&ObjectId> {
        self.mdraid.as_ref()
    }

    /// The RAID array this block is a member of, if any.
    pub fn mdraid_member(&self) -> Option<&ObjectId> {
        self.mdraid_member.as_ref()
    }
}

/// Registry of all known block objects, keyed by object path.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    blocks: BTreeMap<ObjectId, Block>,
}

impl ObjectRegistry {
    pub fn insert_block(&mut self, block: Block) {
        self.blocks.insert(block.object_path().clone(), block);
    }

    pub fn remove_block(&mut self, object_path: &str) -> Option<Block> {
        self.blocks.remove(object_path)
    }

    pub fn block(&self, object_path: &str) -> Option<&Block> {
        self.blocks.get(object_path)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn find_block_by_sysfs_path(&self, sysfs_path: &Path) -> Option<&Block> {
        self.blocks()
            .find(|block| block.sysfs_path() == sysfs_path)
    }

    pub fn find_block_by_device_file(&self, device_file: &Path) -> Option<&Block> {
        self.blocks()
            .find(|block| block.device_file() == device_file)
    }

    pub fn find_block_by_device_number(&self, device_number: u64) -> Option<&Block> {
        self.blocks()
            .find(|block| block.device_number() == device_number)
    }
}

/// Contract for tearing down everything stacked on top of a block device
/// before it is stopped or deleted.
pub trait BlockTeardown: Send + Sync {
    fn teardown(
        &self,
        daemon: &Daemon,
        block: &Block,
        invocation: &Invocation,
        options: &Options,
    ) -> Result<()>;
}

/// [`BlockTeardown`] that unwinds the daemon's own bookkeeping: unmounts a
/// filesystem recorded in `mounted-fs` and locks a LUKS device recorded in
/// `unlocked-luks`, going through the in-flight ignore protocol so the
/// cleanup engine never races these steps.
pub struct LinuxBlockTeardown;

impl BlockTeardown for LinuxBlockTeardown {
    fn teardown(
        &self,
        daemon: &Daemon,
        block: &Block,
        invocation: &Invocation,
        _options: &Options,
    ) -> Result<()> {
        if let Some((mount_point, entry)) = daemon.cleanup().find_mounted_fs(block.device_number())?
        {
            if !daemon.cleanup().ignore_mounted_fs(&mount_point) {
                return Err(Error::Busy(format!(
                    "Mount point {} is already being unmounted",
                    mount_point
                )));
            }
            let result = unmount_tracked_fs(daemon, invocation, &mount_point, entry.fstab_mount);
            daemon.cleanup().unignore_mounted_fs(&mount_point);
            result?;
        }

        if let Some((cleartext_device, _)) =
            daemon.cleanup().find_unlocked_luks(block.device_number())?
        {
            if !daemon.cleanup().ignore_unlocked_luks(cleartext_device) {
                return Err(Error::Busy(
                    "Encrypted device is already being locked".to_string(),
                ));
            }
            let result = lock_tracked_luks(daemon, invocation, cleartext_device);
            daemon.cleanup().unignore_unlocked_luks(cleartext_device);
            result?;
        }

        Ok(())
    }
}

fn unmount_tracked_fs(
    daemon: &Daemon,
    invocation: &Invocation,
    mount_point: &str,
    fstab_mount: bool,
) -> Result<()> {
    let caller_uid = invocation.caller_uid().unwrap_or(0);
    daemon
        .launch_spawned_job(
            "filesystem-unmount",
            caller_uid,
            vec!["umount".to_string(), mount_point.to_string()],
        )
        .map_err(|message| {
            Error::Failed(format!("Error unmounting {}: {}", mount_point, message))
        })?;
    daemon.cleanup().remove_mounted_fs(mount_point)?;

    if !fstab_mount {
        let path = Path::new(mount_point);
        if path.starts_with(daemon.media_root()) && path.is_dir() {
            std::fs::remove_dir(path).map_err(|err| {
                Error::Failed(format!(
                    "Error removing mount point {}: {}",
                    mount_point, err
                ))
            })?;
        }
    }
    Ok(())
}

fn lock_tracked_luks(daemon: &Daemon, invocation: &Invocation, cleartext_device: u64) -> Result<()> {
    let caller_uid = invocation.caller_uid().unwrap_or(0);
    let device = daemon
        .device_lookup()
        .query_by_device_number(cleartext_device)
        .ok_or_else(|| Error::NotFound("Cleartext device is gone".to_string()))?;
    let device_file = device.device_file().display().to_string();
    daemon
        .launch_spawned_job(
            "encrypted-lock",
            caller_uid,
            vec![
                "cryptsetup".to_string(),
                "luksClose".to_string(),
                device_file.clone(),
            ],
        )
        .map_err(|message| Error::Failed(format!("Error locking {}: {}", device_file, message)))?;
    daemon.cleanup().remove_unlocked_luks(cleartext_device)?;
    Ok(())
}
