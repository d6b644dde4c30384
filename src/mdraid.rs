//! Linux Software RAID arrays.
//!
//! Each detected array, running or stopped, is represented by a
//! [`MdRaidObject`] holding the member devices and, when assembled, the
//! array device. [`MdRaidObject::update`] reconciles the published state
//! with the kernel's, and the operation methods drive `mdadm` and sysfs
//! with authorization.

use std::io::Write;
use std::time::Duration;

use tracing::warn;

use crate::block::ObjectId;
use crate::daemon::{option_bool, ConfigurationItem, Daemon, Invocation, Options};
use crate::device::LinuxDevice;
use crate::error::{Error, Result};
use crate::gettext::gettext;
use crate::polkit;

/// Property carrying the declared member count, on a member device.
pub const PROP_MEMBER_DEVICES: &str = "STORAGED_MD_MEMBER_DEVICES";
/// Property carrying the RAID level, on a member device.
pub const PROP_MEMBER_LEVEL: &str = "STORAGED_MD_MEMBER_LEVEL";
/// Property carrying the array UUID, on a member device.
pub const PROP_MEMBER_UUID: &str = "STORAGED_MD_MEMBER_UUID";
/// Property carrying the array name, on a member device.
pub const PROP_MEMBER_NAME: &str = "STORAGED_MD_MEMBER_NAME";

/// Property carrying the declared member count, on the array device.
pub const PROP_DEVICES: &str = "STORAGED_MD_DEVICES";
/// Property carrying the RAID level, on the array device.
pub const PROP_LEVEL: &str = "STORAGED_MD_LEVEL";
/// Property carrying the array UUID, on the array device.
pub const PROP_UUID: &str = "STORAGED_MD_UUID";
/// Property carrying the array name, on the array device.
pub const PROP_NAME: &str = "STORAGED_MD_NAME";

/// How long `Start` waits for the assembled block device to appear.
const START_TIMEOUT: Duration = Duration::from_secs(10);

/// The object path for the array with the given UUID.
pub fn object_path_for_uuid(uuid: &str) -> ObjectId {
    let name: String = uuid
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("/org/storaged/Storaged/mdraid/{}", name)
}

/// An active device of a RAID array.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    zbus::zvariant::Type,
    zbus::zvariant::Value,
    zbus::zvariant::OwnedValue,
)]
pub struct ActiveDevice {
    /// Object path of the underlying block device.
    pub object_path: ObjectId,
    /// Slot the device currently fills, `-1` if it is not currently part of
    /// the array (spare or faulty).
    pub slot: i32,
    /// Kernel state flags for the device (`in_sync`, `spare`, `faulty`, ...).
    pub state: Vec<String>,
    /// Read errors detected on this device without it being evicted.
    pub num_read_errors: u64,
}

/// Published state of a RAID array, recomputed by [`MdRaidObject::update`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MdRaid {
    pub uuid: String,
    pub name: String,
    pub level: String,
    pub num_devices: u32,
    pub size: u64,
    pub degraded: u32,
    pub sync_action: String,
    pub sync_completed: f64,
    pub sync_rate: u64,
    pub sync_remaining_time: u64,
    pub bitmap_location: String,
    pub chunk_size: u64,
    pub active_devices: Vec<ActiveDevice>,
    pub child_configuration: Vec<ConfigurationItem>,
}

/// Whether arrays of this level keep redundant copies of data.
pub fn has_redundancy(level: &str) -> bool {
    matches!(level, "raid1" | "raid4" | "raid5" | "raid6" | "raid10")
}

/// Whether arrays of this level stripe data across members.
pub fn has_stripes(level: &str) -> bool {
    matches!(level, "raid0" | "raid4" | "raid5" | "raid6" | "raid10")
}

pub(crate) fn parse_sync_completed(value: &str) -> Option<(u64, u64)> {
    let (completed, total) = value.split_once('/')?;
    Some((completed.trim().parse().ok()?, total.trim().parse().ok()?))
}

pub(crate) fn sync_fraction(completed_sectors: u64, num_sectors: u64) -> f64 {
    if num_sectors == 0 {
        return 0.0;
    }
    (completed_sectors as f64 / num_sectors as f64).min(1.0)
}

/// Sorted by `(slot, object_path)` so that directory iteration order never
/// leaks into the published `active_devices` property.
pub(crate) fn sort_active_devices(devices: &mut [ActiveDevice]) {
    devices.sort_by(|a, b| {
        a.slot
            .cmp(&b.slot)
            .then_with(|| a.object_path.cmp(&b.object_path))
    });
}

/// A RAID array entity: the member devices, the array device when
/// assembled, and the published state derived from them.
#[derive(Debug)]
pub struct MdRaidObject {
    object_path: ObjectId,
    uuid: String,
    device: Option<LinuxDevice>,
    members: Vec<LinuxDevice>,
    raid: MdRaid,
}

impl MdRaidObject {
    pub fn new(object_path: ObjectId, uuid: String) -> Self {
        Self {
            object_path,
            uuid,
            device: None,
            members: Vec::new(),
            raid: MdRaid::default(),
        }
    }

    pub fn object_path(&self) -> &ObjectId {
        &self.object_path
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The published state as of the last [`Self::update`].
    pub fn raid(&self) -> &MdRaid {
        &self.raid
    }

    /// Routes a device event for this array's UUID: maintains the member
    /// list and the array device handle.
    pub fn uevent(&mut self, action: &str, device: LinuxDevice) {
        if device.property(PROP_MEMBER_UUID) == Some(self.uuid.as_str()) {
            self.members
                .retain(|member| member.device_number() != device.device_number());
            if action != "remove" {
                self.members.push(device);
            }
            return;
        }
        if device.property(PROP_UUID) == Some(self.uuid.as_str()) {
            if action == "remove" {
                self.device = None;
            } else {
                self.device = Some(device);
            }
        }
    }

    /// Whether both the array device and all members are gone; the daemon
    /// destroys the object when this becomes true.
    pub fn is_empty(&self) -> bool {
        self.device.is_none() && self.members.is_empty()
    }

    /// Reconciles the published state with the kernel's.
    ///
    /// Returns whether any published property changed.
    pub fn update(&mut self, daemon: &Daemon) -> bool {
        // Identity properties can come from a member device or from the
        // array device; prefer the former, member metadata survives a
        // stopped array.
        let Some(identity_device) = self.members.first().or(self.device.as_ref()) else {
            // this should never happen
            warn!("No members and no RAID device - bailing");
            return false;
        };

        let old = self.raid.clone();

        let (num_devices, level, uuid, name) = if !self.members.is_empty() {
            (
                identity_device.property_as_u32(PROP_MEMBER_DEVICES),
                identity_device
                    .property(PROP_MEMBER_LEVEL)
                    .unwrap_or_default()
                    .to_string(),
                identity_device
                    .property(PROP_MEMBER_UUID)
                    .unwrap_or_default()
                    .to_string(),
                identity_device
                    .property(PROP_MEMBER_NAME)
                    .unwrap_or_default()
                    .to_string(),
            )
        } else {
            (
                identity_device.property_as_u32(PROP_DEVICES),
                identity_device
                    .property(PROP_LEVEL)
                    .unwrap_or_default()
                    .to_string(),
                identity_device
                    .property(PROP_UUID)
                    .unwrap_or_default()
                    .to_string(),
                identity_device
                    .property(PROP_NAME)
                    .unwrap_or_default()
                    .to_string(),
            )
        };

        // the sysfs value is in 512-byte sectors
        let size = self
            .device
            .as_ref()
            .map(|device| 512 * device.sysfs_attr_as_u64("size"))
            .unwrap_or(0);

        let has_redundancy = has_redundancy(&level);
        let has_stripes = has_stripes(&level);

        let mut degraded = 0;
        let mut sync_action = String::new();
        let mut sync_completed_value: Option<String> = None;
        let mut bitmap_location = String::new();
        let mut chunk_size = 0;
        if let Some(device) = &self.device {
            if has_redundancy {
                // these files change without uevents, so they must be read
                // fresh every time
                degraded = device.sysfs_attr_as_u64("md/degraded") as u32;
                sync_action = device
                    .sysfs_attr("md/sync_action")
                    .map(|value| value.trim().to_string())
                    .unwrap_or_default();
                sync_completed_value = device
                    .sysfs_attr("md/sync_completed")
                    .map(|value| value.trim().to_string());
                bitmap_location = device
                    .sysfs_attr("md/bitmap/location")
                    .map(|value| value.trim().to_string())
                    .unwrap_or_default();
            }
            if has_stripes {
                chunk_size = device.sysfs_attr_as_u64("md/chunk_size");
            }
        }

        let mut sync_completed = 0.0;
        let mut sync_rate = 0;
        let mut sync_remaining_time = 0;
        if let (Some(device), Some(completed_value)) = (&self.device, &sync_completed_value) {
            if completed_value != "none" {
                if let Some((completed_sectors, num_sectors)) =
                    parse_sync_completed(completed_value)
                {
                    sync_completed = sync_fraction(completed_sectors, num_sectors);
                    // the kernel reports KiB/s, see drivers/md/md.c:sync_speed_show()
                    sync_rate = device.sysfs_attr_as_u64("md/sync_speed") * 1024;
                    if sync_rate > 0 {
                        let num_bytes_remaining =
                            num_sectors.saturating_sub(completed_sectors) * 512;
                        sync_remaining_time =
                            1_000_000u64.saturating_mul(num_bytes_remaining) / sync_rate;
                    }
                }
            }
        }

        // poll exactly while a sync operation is in flight
        let polling = matches!(
            sync_action.as_str(),
            "resync" | "recover" | "check" | "repair"
        );
        daemon.ensure_polling(&self.object_path, polling);

        let mut active_devices = Vec::new();
        if let Some(device) = &self.device {
            let md_dir = device.sysfs_path().join("md");
            if let Ok(entries) = std::fs::read_dir(&md_dir) {
                for entry in entries.flatten() {
                    let file_name = entry.file_name().to_string_lossy().into_owned();
                    if !file_name.starts_with("dev-") {
                        continue;
                    }
                    let block_link = md_dir.join(&file_name).join("block");
                    let Ok(block_sysfs_path) = std::fs::canonicalize(&block_link) else {
                        warn!("Unable to resolve {} symlink", block_link.display());
                        continue;
                    };
                    // no object yet during cold-plug; not worth a warning
                    let Some(member_object) = daemon.find_block_by_sysfs_path(&block_sysfs_path)
                    else {
                        continue;
                    };

                    let state = device
                        .sysfs_attr(&format!("md/{}/state", file_name))
                        .map(|value| {
                            value
                                .trim()
                                .split(',')
                                .map(|flag| flag.trim().to_string())
                                .filter(|flag| !flag.is_empty())
                                .collect()
                        })
                        .unwrap_or_default();
                    let slot_value = device
                        .sysfs_attr(&format!("md/{}/slot", file_name))
                        .map(|value| value.trim().to_string())
                        .unwrap_or_default();
                    let slot = if slot_value == "none" {
                        -1
                    } else {
                        slot_value.parse().unwrap_or(-1)
                    };
                    let num_read_errors =
                        device.sysfs_attr_as_u64(&format!("md/{}/errors", file_name));

                    active_devices.push(ActiveDevice {
                        object_path: member_object.object_path().clone(),
                        slot,
                        state,
                        num_read_errors,
                    });
                }
            }
            sort_active_devices(&mut active_devices);
        }

        let child_configuration = daemon.configuration().find_child_configuration(&uuid);

        self.raid = MdRaid {
            uuid,
            name,
            level,
            num_devices,
            size,
            degraded,
            sync_action,
            sync_completed,
            sync_rate,
            sync_remaining_time,
            bitmap_location,
            chunk_size,
            active_devices,
            child_configuration,
        };
        self.raid != old
    }

    fn started_by_uid(&self, daemon: &Daemon, raid_device: &LinuxDevice) -> u32 {
        match daemon.cleanup().find_mdraid(raid_device.device_number()) {
            Ok(Some(entry)) => entry.started_by_uid,
            // an array the daemon did not start is treated like one started
            // by root
            Ok(None) => 0,
            Err(err) => {
                warn!("Error getting mdraid: {}", err);
                0
            }
        }
    }

    /* ---------------------------------------------------------------- */
    /* operations                                                       */

    /// Starts (assembles) the array.
    pub fn start(&self, daemon: &Daemon, invocation: &Invocation, options: &Options) -> Result<()> {
        let caller_uid = daemon.caller_uid(invocation)?;
        let opt_start_degraded = option_bool(options, "start-degraded");

        if self.device.is_some() {
            return Err(Error::Failed("RAID Array is already running".to_string()));
        }
        if self.members.is_empty() {
            return Err(Error::Failed("No member devices".to_string()));
        }

        let message = gettext("Authentication is required to start a RAID array");
        daemon.check_authorization(invocation, polkit::ACTION_MANAGE_MD_RAID, options, &message)?;

        let mut argv = vec!["mdadm".to_string(), "--assemble".to_string()];
        if opt_start_degraded {
            argv.push("--run".to_string());
        }
        argv.extend([
            "--scan".to_string(),
            "--uuid".to_string(),
            self.raid.uuid.clone(),
        ]);
        daemon
            .launch_spawned_job("md-raid-start", caller_uid, argv)
            .map_err(|message| Error::Failed(format!("Error starting RAID array: {}", message)))?;
        invocation.check_cancelled()?;

        // sit and wait for the MD block device to show up
        let object_path = self.object_path.clone();
        let block = daemon
            .wait_for_block(START_TIMEOUT, |block| {
                block.mdraid().map(String::as_str) == Some(object_path.as_str())
            })
            .ok_or_else(|| {
                Error::TimedOut(
                    "Error waiting for MD block device after starting array".to_string(),
                )
            })?;

        daemon.cleanup().add_mdraid(block.device_number(), caller_uid)?;
        Ok(())
    }

    /// Stops the array.
    pub fn stop(&self, daemon: &Daemon, invocation: &Invocation, options: &Options) -> Result<()> {
        let caller_uid = daemon.caller_uid(invocation)?;

        let Some(raid_device) = &self.device else {
            return Err(Error::Failed("RAID Array is not running".to_string()));
        };

        let started_by_uid = self.started_by_uid(daemon, raid_device);
        if caller_uid != 0 && caller_uid != started_by_uid {
            let message = gettext("Authentication is required to stop a RAID array");
            daemon.check_authorization(
                invocation,
                polkit::ACTION_MANAGE_MD_RAID,
                options,
                &message,
            )?;
        }

        let device_file = raid_device.device_file().display().to_string();
        daemon
            .launch_spawned_job(
                "md-raid-stop",
                caller_uid,
                vec![
                    "mdadm".to_string(),
                    "--stop".to_string(),
                    device_file.clone(),
                ],
            )
            .map_err(|message| {
                Error::Failed(format!(
                    "Error stopping RAID array {}: {}",
                    device_file, message
                ))
            })?;
        invocation.check_cancelled()?;
        Ok(())
    }

    /// Adds a member device to the array.
    pub fn add_device(
        &self,
        daemon: &Daemon,
        invocation: &Invocation,
        new_member_object_path: &str,
        options: &Options,
    ) -> Result<()> {
        let caller_uid = daemon.caller_uid(invocation)?;

        let Some(raid_device) = &self.device else {
            return Err(Error::Failed("RAID Array is not running".to_string()));
        };
        let Some(new_member) = daemon.find_object_block(new_member_object_path) else {
            return Err(Error::Failed("No device for given object path".to_string()));
        };

        let started_by_uid = self.started_by_uid(daemon, raid_device);
        if caller_uid != 0 && caller_uid != started_by_uid {
            let message = gettext("Authentication is required to add a device to a RAID array");
            daemon.check_authorization(
                invocation,
                polkit::ACTION_MANAGE_MD_RAID,
                options,
                &message,
            )?;
        }

        let device_file = raid_device.device_file().display().to_string();
        let member_file = new_member.device_file().display().to_string();
        daemon
            .launch_spawned_job(
                "md-raid-add-device",
                caller_uid,
                vec![
                    "mdadm".to_string(),
                    "--manage".to_string(),
                    device_file.clone(),
                    "--add".to_string(),
                    member_file.clone(),
                ],
            )
            .map_err(|message| {
                Error::Failed(format!(
                    "Error adding {} to RAID array {}: {}",
                    member_file, device_file, message
                ))
            })?;
        invocation.check_cancelled()?;
        Ok(())
    }

    /// Removes a member device from the array, marking it faulty first if
    /// it is still in sync.
    pub fn remove_device(
        &self,
        daemon: &Daemon,
        invocation: &Invocation,
        member_object_path: &str,
        options: &Options,
    ) -> Result<()> {
        let caller_uid = daemon.caller_uid(invocation)?;
        let opt_wipe = option_bool(options, "wipe");

        let Some(raid_device) = &self.device else {
            return Err(Error::Failed("RAID Array is not running".to_string()));
        };
        let Some(member) = daemon.find_object_block(member_object_path) else {
            return Err(Error::Failed("No device for given object path".to_string()));
        };
        let member_states = self
            .raid
            .active_devices
            .iter()
            .find(|device| device.object_path == member_object_path)
            .map(|device| device.state.clone())
            .ok_or_else(|| {
                Error::Failed("Cannot determine member state of given object".to_string())
            })?;

        let started_by_uid = self.started_by_uid(daemon, raid_device);
        if caller_uid != 0 && caller_uid != started_by_uid {
            let message =
                gettext("Authentication is required to remove a device from a RAID array");
            daemon.check_authorization(
                invocation,
                polkit::ACTION_MANAGE_MD_RAID,
                options,
                &message,
            )?;
        }

        let device_file = raid_device.device_file().display().to_string();
        let member_file = member.device_file().display().to_string();

        // an in-sync member has to be marked faulty before removal
        if member_states.iter().any(|state| state == "in_sync") {
            daemon
                .launch_spawned_job(
                    "md-raid-fault-device",
                    caller_uid,
                    vec![
                        "mdadm".to_string(),
                        "--manage".to_string(),
                        device_file.clone(),
                        "--set-faulty".to_string(),
                        member_file.clone(),
                    ],
                )
                .map_err(|message| {
                    Error::Failed(format!(
                        "Error marking {} as faulty in RAID array {}: {}",
                        member_file, device_file, message
                    ))
                })?;
        }

        daemon
            .launch_spawned_job(
                "md-raid-remove-device",
                caller_uid,
                vec![
                    "mdadm".to_string(),
                    "--manage".to_string(),
                    device_file.clone(),
                    "--remove".to_string(),
                    member_file.clone(),
                ],
            )
            .map_err(|message| {
                Error::Failed(format!(
                    "Error removing {} from RAID array {}: {}",
                    member_file, device_file, message
                ))
            })?;

        if opt_wipe {
            daemon
                .launch_spawned_job(
                    "format-erase",
                    caller_uid,
                    vec!["wipefs".to_string(), "-a".to_string(), member_file.clone()],
                )
                .map_err(|message| {
                    Error::Failed(format!(
                        "Error wiping {} after removal from RAID array {}: {}",
                        member_file, device_file, message
                    ))
                })?;
        }
        invocation.check_cancelled()?;
        Ok(())
    }

    /// Moves the write-intent bitmap.
    pub fn set_bitmap_location(
        &self,
        daemon: &Daemon,
        invocation: &Invocation,
        value: &str,
        options: &Options,
    ) -> Result<()> {
        let caller_uid = daemon.caller_uid(invocation)?;

        if !(value == "none" || value == "internal") {
            return Err(Error::InvalidArgument(
                "Only values 'none' and 'internal' are currently supported.".to_string(),
            ));
        }

        let Some(raid_device) = &self.device else {
            return Err(Error::Failed("RAID Array is not running".to_string()));
        };

        let started_by_uid = self.started_by_uid(daemon, raid_device);
        if caller_uid != 0 && caller_uid != started_by_uid {
            let message = gettext(
                "Authentication is required to configure the write-intent bitmap on a RAID array",
            );
            daemon.check_authorization(
                invocation,
                polkit::ACTION_MANAGE_MD_RAID,
                options,
                &message,
            )?;
        }

        let device_file = raid_device.device_file().display().to_string();
        daemon
            .launch_spawned_job(
                "md-raid-set-bitmap",
                caller_uid,
                vec![
                    "mdadm".to_string(),
                    "--grow".to_string(),
                    device_file.clone(),
                    "--bitmap".to_string(),
                    value.to_string(),
                ],
            )
            .map_err(|message| {
                Error::Failed(format!(
                    "Error setting bitmap on RAID array {}: {}",
                    device_file, message
                ))
            })?;
        invocation.check_cancelled()?;
        Ok(())
    }

    /// Triggers or cancels a data scrub.
    ///
    /// This is a direct sysfs write: routing it through `mdadm --grow` has
    /// different semantics.
    pub fn request_sync_action(
        &self,
        daemon: &Daemon,
        invocation: &Invocation,
        sync_action: &str,
        options: &Options,
    ) -> Result<()> {
        let caller_uid = daemon.caller_uid(invocation)?;

        if !matches!(sync_action, "check" | "repair" | "idle") {
            return Err(Error::InvalidArgument(
                "Only values 'check', 'repair' and 'idle' are currently supported.".to_string(),
            ));
        }

        let Some(raid_device) = &self.device else {
            return Err(Error::Failed("RAID Array is not running".to_string()));
        };

        let started_by_uid = self.started_by_uid(daemon, raid_device);
        if caller_uid != 0 && caller_uid != started_by_uid {
            let message =
                gettext("Authentication is required to start/stop data scrubbing of a RAID array");
            daemon.check_authorization(
                invocation,
                polkit::ACTION_MANAGE_MD_RAID,
                options,
                &message,
            )?;
        }

        let path = raid_device.sysfs_path().join("md/sync_action");
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|err| Error::Failed(format!("Error opening {}: {}", path.display(), err)))?;
        file.write_all(sync_action.as_bytes()).map_err(|err| {
            Error::Failed(format!(
                "Error writing to sysfs file {}: {}",
                path.display(),
                err
            ))
        })?;
        Ok(())
    }

    /// Deletes the array: stop plus wiping of all members, optionally
    /// tearing down everything stacked on the array device first.
    pub fn delete(
        &self,
        daemon: &Daemon,
        invocation: &Invocation,
        options: &Options,
    ) -> Result<()> {
        let caller_uid = daemon.caller_uid(invocation)?;
        let teardown_flag = option_bool(options, "tear-down");

        let message = gettext("Authentication is required to delete a RAID array");
        daemon.check_authorization(invocation, polkit::ACTION_MANAGE_MD_RAID, options, &message)?;

        if teardown_flag {
            let message = gettext("Authentication is required to modify the system configuration");
            daemon.check_authorization(
                invocation,
                polkit::ACTION_MODIFY_SYSTEM_CONFIGURATION,
                options,
                &message,
            )?;

            match &self.device {
                Some(raid_device) => {
                    // the array is running, tear down its block device
                    if let Some(block) = daemon.find_block_by_device_file(raid_device.device_file())
                    {
                        daemon
                            .teardown()
                            .teardown(daemon, &block, invocation, options)?;
                    }
                }
                None => {
                    // not running, remove the child configuration instead
                    daemon
                        .configuration()
                        .remove_configuration(&self.raid.child_configuration)?;
                }
            }
        }

        if self.device.is_some() {
            self.stop(daemon, invocation, options)?;
        }

        for member in &self.members {
            let member_file = member.device_file().display().to_string();
            daemon
                .launch_spawned_job(
                    "format-erase",
                    caller_uid,
                    vec!["wipefs".to_string(), "-a".to_string(), member_file],
                )
                .map_err(|message| Error::Failed(format!("Error wiping device: {}", message)))?;
        }
        invocation.check_cancelled()?;
        Ok(())
    }
}
