//! Block device representation and the udev lookup contract.
//!
//! A [`LinuxDevice`] bundles the identity the rest of the daemon needs: the
//! device node, the device number and the sysfs directory, plus the property
//! set the enumeration layer attached to the device. Sysfs attributes are
//! read fresh on every access; several of the `md/*` files change without a
//! corresponding uevent, so caching them would publish stale state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

/// A block device as seen by the enumeration layer.
#[derive(Debug, Clone)]
pub struct LinuxDevice {
    device_file: PathBuf,
    sysfs_path: PathBuf,
    device_number: u64,
    properties: HashMap<String, String>,
}

impl LinuxDevice {
    pub fn new(device_file: PathBuf, sysfs_path: PathBuf, device_number: u64) -> Self {
        Self {
            device_file,
            sysfs_path,
            device_number,
            properties: HashMap::new(),
        }
    }

    /// Attaches an enumeration-layer property, builder style.
    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn device_file(&self) -> &Path {
        &self.device_file
    }

    pub fn sysfs_path(&self) -> &Path {
        &self.sysfs_path
    }

    pub fn device_number(&self) -> u64 {
        self.device_number
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn property_as_u32(&self, key: &str) -> u32 {
        self.property(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Reads a sysfs attribute relative to the device's sysfs directory.
    ///
    /// The value is re-read on every call.
    pub fn sysfs_attr(&self, attr: &str) -> Option<String> {
        let path = self.sysfs_path.join(attr);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Some(contents),
            Err(err) => {
                warn!("Error reading sysfs attr `{}': {}", path.display(), err);
                None
            }
        }
    }

    pub fn sysfs_attr_as_i32(&self, attr: &str) -> i32 {
        self.sysfs_attr(attr)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn sysfs_attr_as_u64(&self, attr: &str) -> u64 {
        self.sysfs_attr(attr)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Query interface onto the device enumeration layer.
pub trait DeviceLookup: Send + Sync {
    /// Looks up the block device with the given device number, or `None` if
    /// no such device currently exists.
    fn query_by_device_number(&self, device_number: u64) -> Option<LinuxDevice>;
}

/// [`DeviceLookup`] backed by `/sys/dev/block`.
pub struct SysfsDeviceLookup {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
}

impl SysfsDeviceLookup {
    pub fn new() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

impl Default for SysfsDeviceLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceLookup for SysfsDeviceLookup {
    fn query_by_device_number(&self, device_number: u64) -> Option<LinuxDevice> {
        let major = nix::sys::stat::major(device_number);
        let minor = nix::sys::stat::minor(device_number);
        let link = self
            .sysfs_root
            .join("dev/block")
            .join(format!("{}:{}", major, minor));
        let sysfs_path = std::fs::canonicalize(link).ok()?;

        // DEVNAME from the uevent file names the node under /dev.
        let uevent = std::fs::read_to_string(sysfs_path.join("uevent")).ok()?;
        let devname = uevent
            .lines()
            .find_map(|line| line.strip_prefix("DEVNAME="))?;
        let device_file = self.dev_root.join(devname);
        if !device_file.exists() {
            return None;
        }

        Some(LinuxDevice::new(device_file, sysfs_path, device_number))
    }
}
