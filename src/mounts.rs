//! Mount table snapshots.
//!
//! The cleanup engine asks one question of the mount table: which mounts
//! currently reference a given block device. The production monitor answers
//! it from `/proc/self/mountinfo` (filesystem mounts) and `/proc/swaps`
//! (swap devices), snapshotted on every call.

use std::path::{Path, PathBuf};

/// What kind of mount an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountType {
    Filesystem,
    Swap,
}

/// One entry of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    path: PathBuf,
    device_number: u64,
    mount_type: MountType,
}

impl Mount {
    pub fn new(path: PathBuf, device_number: u64, mount_type: MountType) -> Self {
        Self {
            path,
            device_number,
            mount_type,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn device_number(&self) -> u64 {
        self.device_number
    }

    pub fn mount_type(&self) -> MountType {
        self.mount_type
    }
}

/// Snapshot interface onto the kernel's mount table.
pub trait MountMonitor: Send + Sync {
    /// Returns every mount whose backing device is `device_number`.
    fn mounts_for_dev(&self, device_number: u64) -> Vec<Mount>;
}

/// [`MountMonitor`] backed by procfs.
pub struct ProcMountMonitor {
    proc_root: PathBuf,
}

impl ProcMountMonitor {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }

    fn snapshot(&self) -> Vec<Mount> {
        let mut mounts = Vec::new();
        if let Ok(contents) = std::fs::read_to_string(self.proc_root.join("self/mountinfo")) {
            mounts.extend(parse_mountinfo(&contents));
        }
        if let Ok(contents) = std::fs::read_to_string(self.proc_root.join("swaps")) {
            mounts.extend(parse_swaps(&contents));
        }
        mounts
    }
}

impl Default for ProcMountMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MountMonitor for ProcMountMonitor {
    fn mounts_for_dev(&self, device_number: u64) -> Vec<Mount> {
        self.snapshot()
            .into_iter()
            .filter(|mount| mount.device_number() == device_number)
            .collect()
    }
}

fn parse_mountinfo(contents: &str) -> Vec<Mount> {
    let mut mounts = Vec::new();
    for line in contents.lines() {
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() < 5 {
            continue;
        }
        let Some((major, minor)) = fields[2].split_once(':') else {
            continue;
        };
        let (Ok(major), Ok(minor)) = (major.parse::<u64>(), minor.parse::<u64>()) else {
            continue;
        };
        let device_number = nix::sys::stat::makedev(major, minor);
        mounts.push(Mount::new(
            decode_mount_path(fields[4]),
            device_number,
            MountType::Filesystem,
        ));
    }
    mounts
}

fn parse_swaps(contents: &str) -> Vec<Mount> {
    let mut mounts = Vec::new();
    // first line is the header
    for line in contents.lines().skip(1) {
        let Some(device) = line.split_whitespace().next() else {
            continue;
        };
        let Ok(stat) = nix::sys::stat::stat(device) else {
            continue;
        };
        mounts.push(Mount::new(
            PathBuf::from(device),
            stat.st_rdev,
            MountType::Swap,
        ));
    }
    mounts
}

/// Decodes the octal escapes (`\040` etc.) mountinfo uses for special
/// characters in mount points.
fn decode_mount_path(escaped: &str) -> PathBuf {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.by_ref().take(3).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(byte) => out.push(byte as char),
            Err(_) => {
                out.push('\\');
                out.push_str(&digits);
            }
        }
    }
    PathBuf::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
36 35 253:0 / /media/secret rw,relatime shared:1 - ext4 /dev/dm-0 rw
37 35 8:1 / /media/with\\040space rw,relatime shared:2 - ext4 /dev/sda1 rw
38 35 0:22 / /proc rw - proc proc rw
";

    #[test]
    fn parses_device_numbers_and_mount_points() {
        let mounts = parse_mountinfo(MOUNTINFO);
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[0].path(), Path::new("/media/secret"));
        assert_eq!(mounts[0].device_number(), nix::sys::stat::makedev(253, 0));
        assert_eq!(mounts[0].mount_type(), MountType::Filesystem);
    }

    #[test]
    fn decodes_octal_escapes_in_mount_points() {
        let mounts = parse_mountinfo(MOUNTINFO);
        assert_eq!(mounts[1].path(), Path::new("/media/with space"));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let mounts = parse_mountinfo("garbage\n1 2\n");
        assert!(mounts.is_empty());
    }
}
