//! Loop device inspection.
//!
//! Validating a `loop` journal entry means asking the kernel what the loop
//! device is actually backed by and comparing that against the recorded
//! backing file. The kernel reports the name through `LOOP_GET_STATUS64`,
//! whose `lo_file_name` field holds at most `LO_NAME_SIZE - 1` bytes;
//! [`backing_file_matches`] applies the same truncation to the recorded name
//! before comparing.

use std::os::fd::AsRawFd;
use std::path::Path;

use nix::sys::stat::SFlag;

use crate::error::{Error, Result};

/// Size of the `lo_file_name` and `lo_crypt_name` fields, from
/// `<linux/loop.h>`.
pub const LO_NAME_SIZE: usize = 64;

const LO_KEY_SIZE: usize = 32;
const LOOP_GET_STATUS64: u32 = 0x4C05;

/// `struct loop_info64` from `<linux/loop.h>`.
#[repr(C)]
#[derive(Clone, Copy)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        // all-zero is a valid ioctl out-parameter
        unsafe { std::mem::zeroed() }
    }
}

mod ioctl {
    nix::ioctl_read_bad!(loop_get_status64, super::LOOP_GET_STATUS64, super::LoopInfo64);
}

/// What the kernel reports about an attached loop device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopStatus {
    /// Device number of the loop device node itself.
    pub device_number: u64,
    /// Backing file name as reported by the kernel, truncated to
    /// `LO_NAME_SIZE - 1` bytes at the source.
    pub backing_file: Vec<u8>,
}

/// Contract for querying loop device status.
pub trait LoopInspector: Send + Sync {
    /// Queries the loop device at `device_file`.
    ///
    /// Returns [`Error::NotFound`] when the device node is gone or no longer
    /// has a backing file attached (the device was manually detached), and
    /// [`Error::Failed`] for any other inspection failure.
    fn status(&self, device_file: &Path) -> Result<LoopStatus>;
}

/// [`LoopInspector`] issuing the real ioctl.
pub struct LinuxLoopInspector;

impl LoopInspector for LinuxLoopInspector {
    fn status(&self, device_file: &Path) -> Result<LoopStatus> {
        let stat = match nix::sys::stat::stat(device_file) {
            Ok(stat) => stat,
            Err(nix::errno::Errno::ENOENT) => {
                return Err(Error::NotFound(format!(
                    "No such device {}",
                    device_file.display()
                )));
            }
            Err(err) => {
                return Err(Error::Failed(format!(
                    "Error statting {}: {}",
                    device_file.display(),
                    err
                )));
            }
        };
        if !SFlag::from_bits_truncate(stat.st_mode & SFlag::S_IFMT.bits()).contains(SFlag::S_IFBLK)
        {
            return Err(Error::NotFound(format!(
                "{} is not a block device",
                device_file.display()
            )));
        }

        let file = std::fs::File::open(device_file).map_err(|err| {
            Error::Failed(format!("Error opening {}: {}", device_file.display(), err))
        })?;
        let mut info = LoopInfo64::default();
        match unsafe { ioctl::loop_get_status64(file.as_raw_fd(), &mut info) } {
            Ok(_) => {}
            // ENXIO: nothing attached to this loop device any more
            Err(nix::errno::Errno::ENXIO) => {
                return Err(Error::NotFound(format!(
                    "No loop device attached at {}",
                    device_file.display()
                )));
            }
            Err(err) => {
                return Err(Error::Failed(format!(
                    "Error issuing LOOP_GET_STATUS64 ioctl on {}: {}",
                    device_file.display(),
                    err
                )));
            }
        }

        let name_len = info
            .lo_file_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(LO_NAME_SIZE);
        Ok(LoopStatus {
            device_number: stat.st_rdev,
            backing_file: info.lo_file_name[..name_len].to_vec(),
        })
    }
}

/// Whether the kernel-reported backing file name matches a recorded one.
///
/// Byte-wise `strncmp` semantics over `LO_NAME_SIZE - 1` bytes: the recorded
/// name is truncated to the same length the kernel can store.
pub fn backing_file_matches(kernel_name: &[u8], recorded: &[u8]) -> bool {
    for i in 0..LO_NAME_SIZE - 1 {
        let a = kernel_name.get(i).copied().unwrap_or(0);
        let b = recorded.get(i).copied().unwrap_or(0);
        if a != b {
            return false;
        }
        if a == 0 {
            return true;
        }
    }
    true
}

/// The prefix of `recorded` that fits in the kernel's name field, for log
/// messages.
pub fn truncated_name(recorded: &[u8]) -> String {
    let end = recorded.len().min(LO_NAME_SIZE - 1);
    String::from_utf8_lossy(&recorded[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_names_match() {
        assert!(backing_file_matches(b"/tmp/x.img", b"/tmp/x.img"));
    }

    #[test]
    fn different_names_do_not_match() {
        assert!(!backing_file_matches(b"/tmp/x.img", b"/tmp/y.img"));
        assert!(!backing_file_matches(b"/tmp/x.img", b"/tmp/x.img.bak"));
    }

    #[test]
    fn names_longer_than_the_kernel_field_compare_truncated() {
        let mut recorded = vec![b'a'; LO_NAME_SIZE + 20];
        recorded[0] = b'/';
        // the kernel stored only the first LO_NAME_SIZE - 1 bytes
        let kernel: Vec<u8> = recorded[..LO_NAME_SIZE - 1].to_vec();
        assert!(backing_file_matches(&kernel, &recorded));

        let mut other = recorded.clone();
        other[10] = b'b';
        assert!(!backing_file_matches(&kernel, &other));

        // differences past the truncation point are invisible
        let mut past_end = recorded.clone();
        past_end[LO_NAME_SIZE - 1] = b'z';
        assert!(backing_file_matches(&kernel, &past_end));
    }

    #[test]
    fn loop_info64_layout_matches_the_kernel() {
        assert_eq!(std::mem::size_of::<LoopInfo64>(), 232);
    }
}
