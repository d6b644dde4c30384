use std::path::PathBuf;
use std::sync::Arc;

use nix::sys::stat::makedev;

use crate::device::LinuxDevice;
use crate::error::Error;
use crate::mounts::{Mount, MountType};
use crate::r#loop::LoopStatus;
use crate::testkit::{test_daemon, TestDaemon};

fn block_device(td: &TestDaemon, name: &str, device_number: u64) -> LinuxDevice {
    let sysfs = td.state_dir.path().join("sys").join(name);
    std::fs::create_dir_all(&sysfs).unwrap();
    LinuxDevice::new(PathBuf::from(format!("/dev/{}", name)), sysfs, device_number)
}

fn dm_device(td: &TestDaemon, name: &str, device_number: u64, dm_uuid: &str) -> LinuxDevice {
    let device = block_device(td, name, device_number);
    std::fs::create_dir_all(device.sysfs_path().join("dm")).unwrap();
    std::fs::write(
        device.sysfs_path().join("dm/uuid"),
        format!("{}\n", dm_uuid),
    )
    .unwrap();
    device
}

/* -------------------------------------------------------------------- */
/* journal bookkeeping                                                  */

#[test]
fn mounted_fs_add_find_remove() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();
    let dev = makedev(8, 1);

    cleanup.add_mounted_fs("/media/disk", dev, 1000, false).unwrap();
    let (mount_point, entry) = cleanup.find_mounted_fs(dev).unwrap().unwrap();
    assert_eq!(mount_point, "/media/disk");
    assert_eq!(entry.mounted_by_uid, 1000);
    assert!(!entry.fstab_mount);

    assert!(cleanup.remove_mounted_fs("/media/disk").unwrap());
    assert!(cleanup.find_mounted_fs(dev).unwrap().is_none());
    assert!(!cleanup.remove_mounted_fs("/media/disk").unwrap());
}

#[test]
fn unlocked_luks_add_find_remove() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();
    let cleartext = makedev(253, 0);
    let crypto = makedev(8, 17);

    cleanup
        .add_unlocked_luks(cleartext, crypto, b"CRYPT-LUKS1-x", 1000)
        .unwrap();
    let (found, entry) = cleanup.find_unlocked_luks(crypto).unwrap().unwrap();
    assert_eq!(found, cleartext);
    assert_eq!(entry.dm_uuid, b"CRYPT-LUKS1-x".to_vec());

    assert!(cleanup.remove_unlocked_luks(cleartext).unwrap());
    assert!(cleanup.find_unlocked_luks(crypto).unwrap().is_none());
}

#[test]
fn loop_add_has_remove() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();

    cleanup
        .add_loop("/dev/loop3", b"/tmp/x.img", makedev(8, 1), 1000)
        .unwrap();
    let entry = cleanup.has_loop("/dev/loop3").unwrap().unwrap();
    assert_eq!(entry.setup_by_uid, 1000);

    assert!(cleanup.remove_loop("/dev/loop3").unwrap());
    assert!(cleanup.has_loop("/dev/loop3").unwrap().is_none());
}

#[test]
fn duplicate_journal_entries_are_rejected() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();

    cleanup.add_mounted_fs("/media/disk", makedev(8, 1), 0, false).unwrap();
    assert!(cleanup
        .add_mounted_fs("/media/disk", makedev(8, 2), 0, false)
        .is_err());

    cleanup
        .add_unlocked_luks(makedev(253, 0), makedev(8, 17), b"u", 0)
        .unwrap();
    assert!(cleanup
        .add_unlocked_luks(makedev(253, 0), makedev(8, 18), b"u", 0)
        .is_err());

    cleanup.add_loop("/dev/loop0", b"/tmp/a", makedev(8, 1), 0).unwrap();
    assert!(cleanup.add_loop("/dev/loop0", b"/tmp/b", makedev(8, 1), 0).is_err());
}

#[test]
fn mdraid_journal_records_the_latest_start() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();
    let dev = makedev(9, 0);

    cleanup.add_mdraid(dev, 1000).unwrap();
    cleanup.add_mdraid(dev, 1001).unwrap();
    assert_eq!(cleanup.find_mdraid(dev).unwrap().unwrap().started_by_uid, 1001);
    assert!(cleanup.find_mdraid(makedev(9, 1)).unwrap().is_none());
}

/* -------------------------------------------------------------------- */
/* ignore protocol                                                      */

#[test]
fn ignore_is_exclusive_until_unignored() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();

    assert!(cleanup.ignore_mounted_fs("/media/disk"));
    assert!(!cleanup.ignore_mounted_fs("/media/disk"));
    cleanup.unignore_mounted_fs("/media/disk");
    assert!(cleanup.ignore_mounted_fs("/media/disk"));

    assert!(cleanup.ignore_unlocked_luks(makedev(253, 0)));
    assert!(!cleanup.ignore_unlocked_luks(makedev(253, 0)));
    cleanup.unignore_unlocked_luks(makedev(253, 0));
    assert!(cleanup.ignore_unlocked_luks(makedev(253, 0)));

    assert!(cleanup.ignore_loop("/dev/loop0"));
    assert!(!cleanup.ignore_loop("/dev/loop0"));
    cleanup.unignore_loop("/dev/loop0");
    assert!(cleanup.ignore_loop("/dev/loop0"));
}

#[test]
fn in_flight_entry_is_never_discarded() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();
    let dev = makedev(8, 1);

    // device is gone, entry would normally be cleaned up
    cleanup.add_mounted_fs("/media/disk", dev, 1000, false).unwrap();
    assert!(cleanup.ignore_mounted_fs("/media/disk"));

    cleanup.check_in_thread();
    assert!(cleanup.find_mounted_fs(dev).unwrap().is_some());
    assert!(td.runner.recorded().is_empty());

    cleanup.unignore_mounted_fs("/media/disk");
    cleanup.check_in_thread();
    assert!(cleanup.find_mounted_fs(dev).unwrap().is_none());
}

/* -------------------------------------------------------------------- */
/* reconciliation passes                                                */

#[test]
fn orphaned_loop_device_is_detached() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();
    let backing_dev = makedev(8, 1);

    cleanup
        .add_loop("/dev/loop3", b"/tmp/x.img", backing_dev, 1000)
        .unwrap();
    // the backing device still exists but nothing mounts it
    td.devices.insert(block_device(&td, "sda1", backing_dev));
    td.loops.set_status(
        "/dev/loop3",
        Ok(LoopStatus {
            device_number: makedev(7, 3),
            backing_file: b"/tmp/x.img".to_vec(),
        }),
    );

    cleanup.check_in_thread();

    assert_eq!(td.runner.recorded(), vec!["losetup -d /dev/loop3".to_string()]);
    assert!(cleanup.has_loop("/dev/loop3").unwrap().is_none());
}

#[test]
fn stacked_mount_is_unwound_before_its_luks_backing_device() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();
    let cleartext = makedev(253, 0);
    let crypto = makedev(8, 17);

    let mount_point = td.media_root().join("X");
    std::fs::create_dir_all(&mount_point).unwrap();
    let mount_point_str = mount_point.display().to_string();

    cleanup
        .add_unlocked_luks(cleartext, crypto, b"CRYPT-LUKS1-abc", 1000)
        .unwrap();
    cleanup
        .add_mounted_fs(&mount_point_str, cleartext, 1000, false)
        .unwrap();

    // cleartext device is still there, the crypto device was unplugged
    td.devices
        .insert(dm_device(&td, "dm-0", cleartext, "CRYPT-LUKS1-abc"));
    td.mounts.set_mounts(vec![Mount::new(
        mount_point.clone(),
        cleartext,
        MountType::Filesystem,
    )]);

    cleanup.check_in_thread();

    assert_eq!(
        td.runner.recorded(),
        vec![
            format!("umount -l {}", mount_point_str),
            "cryptsetup luksClose /dev/dm-0".to_string(),
        ]
    );
    assert!(cleanup.find_mounted_fs(cleartext).unwrap().is_none());
    assert!(cleanup.find_unlocked_luks(crypto).unwrap().is_none());
    assert!(!mount_point.exists());
}

#[test]
fn quiescent_state_passes_make_no_mutations() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();
    let fs_dev = makedev(8, 2);
    let backing_dev = makedev(8, 1);
    let cleartext = makedev(253, 0);
    let crypto = makedev(8, 17);

    let mount_point = td.media_root().join("disk");
    std::fs::create_dir_all(&mount_point).unwrap();
    cleanup
        .add_mounted_fs(&mount_point.display().to_string(), fs_dev, 1000, false)
        .unwrap();
    cleanup
        .add_unlocked_luks(cleartext, crypto, b"CRYPT-LUKS1-abc", 1000)
        .unwrap();
    cleanup
        .add_loop("/dev/loop3", b"/tmp/x.img", backing_dev, 1000)
        .unwrap();

    td.devices.insert(block_device(&td, "sdb1", fs_dev));
    td.devices.insert(block_device(&td, "sda1", backing_dev));
    td.devices.insert(block_device(&td, "sdb2", crypto));
    td.devices
        .insert(dm_device(&td, "dm-0", cleartext, "CRYPT-LUKS1-abc"));
    td.mounts.set_mounts(vec![
        Mount::new(mount_point.clone(), fs_dev, MountType::Filesystem),
        Mount::new(PathBuf::from("/mnt/backing"), backing_dev, MountType::Filesystem),
    ]);
    td.loops.set_status(
        "/dev/loop3",
        Ok(LoopStatus {
            device_number: makedev(7, 3),
            backing_file: b"/tmp/x.img".to_vec(),
        }),
    );

    let journal_files = ["lib/mounted-fs", "run/unlocked-luks", "run/loop"];
    let before: Vec<Vec<u8>> = journal_files
        .iter()
        .map(|name| std::fs::read(td.state_dir.path().join(name)).unwrap())
        .collect();

    cleanup.check_in_thread();
    cleanup.check_in_thread();

    let after: Vec<Vec<u8>> = journal_files
        .iter()
        .map(|name| std::fs::read(td.state_dir.path().join(name)).unwrap())
        .collect();
    assert_eq!(before, after);
    assert!(td.runner.recorded().is_empty());
    assert!(mount_point.exists());
}

#[test]
fn failed_unmount_reinstates_the_entry_for_retry() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();
    let dev = makedev(8, 1);

    let mount_point = td.media_root().join("stuck");
    std::fs::create_dir_all(&mount_point).unwrap();
    let mount_point_str = mount_point.display().to_string();

    // still mounted, but the device itself is gone
    cleanup.add_mounted_fs(&mount_point_str, dev, 1000, false).unwrap();
    td.mounts.set_mounts(vec![Mount::new(
        mount_point.clone(),
        dev,
        MountType::Filesystem,
    )]);

    td.runner.fail_matching("umount", "target is busy");
    cleanup.check_in_thread();
    assert!(cleanup.find_mounted_fs(dev).unwrap().is_some());

    td.runner.clear_failures();
    td.runner.clear();
    cleanup.check_in_thread();
    assert_eq!(
        td.runner.recorded(),
        vec![format!("umount -l {}", mount_point_str)]
    );
    assert!(cleanup.find_mounted_fs(dev).unwrap().is_none());
    assert!(!mount_point.exists());
}

#[test]
fn mount_point_outside_the_media_root_is_not_removed() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();
    let dev = makedev(8, 1);

    let outside = td.state_dir.path().join("not-media/X");
    std::fs::create_dir_all(&outside).unwrap();

    cleanup
        .add_mounted_fs(&outside.display().to_string(), dev, 1000, false)
        .unwrap();

    cleanup.check_in_thread();

    // the stale entry is dropped, but the directory survives
    assert!(cleanup.find_mounted_fs(dev).unwrap().is_none());
    assert!(outside.exists());
}

#[test]
fn fstab_mount_points_are_left_in_place() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();
    let dev = makedev(8, 1);

    let mount_point = td.media_root().join("fstab");
    std::fs::create_dir_all(&mount_point).unwrap();
    cleanup
        .add_mounted_fs(&mount_point.display().to_string(), dev, 1000, true)
        .unwrap();

    cleanup.check_in_thread();

    assert!(cleanup.find_mounted_fs(dev).unwrap().is_none());
    assert!(mount_point.exists());
}

#[test]
fn loop_entry_with_unexpected_backing_name_gets_no_cleanup() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();

    cleanup
        .add_loop("/dev/loop3", b"/tmp/x.img", makedev(8, 1), 1000)
        .unwrap();
    td.loops.set_status(
        "/dev/loop3",
        Ok(LoopStatus {
            device_number: makedev(7, 3),
            backing_file: b"/tmp/other.img".to_vec(),
        }),
    );

    cleanup.check_in_thread();

    assert!(td.runner.recorded().is_empty());
    assert!(cleanup.has_loop("/dev/loop3").unwrap().is_none());
}

#[test]
fn manually_detached_loop_is_only_logged() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();

    cleanup
        .add_loop("/dev/loop3", b"/tmp/x.img", makedev(8, 1), 1000)
        .unwrap();
    // no status configured: the device node is gone

    cleanup.check_in_thread();

    assert!(td.runner.recorded().is_empty());
    assert!(cleanup.has_loop("/dev/loop3").unwrap().is_none());
}

#[test]
fn uninspectable_loop_entry_gets_no_cleanup() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();

    cleanup
        .add_loop("/dev/loop3", b"/tmp/x.img", makedev(8, 1), 1000)
        .unwrap();
    td.loops.set_status(
        "/dev/loop3",
        Err(Error::Failed("Error issuing LOOP_GET_STATUS64 ioctl".to_string())),
    );

    cleanup.check_in_thread();

    assert!(td.runner.recorded().is_empty());
    assert!(cleanup.has_loop("/dev/loop3").unwrap().is_none());
}

#[test]
fn reused_dm_minor_is_dropped_without_locking_it() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();
    let cleartext = makedev(253, 0);
    let crypto = makedev(8, 17);

    cleanup
        .add_unlocked_luks(cleartext, crypto, b"CRYPT-LUKS1-old", 1000)
        .unwrap();
    td.devices
        .insert(dm_device(&td, "dm-0", cleartext, "CRYPT-LUKS1-new"));
    td.devices.insert(block_device(&td, "sdb2", crypto));

    cleanup.check_in_thread();

    assert!(td.runner.recorded().is_empty());
    assert!(cleanup.find_unlocked_luks(crypto).unwrap().is_none());
}

#[test]
fn manually_removed_luks_device_is_only_logged() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();
    let cleartext = makedev(253, 0);
    let crypto = makedev(8, 17);

    cleanup
        .add_unlocked_luks(cleartext, crypto, b"CRYPT-LUKS1-abc", 1000)
        .unwrap();
    // neither the cleartext nor the crypto device exists any more

    cleanup.check_in_thread();

    assert!(td.runner.recorded().is_empty());
    assert!(cleanup.find_unlocked_luks(crypto).unwrap().is_none());
}

#[test]
fn kicked_passes_run_on_the_worker_thread() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();

    cleanup
        .add_loop("/dev/loop3", b"/tmp/x.img", makedev(8, 1), 1000)
        .unwrap();
    td.devices.insert(block_device(&td, "sda1", makedev(8, 1)));
    td.loops.set_status(
        "/dev/loop3",
        Ok(LoopStatus {
            device_number: makedev(7, 3),
            backing_file: b"/tmp/x.img".to_vec(),
        }),
    );

    // stop() joins the worker after the queued pass has run
    Arc::clone(cleanup).start();
    cleanup.kick();
    cleanup.stop();

    assert_eq!(td.runner.recorded(), vec!["losetup -d /dev/loop3".to_string()]);
    assert!(cleanup.has_loop("/dev/loop3").unwrap().is_none());
}

#[test]
fn backing_file_longer_than_the_kernel_field_still_validates() {
    let td = test_daemon();
    let cleanup = td.daemon.cleanup();
    let backing_dev = makedev(8, 1);

    let mut long_name = b"/tmp/".to_vec();
    long_name.extend(std::iter::repeat(b'x').take(100));
    let kernel_truncated: Vec<u8> = long_name[..crate::r#loop::LO_NAME_SIZE - 1].to_vec();

    cleanup
        .add_loop("/dev/loop3", &long_name, backing_dev, 1000)
        .unwrap();
    td.devices.insert(block_device(&td, "sda1", backing_dev));
    td.mounts.set_mounts(vec![Mount::new(
        PathBuf::from("/mnt/backing"),
        backing_dev,
        MountType::Filesystem,
    )]);
    td.loops.set_status(
        "/dev/loop3",
        Ok(LoopStatus {
            device_number: makedev(7, 3),
            backing_file: kernel_truncated,
        }),
    );

    cleanup.check_in_thread();

    // truncated match: the entry is valid and stays
    assert!(td.runner.recorded().is_empty());
    assert!(cleanup.has_loop("/dev/loop3").unwrap().is_some());
}
