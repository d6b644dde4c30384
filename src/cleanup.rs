//! Cleanup of resources the daemon set up on behalf of users.
//!
//! When a device that was mounted, unlocked or loop-attached through
//! storaged disappears while still in use (a USB stick being yanked, a
//! crypto device unplugged), the leftovers have to be unwound. Journals of
//! everything the daemon set up are kept in the persistent store:
//!
//! | record | key | scope |
//! |---|---|---|
//! | `mounted-fs` | mount point | durable |
//! | `unlocked-luks` | cleartext device number | volatile |
//! | `loop` | loop device path | volatile |
//! | `mdraid` | array device number | durable |
//!
//! A dedicated worker thread serializes the cleanup actions. Each pass is
//! two-phase: stacked block devices (unlocked LUKS, loop) are first only
//! *checked*, recording the device numbers about to go away; the mount scan
//! then unmounts filesystems sitting on top of those before the second
//! phase tears the devices themselves down.
//!
//! Cleanup only ever happens for entries the daemon itself recorded, and
//! every action taken is logged so the administrator can see what was
//! unwound behind their back.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::sys::stat::{major, minor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::device::DeviceLookup;
use crate::error::{Error, Result};
use crate::job::JobRunner;
use crate::mounts::{MountMonitor, MountType};
use crate::r#loop::{self, LoopInspector};
use crate::store::{PersistentStore, StoreScope};

const MOUNTED_FS: &str = "mounted-fs";
const UNLOCKED_LUKS: &str = "unlocked-luks";
const LOOP: &str = "loop";
const MDRAID: &str = "mdraid";

/// `mounted-fs` journal entry: a filesystem the daemon mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountedFsEntry {
    pub block_device: u64,
    pub mounted_by_uid: u32,
    pub fstab_mount: bool,
}

/// `unlocked-luks` journal entry: a LUKS device the daemon unlocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UnlockedLuksEntry {
    pub crypto_device: u64,
    pub dm_uuid: Vec<u8>,
    pub unlocked_by_uid: u32,
}

/// `loop` journal entry: a loop device the daemon attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoopEntry {
    pub backing_file: Vec<u8>,
    pub backing_file_device: u64,
    pub setup_by_uid: u32,
}

/// `mdraid` journal entry: a RAID array the daemon started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MdRaidEntry {
    pub started_by_uid: u32,
}

type MountedFsJournal = BTreeMap<String, MountedFsEntry>;
type UnlockedLuksJournal = BTreeMap<u64, UnlockedLuksEntry>;
type LoopJournal = BTreeMap<String, LoopEntry>;
type MdRaidJournal = BTreeMap<u64, MdRaidEntry>;

/// Keys currently being operated on by API handlers; the worker must not
/// compete with them.
#[derive(Debug, Default)]
struct IgnoreSets {
    currently_unmounting: BTreeSet<String>,
    currently_locking: BTreeSet<u64>,
    currently_deleting: BTreeSet<String>,
}

enum WorkerMessage {
    Check,
    Quit,
}

struct Worker {
    tx: Sender<WorkerMessage>,
    thread: JoinHandle<()>,
}

/// The cleanup engine: journals, ignore sets and the worker thread.
///
/// One mutex guards the journals and the ignore sets; the worker holds it
/// for the duration of a pass, API methods for their critical section.
pub struct CleanupEngine {
    store: Arc<PersistentStore>,
    media_root: PathBuf,
    runner: Arc<dyn JobRunner>,
    device_lookup: Arc<dyn DeviceLookup>,
    mount_monitor: Arc<dyn MountMonitor>,
    loop_inspector: Arc<dyn LoopInspector>,
    lock: Mutex<IgnoreSets>,
    worker: Mutex<Option<Worker>>,
}

impl CleanupEngine {
    pub fn new(
        store: Arc<PersistentStore>,
        media_root: PathBuf,
        runner: Arc<dyn JobRunner>,
        device_lookup: Arc<dyn DeviceLookup>,
        mount_monitor: Arc<dyn MountMonitor>,
        loop_inspector: Arc<dyn LoopInspector>,
    ) -> Self {
        Self {
            store,
            media_root,
            runner,
            device_lookup,
            mount_monitor,
            loop_inspector,
            lock: Mutex::new(IgnoreSets::default()),
            worker: Mutex::new(None),
        }
    }

    /// Starts the cleanup thread.
    pub fn start(self: Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            warn!("Cleanup thread is already running");
            return;
        }
        let (tx, rx) = mpsc::channel();
        let engine = Arc::clone(&self);
        let thread = std::thread::spawn(move || {
            info!("Entering cleanup thread");
            while let Ok(message) = rx.recv() {
                match message {
                    WorkerMessage::Check => engine.check_in_thread(),
                    WorkerMessage::Quit => break,
                }
            }
            info!("Exiting cleanup thread");
        });
        *worker = Some(Worker { tx, thread });
    }

    /// Stops the cleanup thread. Blocks until it has exited; passes already
    /// queued are still executed first.
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = worker.tx.send(WorkerMessage::Quit);
        let _ = worker.thread.join();
    }

    /// Enqueues one reconciliation pass onto the worker. Callable from any
    /// thread, never blocks, never coalesces: a pass over quiescent state is
    /// idempotent, so duplicate kicks are harmless.
    pub fn kick(&self) {
        match &*self.worker.lock() {
            Some(worker) => {
                let _ = worker.tx.send(WorkerMessage::Check);
            }
            None => warn!("Cleanup check requested before the cleanup thread was started"),
        }
    }

    /// One reconciliation pass. Runs on the worker thread.
    pub(crate) fn check_in_thread(&self) {
        let ignored = self.lock.lock();

        info!("Cleanup check start");

        // Two-stage clean-up: a filesystem mounted on top of an unlocked
        // LUKS or loop device must be unmounted before the backing device
        // can be torn down. First only check the stacked devices, recording
        // what is about to go away ...
        let mut devs_to_clean: Vec<u64> = Vec::new();
        self.check_unlocked_luks(&ignored, true, &mut devs_to_clean);
        self.check_loop(&ignored, true, &mut devs_to_clean);

        // ... then unmount, knowing which backing devices are on the way out ...
        self.check_mounted_fs(&ignored, &devs_to_clean);

        // ... then tear the stacked devices down for real.
        self.check_unlocked_luks(&ignored, false, &mut Vec::new());
        self.check_loop(&ignored, false, &mut Vec::new());

        info!("Cleanup check end");
    }

    fn run_cleanup_job(
        &self,
        operation: &str,
        argv: Vec<String>,
    ) -> std::result::Result<(), String> {
        match self.runner.spawn_job(operation, 0, &argv) {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(output.error_message()),
            Err(err) => Err(err.to_string()),
        }
    }

    /* ---------------------------------------------------------------- */
    /* mounted-fs                                                       */

    fn check_mounted_fs(&self, ignored: &IgnoreSets, devs_to_clean: &[u64]) {
        let journal: MountedFsJournal = match self.store.get(StoreScope::Durable, MOUNTED_FS) {
            Ok(journal) => journal.unwrap_or_default(),
            Err(err) => {
                warn!("Error getting mounted-fs: {}", err);
                return;
            }
        };

        let mut kept = MountedFsJournal::new();
        let mut changed = false;
        for (mount_point, entry) in journal {
            if self.check_mounted_fs_entry(ignored, &mount_point, &entry, devs_to_clean) {
                kept.insert(mount_point, entry);
            } else {
                changed = true;
            }
        }

        if changed {
            if let Err(err) = self.store.set(StoreScope::Durable, MOUNTED_FS, &kept) {
                warn!("Error setting mounted-fs: {}", err);
            }
        }
    }

    /// Returns whether the entry should be kept.
    fn check_mounted_fs_entry(
        &self,
        ignored: &IgnoreSets,
        mount_point: &str,
        entry: &MountedFsEntry,
        devs_to_clean: &[u64],
    ) -> bool {
        // Entries being ignored are in the middle of an unmount operation.
        if ignored.currently_unmounting.contains(mount_point) {
            return true;
        }

        let block_device = entry.block_device;

        let is_mounted = self
            .mount_monitor
            .mounts_for_dev(block_device)
            .iter()
            .any(|mount| {
                mount.mount_type() == MountType::Filesystem
                    && mount.path() == Path::new(mount_point)
            });
        let device_exists = self
            .device_lookup
            .query_by_device_number(block_device)
            .is_some();
        let device_to_be_cleaned = devs_to_clean.contains(&block_device);

        if is_mounted && device_exists && !device_to_be_cleaned {
            return true;
        }

        if !device_exists {
            info!(
                "Cleaning up mount point {} (device {}:{} no longer exist)",
                mount_point,
                major(block_device),
                minor(block_device)
            );
        } else if device_to_be_cleaned {
            info!(
                "Cleaning up mount point {} (device {}:{} is about to be cleaned up)",
                mount_point,
                major(block_device),
                minor(block_device)
            );
        } else if !is_mounted {
            info!(
                "Cleaning up mount point {} (device {}:{} is not mounted)",
                mount_point,
                major(block_device),
                minor(block_device)
            );
        }

        if is_mounted {
            // right now -l is the only way to "force unmount" file systems
            let argv = vec![
                "umount".to_string(),
                "-l".to_string(),
                mount_point.to_string(),
            ];
            if let Err(message) = self.run_cleanup_job("cleanup-unmount", argv) {
                error!(
                    "Error cleaning up mount point {}: Error unmounting: {}",
                    mount_point, message
                );
                // keep the entry so we can clean it up later
                return true;
            }
        }

        if !entry.fstab_mount {
            let path = Path::new(mount_point);
            if !path.starts_with(&self.media_root) {
                // a corrupted journal must never remove arbitrary directories
                warn!(
                    "Refusing to remove mount point {} outside of {}",
                    mount_point,
                    self.media_root.display()
                );
            } else if path.is_dir() {
                if let Err(err) = std::fs::remove_dir(path) {
                    error!(
                        "Error cleaning up mount point {}: Error removing directory: {}",
                        mount_point, err
                    );
                    // keep the entry so we can clean it up later
                    return true;
                }
            }
        }

        false
    }

    /// Adds an entry to the `mounted-fs` journal. The mount point must not
    /// already have one; replacing requires an explicit remove.
    pub fn add_mounted_fs(
        &self,
        mount_point: &str,
        block_device: u64,
        uid: u32,
        fstab_mount: bool,
    ) -> Result<()> {
        let _ignored = self.lock.lock();
        let mut journal: MountedFsJournal = self
            .store
            .get(StoreScope::Durable, MOUNTED_FS)?
            .unwrap_or_default();
        if journal.contains_key(mount_point) {
            return Err(Error::Failed(format!(
                "mounted-fs already has an entry for {}",
                mount_point
            )));
        }
        journal.insert(
            mount_point.to_string(),
            MountedFsEntry {
                block_device,
                mounted_by_uid: uid,
                fstab_mount,
            },
        );
        self.store.set(StoreScope::Durable, MOUNTED_FS, &journal)
    }

    /// Removes an entry previously added with [`Self::add_mounted_fs`].
    /// Returns whether an entry was actually removed.
    pub fn remove_mounted_fs(&self, mount_point: &str) -> Result<bool> {
        let _ignored = self.lock.lock();
        let mut journal: MountedFsJournal = self
            .store
            .get(StoreScope::Durable, MOUNTED_FS)?
            .unwrap_or_default();
        let removed = journal.remove(mount_point).is_some();
        if removed {
            self.store.set(StoreScope::Durable, MOUNTED_FS, &journal)?;
        }
        Ok(removed)
    }

    /// Looks up the mount point the daemon mounted `block_device` at.
    pub fn find_mounted_fs(&self, block_device: u64) -> Result<Option<(String, MountedFsEntry)>> {
        let _ignored = self.lock.lock();
        let journal: MountedFsJournal = self
            .store
            .get(StoreScope::Durable, MOUNTED_FS)?
            .unwrap_or_default();
        Ok(journal
            .into_iter()
            .find(|(_, entry)| entry.block_device == block_device))
    }

    /// Marks `mount_point` as being operated on. Returns `false` if it
    /// already was, in which case the caller must fail with `Busy`.
    pub fn ignore_mounted_fs(&self, mount_point: &str) -> bool {
        self.lock
            .lock()
            .currently_unmounting
            .insert(mount_point.to_string())
    }

    /// Stops ignoring a mount point previously passed to
    /// [`Self::ignore_mounted_fs`].
    pub fn unignore_mounted_fs(&self, mount_point: &str) {
        if !self.lock.lock().currently_unmounting.remove(mount_point) {
            warn!("Mount point {} was not ignored", mount_point);
        }
    }

    /* ---------------------------------------------------------------- */
    /* unlocked-luks                                                    */

    fn check_unlocked_luks(
        &self,
        ignored: &IgnoreSets,
        check_only: bool,
        devs_to_clean: &mut Vec<u64>,
    ) {
        let journal: UnlockedLuksJournal = match self.store.get(StoreScope::Volatile, UNLOCKED_LUKS)
        {
            Ok(journal) => journal.unwrap_or_default(),
            Err(err) => {
                warn!("Error getting unlocked-luks: {}", err);
                return;
            }
        };

        let mut kept = UnlockedLuksJournal::new();
        let mut changed = false;
        for (cleartext_device, entry) in journal {
            if self.check_unlocked_luks_entry(
                ignored,
                cleartext_device,
                &entry,
                check_only,
                devs_to_clean,
            ) {
                kept.insert(cleartext_device, entry);
            } else {
                changed = true;
            }
        }

        if changed {
            if let Err(err) = self.store.set(StoreScope::Volatile, UNLOCKED_LUKS, &kept) {
                warn!("Error setting unlocked-luks: {}", err);
            }
        }
    }

    /// Returns whether the entry should be kept.
    fn check_unlocked_luks_entry(
        &self,
        ignored: &IgnoreSets,
        cleartext_device: u64,
        entry: &UnlockedLuksEntry,
        check_only: bool,
        devs_to_clean: &mut Vec<u64>,
    ) -> bool {
        // Entries being ignored are in the middle of a lock operation.
        if ignored.currently_locking.contains(&cleartext_device) {
            return true;
        }

        let mut is_unlocked = false;
        let mut attempt_no_cleanup = false;
        let mut cleartext_path: Option<PathBuf> = None;

        if let Some(device) = self.device_lookup.query_by_device_number(cleartext_device) {
            let current_dm_uuid = device
                .sysfs_attr("dm/uuid")
                .map(|value| value.trim_end().to_string())
                .unwrap_or_default();
            // if the UUID doesn't match, the dm minor has been reused
            if current_dm_uuid.as_bytes() != entry.dm_uuid.as_slice() {
                warn!(
                    "Removing unlocked-luks entry for device {}:{} because {} now has another dm-uuid {}",
                    major(cleartext_device),
                    minor(cleartext_device),
                    device.device_file().display(),
                    current_dm_uuid
                );
                attempt_no_cleanup = true;
            } else {
                is_unlocked = true;
            }
            cleartext_path = Some(device.device_file().to_path_buf());
        }

        let crypto_device_exists = self
            .device_lookup
            .query_by_device_number(entry.crypto_device)
            .is_some();

        let keep = is_unlocked && crypto_device_exists;

        if check_only && !keep {
            devs_to_clean.push(cleartext_device);
            return true;
        }

        if !keep && !attempt_no_cleanup {
            match cleartext_path.filter(|_| is_unlocked) {
                Some(path) => {
                    info!(
                        "Cleaning up LUKS device {} (backing device {}:{} no longer exist)",
                        path.display(),
                        major(entry.crypto_device),
                        minor(entry.crypto_device)
                    );
                    let argv = vec![
                        "cryptsetup".to_string(),
                        "luksClose".to_string(),
                        path.display().to_string(),
                    ];
                    if let Err(message) = self.run_cleanup_job("cleanup-luks-close", argv) {
                        error!(
                            "Error cleaning up LUKS device {}: {}",
                            path.display(),
                            message
                        );
                        // keep the entry so we can clean it up later
                        return true;
                    }
                }
                None => {
                    info!(
                        "LUKS device {}:{} was manually removed",
                        major(cleartext_device),
                        minor(cleartext_device)
                    );
                }
            }
        }

        keep
    }

    /// Adds an entry to the `unlocked-luks` journal.
    pub fn add_unlocked_luks(
        &self,
        cleartext_device: u64,
        crypto_device: u64,
        dm_uuid: &[u8],
        uid: u32,
    ) -> Result<()> {
        let _ignored = self.lock.lock();
        let mut journal: UnlockedLuksJournal = self
            .store
            .get(StoreScope::Volatile, UNLOCKED_LUKS)?
            .unwrap_or_default();
        if journal.contains_key(&cleartext_device) {
            return Err(Error::Failed(format!(
                "unlocked-luks already has an entry for device {}:{}",
                major(cleartext_device),
                minor(cleartext_device)
            )));
        }
        journal.insert(
            cleartext_device,
            UnlockedLuksEntry {
                crypto_device,
                dm_uuid: dm_uuid.to_vec(),
                unlocked_by_uid: uid,
            },
        );
        self.store.set(StoreScope::Volatile, UNLOCKED_LUKS, &journal)
    }

    /// Removes an entry previously added with [`Self::add_unlocked_luks`].
    pub fn remove_unlocked_luks(&self, cleartext_device: u64) -> Result<bool> {
        let _ignored = self.lock.lock();
        let mut journal: UnlockedLuksJournal = self
            .store
            .get(StoreScope::Volatile, UNLOCKED_LUKS)?
            .unwrap_or_default();
        let removed = journal.remove(&cleartext_device).is_some();
        if removed {
            self.store
                .set(StoreScope::Volatile, UNLOCKED_LUKS, &journal)?;
        }
        Ok(removed)
    }

    /// Looks up the cleartext device the daemon unlocked `crypto_device` as.
    pub fn find_unlocked_luks(
        &self,
        crypto_device: u64,
    ) -> Result<Option<(u64, UnlockedLuksEntry)>> {
        let _ignored = self.lock.lock();
        let journal: UnlockedLuksJournal = self
            .store
            .get(StoreScope::Volatile, UNLOCKED_LUKS)?
            .unwrap_or_default();
        Ok(journal
            .into_iter()
            .find(|(_, entry)| entry.crypto_device == crypto_device))
    }

    /// Marks a cleartext device as being operated on; `false` means it
    /// already was.
    pub fn ignore_unlocked_luks(&self, cleartext_device: u64) -> bool {
        self.lock.lock().currently_locking.insert(cleartext_device)
    }

    /// Stops ignoring a cleartext device previously passed to
    /// [`Self::ignore_unlocked_luks`].
    pub fn unignore_unlocked_luks(&self, cleartext_device: u64) {
        if !self.lock.lock().currently_locking.remove(&cleartext_device) {
            warn!(
                "Device {}:{} was not ignored",
                major(cleartext_device),
                minor(cleartext_device)
            );
        }
    }

    /* ---------------------------------------------------------------- */
    /* loop                                                             */

    fn check_loop(&self, ignored: &IgnoreSets, check_only: bool, devs_to_clean: &mut Vec<u64>) {
        let journal: LoopJournal = match self.store.get(StoreScope::Volatile, LOOP) {
            Ok(journal) => journal.unwrap_or_default(),
            Err(err) => {
                warn!("Error getting loop: {}", err);
                return;
            }
        };

        let mut kept = LoopJournal::new();
        let mut changed = false;
        for (loop_device, entry) in journal {
            if self.check_loop_entry(ignored, &loop_device, &entry, check_only, devs_to_clean) {
                kept.insert(loop_device, entry);
            } else {
                changed = true;
            }
        }

        if changed {
            if let Err(err) = self.store.set(StoreScope::Volatile, LOOP, &kept) {
                warn!("Error setting loop: {}", err);
            }
        }
    }

    /// Returns whether the entry should be kept.
    fn check_loop_entry(
        &self,
        ignored: &IgnoreSets,
        loop_device: &str,
        entry: &LoopEntry,
        check_only: bool,
        devs_to_clean: &mut Vec<u64>,
    ) -> bool {
        // Entries being ignored are in the middle of a delete operation.
        if ignored.currently_deleting.contains(loop_device) {
            return true;
        }

        let status = match self.loop_inspector.status(Path::new(loop_device)) {
            Ok(status) => Some(status),
            Err(Error::NotFound(_)) => None,
            Err(err) => {
                error!("Error checking loop device {}: {}", loop_device, err);
                // an entry we cannot inspect gets no cleanup attempt
                return check_only;
            }
        };

        let mut is_setup = false;
        let mut loop_device_number = None;
        if let Some(status) = &status {
            if !r#loop::backing_file_matches(&status.backing_file, &entry.backing_file) {
                error!(
                    "unexpected name for device {} - expected `{}' but got `{}'",
                    loop_device,
                    r#loop::truncated_name(&entry.backing_file),
                    String::from_utf8_lossy(&status.backing_file)
                );
                return check_only;
            }
            is_setup = true;
            loop_device_number = Some(status.device_number);
        }

        let mut has_backing_device = false;
        let mut backing_device_mounted = false;
        if self
            .device_lookup
            .query_by_device_number(entry.backing_file_device)
            .is_some()
        {
            has_backing_device = true;
            backing_device_mounted = !self
                .mount_monitor
                .mounts_for_dev(entry.backing_file_device)
                .is_empty();
        }

        let keep = is_setup && has_backing_device && backing_device_mounted;

        if check_only && !keep {
            if let Some(device_number) = loop_device_number {
                devs_to_clean.push(device_number);
            }
            return true;
        }

        if !keep {
            if is_setup {
                if !has_backing_device {
                    info!(
                        "Cleaning up loop device {} (backing device {}:{} no longer exist)",
                        loop_device,
                        major(entry.backing_file_device),
                        minor(entry.backing_file_device)
                    );
                } else {
                    info!(
                        "Cleaning up loop device {} (backing device {}:{} no longer mounted)",
                        loop_device,
                        major(entry.backing_file_device),
                        minor(entry.backing_file_device)
                    );
                }
                let argv = vec![
                    "losetup".to_string(),
                    "-d".to_string(),
                    loop_device.to_string(),
                ];
                if let Err(message) = self.run_cleanup_job("cleanup-loop-delete", argv) {
                    error!("Error cleaning up loop device {}: {}", loop_device, message);
                    // keep the entry so we can clean it up later
                    return true;
                }
            } else {
                info!("loop device {} was manually deleted", loop_device);
            }
        }

        keep
    }

    /// Adds an entry to the `loop` journal.
    pub fn add_loop(
        &self,
        device_file: &str,
        backing_file: &[u8],
        backing_file_device: u64,
        uid: u32,
    ) -> Result<()> {
        let _ignored = self.lock.lock();
        let mut journal: LoopJournal = self
            .store
            .get(StoreScope::Volatile, LOOP)?
            .unwrap_or_default();
        if journal.contains_key(device_file) {
            return Err(Error::Failed(format!(
                "loop already has an entry for {}",
                device_file
            )));
        }
        journal.insert(
            device_file.to_string(),
            LoopEntry {
                backing_file: backing_file.to_vec(),
                backing_file_device,
                setup_by_uid: uid,
            },
        );
        self.store.set(StoreScope::Volatile, LOOP, &journal)
    }

    /// Removes an entry previously added with [`Self::add_loop`].
    pub fn remove_loop(&self, device_file: &str) -> Result<bool> {
        let _ignored = self.lock.lock();
        let mut journal: LoopJournal = self
            .store
            .get(StoreScope::Volatile, LOOP)?
            .unwrap_or_default();
        let removed = journal.remove(device_file).is_some();
        if removed {
            self.store.set(StoreScope::Volatile, LOOP, &journal)?;
        }
        Ok(removed)
    }

    /// Whether `device_file` was set up through the daemon.
    pub fn has_loop(&self, device_file: &str) -> Result<Option<LoopEntry>> {
        let _ignored = self.lock.lock();
        let journal: LoopJournal = self
            .store
            .get(StoreScope::Volatile, LOOP)?
            .unwrap_or_default();
        Ok(journal.get(device_file).cloned())
    }

    /// Marks a loop device as being operated on; `false` means it already
    /// was.
    pub fn ignore_loop(&self, device_file: &str) -> bool {
        self.lock
            .lock()
            .currently_deleting
            .insert(device_file.to_string())
    }

    /// Stops ignoring a loop device previously passed to
    /// [`Self::ignore_loop`].
    pub fn unignore_loop(&self, device_file: &str) {
        if !self.lock.lock().currently_deleting.remove(device_file) {
            warn!("Loop device {} was not ignored", device_file);
        }
    }

    /* ---------------------------------------------------------------- */
    /* mdraid                                                           */

    /// Records which user started the array behind `raid_device`.
    ///
    /// Unlike the other journals this one is pure bookkeeping: the worker
    /// never scans it, and restarting an array legitimately replaces the
    /// previous record.
    pub fn add_mdraid(&self, raid_device: u64, uid: u32) -> Result<()> {
        let _ignored = self.lock.lock();
        let mut journal: MdRaidJournal = self
            .store
            .get(StoreScope::Durable, MDRAID)?
            .unwrap_or_default();
        journal.insert(
            raid_device,
            MdRaidEntry {
                started_by_uid: uid,
            },
        );
        self.store.set(StoreScope::Durable, MDRAID, &journal)
    }

    /// Looks up who started the array behind `raid_device`.
    pub fn find_mdraid(&self, raid_device: u64) -> Result<Option<MdRaidEntry>> {
        let _ignored = self.lock.lock();
        let journal: MdRaidJournal = self
            .store
            .get(StoreScope::Durable, MDRAID)?
            .unwrap_or_default();
        Ok(journal.get(&raid_device).cloned())
    }
}
