//! The daemon object: wiring, object registry and invocation context.
//!
//! [`Daemon`] owns the persistent store, the cleanup engine, the block
//! object registry and the RAID array objects, and hands the collaborator
//! contracts (authorization, job running, device lookup, mount monitoring,
//! configuration, teardown) to the code that needs them. No ambient
//! globals: everything is reachable from here.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::block::{Block, BlockTeardown, LinuxBlockTeardown, ObjectId, ObjectRegistry};
use crate::cleanup::CleanupEngine;
use crate::config::Config;
use crate::device::{DeviceLookup, LinuxDevice, SysfsDeviceLookup};
use crate::error::{Error, Result};
use crate::job::{JobRunner, SpawnedJobRunner};
use crate::mdraid::{self, MdRaidObject};
use crate::mounts::{MountMonitor, ProcMountMonitor};
use crate::poller::SyncPoller;
use crate::polkit::{Authority, PolkitAuthority};
use crate::r#loop::{LinuxLoopInspector, LoopInspector};
use crate::store::PersistentStore;

/// Method options, a string-keyed variant dictionary.
///
/// Keys outside the set a method recognizes are ignored.
pub type Options = HashMap<String, zbus::zvariant::OwnedValue>;

/// Looks up a boolean option, treating absence and type mismatches as
/// `false`.
pub fn option_bool(options: &Options, key: &str) -> bool {
    options
        .get(key)
        .and_then(|value| bool::try_from(value.clone()).ok())
        .unwrap_or(false)
}

/// Standard options.
///
/// - `auth.no_user_interaction`: if `true`, authorization checks never show
///   an interactive authentication dialog.
pub fn standard_options(no_user_auth_interaction: bool) -> Options {
    let mut options = Options::new();
    if let Ok(value) = zbus::zvariant::Value::from(no_user_auth_interaction).try_into() {
        options.insert("auth.no_user_interaction".to_string(), value);
    }
    options
}

/// Context of one method invocation: who is calling, and whether the call
/// has been cancelled.
///
/// Cancellation never interrupts an in-flight external command; the result
/// is discarded and the caller gets [`Error::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    caller_uid: Option<u32>,
    sender: Option<String>,
    cancelled: Arc<AtomicBool>,
}

impl Invocation {
    pub fn new(caller_uid: u32) -> Self {
        Self {
            caller_uid: Some(caller_uid),
            ..Self::default()
        }
    }

    /// An invocation whose caller identity could not be established.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn caller_uid(&self) -> Option<u32> {
        self.caller_uid
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A system configuration item (an fstab or crypttab style entry) that
/// references a managed device.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConfigurationItem {
    pub kind: String,
    pub details: BTreeMap<String, String>,
}

/// Contract onto the system configuration database.
pub trait Configuration: Send + Sync {
    /// Configuration items referencing the array with the given UUID.
    fn find_child_configuration(&self, uuid: &str) -> Vec<ConfigurationItem>;

    /// Removes the given items from the system configuration.
    fn remove_configuration(&self, items: &[ConfigurationItem]) -> Result<()>;
}

/// [`Configuration`] for hosts without a configuration database wired in.
pub struct NullConfiguration;

impl Configuration for NullConfiguration {
    fn find_child_configuration(&self, _uuid: &str) -> Vec<ConfigurationItem> {
        Vec::new()
    }

    fn remove_configuration(&self, _items: &[ConfigurationItem]) -> Result<()> {
        Ok(())
    }
}

/// The collaborator set injected into the daemon.
pub struct Collaborators {
    pub authority: Arc<dyn Authority>,
    pub runner: Arc<dyn JobRunner>,
    pub device_lookup: Arc<dyn DeviceLookup>,
    pub mount_monitor: Arc<dyn MountMonitor>,
    pub loop_inspector: Arc<dyn LoopInspector>,
    pub configuration: Arc<dyn Configuration>,
    pub teardown: Arc<dyn BlockTeardown>,
}

impl Collaborators {
    /// The production set: polkit authorization, spawned jobs, sysfs and
    /// procfs backed lookups.
    pub fn system() -> Result<Self> {
        Ok(Self {
            authority: Arc::new(PolkitAuthority::system()?),
            runner: Arc::new(SpawnedJobRunner),
            device_lookup: Arc::new(SysfsDeviceLookup::new()),
            mount_monitor: Arc::new(ProcMountMonitor::new()),
            loop_inspector: Arc::new(LinuxLoopInspector),
            configuration: Arc::new(NullConfiguration),
            teardown: Arc::new(LinuxBlockTeardown),
        })
    }
}

/// The daemon.
pub struct Daemon {
    config: Config,
    cleanup: Arc<CleanupEngine>,
    collaborators: Collaborators,
    weak_self: Weak<Daemon>,
    objects: Mutex<ObjectRegistry>,
    objects_changed: Condvar,
    mdraids: Mutex<BTreeMap<ObjectId, Arc<Mutex<MdRaidObject>>>>,
    polling: Mutex<BTreeSet<ObjectId>>,
    poller: Mutex<Option<SyncPoller>>,
}

impl Daemon {
    pub fn new(
        config: Config,
        store: Arc<PersistentStore>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let cleanup = Arc::new(CleanupEngine::new(
            store,
            config.media_root.clone(),
            Arc::clone(&collaborators.runner),
            Arc::clone(&collaborators.device_lookup),
            Arc::clone(&collaborators.mount_monitor),
            Arc::clone(&collaborators.loop_inspector),
        ));
        Arc::new_cyclic(|weak_self| Self {
            config,
            cleanup,
            collaborators,
            weak_self: weak_self.clone(),
            objects: Mutex::new(ObjectRegistry::default()),
            objects_changed: Condvar::new(),
            mdraids: Mutex::new(BTreeMap::new()),
            polling: Mutex::new(BTreeSet::new()),
            poller: Mutex::new(None),
        })
    }

    /// Starts the background machinery: the cleanup worker and the sync
    /// poller. A first cleanup pass is kicked immediately to unwind
    /// anything that went stale while the daemon was down.
    pub fn start(&self) {
        Arc::clone(&self.cleanup).start();
        *self.poller.lock() = Some(SyncPoller::spawn(self.weak_self.clone()));
        self.cleanup.kick();
    }

    /// Stops the background machinery, joining both threads.
    pub fn stop(&self) {
        if let Some(mut poller) = self.poller.lock().take() {
            poller.shutdown();
        }
        self.cleanup.stop();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn media_root(&self) -> &Path {
        &self.config.media_root
    }

    pub fn cleanup(&self) -> &Arc<CleanupEngine> {
        &self.cleanup
    }

    pub fn authority(&self) -> &dyn Authority {
        &*self.collaborators.authority
    }

    pub fn runner(&self) -> &dyn JobRunner {
        &*self.collaborators.runner
    }

    pub fn device_lookup(&self) -> &dyn DeviceLookup {
        &*self.collaborators.device_lookup
    }

    pub fn mount_monitor(&self) -> &dyn MountMonitor {
        &*self.collaborators.mount_monitor
    }

    pub fn configuration(&self) -> &dyn Configuration {
        &*self.collaborators.configuration
    }

    pub fn teardown(&self) -> Arc<dyn BlockTeardown> {
        Arc::clone(&self.collaborators.teardown)
    }

    /* ---------------------------------------------------------------- */
    /* block object registry                                            */

    pub fn add_block(&self, block: Block) {
        self.objects.lock().insert_block(block);
        self.objects_changed.notify_all();
    }

    pub fn remove_block(&self, object_path: &str) -> Option<Block> {
        let removed = self.objects.lock().remove_block(object_path);
        self.objects_changed.notify_all();
        removed
    }

    pub fn find_object_block(&self, object_path: &str) -> Option<Block> {
        self.objects.lock().block(object_path).cloned()
    }

    pub fn find_block_by_sysfs_path(&self, sysfs_path: &Path) -> Option<Block> {
        self.objects
            .lock()
            .find_block_by_sysfs_path(sysfs_path)
            .cloned()
    }

    pub fn find_block_by_device_file(&self, device_file: &Path) -> Option<Block> {
        self.objects
            .lock()
            .find_block_by_device_file(device_file)
            .cloned()
    }

    /// The block object that is the array device of `mdraid`, if one exists.
    pub fn find_block_for_mdraid(&self, mdraid: &str) -> Option<Block> {
        self.objects
            .lock()
            .blocks()
            .find(|block| block.mdraid().map(String::as_str) == Some(mdraid))
            .cloned()
    }

    /// Waits up to `timeout` for a block object matching `predicate` to
    /// appear in the registry.
    pub fn wait_for_block<F>(&self, timeout: Duration, predicate: F) -> Option<Block>
    where
        F: Fn(&Block) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut objects = self.objects.lock();
        loop {
            if let Some(block) = objects.blocks().find(|block| predicate(block)) {
                return Some(block.clone());
            }
            if Instant::now() >= deadline {
                return None;
            }
            let _ = self.objects_changed.wait_until(&mut objects, deadline);
        }
    }

    /* ---------------------------------------------------------------- */
    /* RAID array objects                                               */

    /// Resolves a RAID array object, failing `NotFound` if it is gone.
    pub fn mdraid(&self, object_path: &str) -> Result<Arc<Mutex<MdRaidObject>>> {
        self.mdraids
            .lock()
            .get(object_path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("No RAID array object at {}", object_path)))
    }

    pub fn mdraid_object_paths(&self) -> Vec<ObjectId> {
        self.mdraids.lock().keys().cloned().collect()
    }

    /// Routes a device event to the owning array object, creating it on the
    /// first event for its UUID and destroying it when both the array
    /// device and all members are gone.
    pub fn uevent(&self, action: &str, device: LinuxDevice) {
        self.update_block_for(&device, action);

        let uuid = device
            .property(mdraid::PROP_MEMBER_UUID)
            .or_else(|| device.property(mdraid::PROP_UUID))
            .map(str::to_string);
        let Some(uuid) = uuid else {
            return;
        };

        let object_path = mdraid::object_path_for_uuid(&uuid);
        let object = {
            let mut mdraids = self.mdraids.lock();
            Arc::clone(mdraids.entry(object_path.clone()).or_insert_with(|| {
                Arc::new(Mutex::new(MdRaidObject::new(object_path.clone(), uuid)))
            }))
        };

        let empty = {
            let mut object = object.lock();
            object.uevent(action, device);
            let empty = object.is_empty();
            if !empty {
                object.update(self);
            }
            empty
        };
        if empty {
            self.mdraids.lock().remove(&object_path);
            self.ensure_polling(&object_path, false);
        }
    }

    fn update_block_for(&self, device: &LinuxDevice, action: &str) {
        let object_path = crate::block::object_path_for_device(device);
        if action == "remove" {
            self.remove_block(&object_path);
            return;
        }
        let mut block = Block::new(object_path, device.clone());
        if let Some(uuid) = device.property(mdraid::PROP_UUID) {
            block = block.with_mdraid(mdraid::object_path_for_uuid(uuid));
        }
        if let Some(uuid) = device.property(mdraid::PROP_MEMBER_UUID) {
            block = block.with_mdraid_member(mdraid::object_path_for_uuid(uuid));
        }
        self.add_block(block);
    }

    /* ---------------------------------------------------------------- */
    /* polling                                                          */

    /// Registers or deregisters an array for 1 Hz sync polling.
    /// Idempotent in both directions.
    pub fn ensure_polling(&self, object_path: &str, polling_on: bool) {
        let mut polling = self.polling.lock();
        if polling_on {
            polling.insert(object_path.to_string());
        } else {
            polling.remove(object_path);
        }
    }

    pub fn is_polling(&self, object_path: &str) -> bool {
        self.polling.lock().contains(object_path)
    }

    pub(crate) fn polled_arrays(&self) -> Vec<ObjectId> {
        self.polling.lock().iter().cloned().collect()
    }

    /// Synthesized or real change notification for an array: re-reconcile.
    pub fn array_changed(&self, object_path: &str) {
        let object = {
            let mdraids = self.mdraids.lock();
            mdraids.get(object_path).cloned()
        };
        if let Some(object) = object {
            object.lock().update(self);
        }
    }

    /* ---------------------------------------------------------------- */
    /* jobs and authorization                                           */

    /// Runs an external command synchronously through the job runner.
    ///
    /// Returns the failure message (captured stderr, or the exit
    /// description) on error, matching what callers embed in their own
    /// error messages.
    pub fn launch_spawned_job(
        &self,
        operation: &str,
        caller_uid: u32,
        argv: Vec<String>,
    ) -> std::result::Result<(), String> {
        match self
            .collaborators
            .runner
            .spawn_job(operation, caller_uid, &argv)
        {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(output.error_message()),
            Err(err) => Err(err.to_string()),
        }
    }

    /// Checks authorization for `action_id`, honoring the
    /// `auth.no_user_interaction` standard option.
    pub fn check_authorization(
        &self,
        invocation: &Invocation,
        action_id: &str,
        options: &Options,
        message: &str,
    ) -> Result<()> {
        let interactive = !option_bool(options, "auth.no_user_interaction");
        self.collaborators
            .authority
            .check_authorization(invocation, action_id, message, interactive)
    }

    /// The caller's real UID, failing if the invocation context has none.
    pub fn caller_uid(&self, invocation: &Invocation) -> Result<u32> {
        invocation.caller_uid().ok_or_else(|| {
            Error::Failed("Unable to determine the UID of the caller".to_string())
        })
    }
}
