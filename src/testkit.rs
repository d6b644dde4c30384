//! Shared test doubles and a daemon harness wired to them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::daemon::{Collaborators, Configuration, ConfigurationItem, Daemon, Invocation, Options};
use crate::device::{DeviceLookup, LinuxDevice};
use crate::error::{Error, Result};
use crate::job::{JobOutput, JobRunner};
use crate::mounts::{Mount, MountMonitor};
use crate::polkit::Authority;
use crate::r#loop::{LoopInspector, LoopStatus};
use crate::store::PersistentStore;
use crate::{block, Config};

#[derive(Default)]
pub struct FakeDeviceLookup {
    pub devices: Mutex<HashMap<u64, LinuxDevice>>,
}

impl FakeDeviceLookup {
    pub fn insert(&self, device: LinuxDevice) {
        self.devices.lock().insert(device.device_number(), device);
    }
}

impl DeviceLookup for FakeDeviceLookup {
    fn query_by_device_number(&self, device_number: u64) -> Option<LinuxDevice> {
        self.devices.lock().get(&device_number).cloned()
    }
}

#[derive(Default)]
pub struct FakeMountMonitor {
    pub mounts: Mutex<Vec<Mount>>,
}

impl FakeMountMonitor {
    pub fn set_mounts(&self, mounts: Vec<Mount>) {
        *self.mounts.lock() = mounts;
    }
}

impl MountMonitor for FakeMountMonitor {
    fn mounts_for_dev(&self, device_number: u64) -> Vec<Mount> {
        self.mounts
            .lock()
            .iter()
            .filter(|mount| mount.device_number() == device_number)
            .cloned()
            .collect()
    }
}

/// Records every spawned command line; commands fail when a configured
/// prefix matches.
#[derive(Default)]
pub struct RecordingJobRunner {
    pub commands: Mutex<Vec<String>>,
    pub failures: Mutex<HashMap<String, String>>,
}

impl RecordingJobRunner {
    pub fn recorded(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn clear(&self) {
        self.commands.lock().clear();
    }

    pub fn fail_matching(&self, prefix: &str, stderr: &str) {
        self.failures
            .lock()
            .insert(prefix.to_string(), stderr.to_string());
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }
}

impl JobRunner for RecordingJobRunner {
    fn spawn_job(&self, _operation: &str, _caller_uid: u32, argv: &[String]) -> Result<JobOutput> {
        let line = argv.join(" ");
        self.commands.lock().push(line.clone());
        let failure = self
            .failures
            .lock()
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, stderr)| stderr.clone());
        match failure {
            Some(stderr) => Ok(JobOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr,
            }),
            None => Ok(JobOutput {
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            }),
        }
    }
}

/// Allows or denies everything, recording the checked action ids.
pub struct StaticAuthority {
    pub allow: Mutex<bool>,
    pub checks: Mutex<Vec<String>>,
}

impl StaticAuthority {
    pub fn new(allow: bool) -> Self {
        Self {
            allow: Mutex::new(allow),
            checks: Mutex::new(Vec::new()),
        }
    }

    pub fn set_allow(&self, allow: bool) {
        *self.allow.lock() = allow;
    }

    pub fn checked_actions(&self) -> Vec<String> {
        self.checks.lock().clone()
    }
}

impl Authority for StaticAuthority {
    fn check_authorization(
        &self,
        _invocation: &Invocation,
        action_id: &str,
        _message: &str,
        _interactive: bool,
    ) -> Result<()> {
        self.checks.lock().push(action_id.to_string());
        if *self.allow.lock() {
            Ok(())
        } else {
            Err(Error::NotAuthorized(
                "Not authorized to perform operation".to_string(),
            ))
        }
    }
}

#[derive(Default)]
pub struct FakeLoopInspector {
    pub statuses: Mutex<HashMap<PathBuf, Result<LoopStatus>>>,
}

impl FakeLoopInspector {
    pub fn set_status(&self, device_file: &str, status: Result<LoopStatus>) {
        self.statuses
            .lock()
            .insert(PathBuf::from(device_file), status);
    }
}

impl LoopInspector for FakeLoopInspector {
    fn status(&self, device_file: &Path) -> Result<LoopStatus> {
        match self.statuses.lock().get(device_file) {
            Some(status) => status.clone(),
            None => Err(Error::NotFound(format!(
                "No such device {}",
                device_file.display()
            ))),
        }
    }
}

/// Serves a fixed child configuration and records removals.
#[derive(Default)]
pub struct RecordingConfiguration {
    pub items: Mutex<Vec<ConfigurationItem>>,
    pub removed: Mutex<Vec<Vec<ConfigurationItem>>>,
}

impl Configuration for RecordingConfiguration {
    fn find_child_configuration(&self, _uuid: &str) -> Vec<ConfigurationItem> {
        self.items.lock().clone()
    }

    fn remove_configuration(&self, items: &[ConfigurationItem]) -> Result<()> {
        self.removed.lock().push(items.to_vec());
        Ok(())
    }
}

/// Records teardown requests by block object path.
#[derive(Default)]
pub struct RecordingTeardown {
    pub torn_down: Mutex<Vec<String>>,
}

impl block::BlockTeardown for RecordingTeardown {
    fn teardown(
        &self,
        _daemon: &Daemon,
        block: &block::Block,
        _invocation: &Invocation,
        _options: &Options,
    ) -> Result<()> {
        self.torn_down.lock().push(block.object_path().clone());
        Ok(())
    }
}

/// A daemon wired to fakes, plus handles onto each of them.
pub struct TestDaemon {
    pub daemon: Arc<Daemon>,
    pub runner: Arc<RecordingJobRunner>,
    pub authority: Arc<StaticAuthority>,
    pub devices: Arc<FakeDeviceLookup>,
    pub mounts: Arc<FakeMountMonitor>,
    pub loops: Arc<FakeLoopInspector>,
    pub configuration: Arc<RecordingConfiguration>,
    pub teardown: Arc<RecordingTeardown>,
    pub state_dir: tempfile::TempDir,
}

impl TestDaemon {
    pub fn media_root(&self) -> PathBuf {
        self.daemon.media_root().to_path_buf()
    }
}

pub fn test_daemon() -> TestDaemon {
    let state_dir = tempfile::tempdir().unwrap();
    let media_root = state_dir.path().join("media");
    std::fs::create_dir_all(&media_root).unwrap();

    let store = Arc::new(
        PersistentStore::new(&state_dir.path().join("lib"), &state_dir.path().join("run"))
            .unwrap(),
    );

    let runner = Arc::new(RecordingJobRunner::default());
    let authority = Arc::new(StaticAuthority::new(true));
    let devices = Arc::new(FakeDeviceLookup::default());
    let mounts = Arc::new(FakeMountMonitor::default());
    let loops = Arc::new(FakeLoopInspector::default());
    let configuration = Arc::new(RecordingConfiguration::default());
    let teardown = Arc::new(RecordingTeardown::default());

    let config = Config {
        durable_state_dir: state_dir.path().join("lib"),
        runtime_state_dir: state_dir.path().join("run"),
        media_root,
        ..Config::default()
    };

    let collaborators = Collaborators {
        authority: authority.clone(),
        runner: runner.clone(),
        device_lookup: devices.clone(),
        mount_monitor: mounts.clone(),
        loop_inspector: loops.clone(),
        configuration: configuration.clone(),
        teardown: teardown.clone(),
    };
    let daemon = Daemon::new(config, store, collaborators);

    TestDaemon {
        daemon,
        runner,
        authority,
        devices,
        mounts,
        loops,
        configuration,
        teardown,
        state_dir,
    }
}

/// Builds an `Options` map of boolean flags.
pub fn bool_options(entries: &[(&str, bool)]) -> Options {
    entries
        .iter()
        .map(|(key, value)| {
            (
                key.to_string(),
                zbus::zvariant::Value::from(*value).try_into().unwrap(),
            )
        })
        .collect()
}
