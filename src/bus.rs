//! D-Bus surface for RAID array objects.
//!
//! A thin adapter: each method resolves the caller's credentials from the
//! bus, builds an [`Invocation`] and hands off to the core operation. Core
//! errors map to `org.storaged.Storaged.Error.*` names.

use std::collections::HashMap;
use std::sync::Arc;

use zbus::message::Header;
use zbus::names::BusName;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};

use crate::daemon::{Daemon, Invocation};
use crate::error::Error;
use crate::mdraid::{ActiveDevice, MdRaid};

/// [`Error`] rendered as a D-Bus error.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.storaged.Storaged.Error")]
pub enum BusError {
    #[zbus(error)]
    ZBus(zbus::Error),
    Failed(String),
    Cancelled(String),
    NotAuthorized(String),
    NotFound(String),
    Busy(String),
    InvalidArgument(String),
    Timedout(String),
}

impl From<Error> for BusError {
    fn from(value: Error) -> Self {
        let message = value.to_string();
        match value {
            Error::Failed(_) => BusError::Failed(message),
            Error::Cancelled => BusError::Cancelled(message),
            Error::NotAuthorized(_) => BusError::NotAuthorized(message),
            Error::NotFound(_) => BusError::NotFound(message),
            Error::Busy(_) => BusError::Busy(message),
            Error::InvalidArgument(_) => BusError::InvalidArgument(message),
            Error::TimedOut(_) => BusError::Timedout(message),
        }
    }
}

/// The `org.storaged.Storaged.MDRaid` interface of one array object.
pub struct MdRaidInterface {
    daemon: Arc<Daemon>,
    object_path: String,
}

impl MdRaidInterface {
    pub fn new(daemon: Arc<Daemon>, object_path: String) -> Self {
        Self {
            daemon,
            object_path,
        }
    }

    async fn invocation(
        &self,
        connection: &zbus::Connection,
        header: &Header<'_>,
    ) -> Result<Invocation, BusError> {
        let Some(sender) = header.sender() else {
            return Ok(Invocation::anonymous());
        };
        let dbus = zbus::fdo::DBusProxy::new(connection)
            .await
            .map_err(zbus::Error::from)?;
        let credentials = dbus
            .get_connection_credentials(BusName::from(sender.clone()))
            .await
            .map_err(zbus::Error::from)?;
        let invocation = match credentials.unix_user_id() {
            Some(uid) => Invocation::new(uid),
            None => Invocation::anonymous(),
        };
        Ok(invocation.with_sender(sender.as_str()))
    }

    fn raid_snapshot(&self) -> MdRaid {
        self.daemon
            .mdraid(&self.object_path)
            .map(|object| object.lock().raid().clone())
            .unwrap_or_default()
    }
}

#[zbus::interface(name = "org.storaged.Storaged.MDRaid")]
impl MdRaidInterface {
    async fn start(
        &self,
        options: HashMap<String, OwnedValue>,
        #[zbus(connection)] connection: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), BusError> {
        let invocation = self.invocation(connection, &header).await?;
        let object = self.daemon.mdraid(&self.object_path)?;
        let result = object.lock().start(&self.daemon, &invocation, &options);
        Ok(result?)
    }

    async fn stop(
        &self,
        options: HashMap<String, OwnedValue>,
        #[zbus(connection)] connection: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), BusError> {
        let invocation = self.invocation(connection, &header).await?;
        let object = self.daemon.mdraid(&self.object_path)?;
        let result = object.lock().stop(&self.daemon, &invocation, &options);
        Ok(result?)
    }

    async fn add_device(
        &self,
        device: OwnedObjectPath,
        options: HashMap<String, OwnedValue>,
        #[zbus(connection)] connection: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), BusError> {
        let invocation = self.invocation(connection, &header).await?;
        let object = self.daemon.mdraid(&self.object_path)?;
        let result = object
            .lock()
            .add_device(&self.daemon, &invocation, device.as_str(), &options);
        Ok(result?)
    }

    async fn remove_device(
        &self,
        device: OwnedObjectPath,
        options: HashMap<String, OwnedValue>,
        #[zbus(connection)] connection: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), BusError> {
        let invocation = self.invocation(connection, &header).await?;
        let object = self.daemon.mdraid(&self.object_path)?;
        let result =
            object
                .lock()
                .remove_device(&self.daemon, &invocation, device.as_str(), &options);
        Ok(result?)
    }

    async fn set_bitmap_location(
        &self,
        value: String,
        options: HashMap<String, OwnedValue>,
        #[zbus(connection)] connection: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), BusError> {
        let invocation = self.invocation(connection, &header).await?;
        let object = self.daemon.mdraid(&self.object_path)?;
        let result = object
            .lock()
            .set_bitmap_location(&self.daemon, &invocation, &value, &options);
        Ok(result?)
    }

    async fn request_sync_action(
        &self,
        value: String,
        options: HashMap<String, OwnedValue>,
        #[zbus(connection)] connection: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), BusError> {
        let invocation = self.invocation(connection, &header).await?;
        let object = self.daemon.mdraid(&self.object_path)?;
        let result = object
            .lock()
            .request_sync_action(&self.daemon, &invocation, &value, &options);
        Ok(result?)
    }

    async fn delete(
        &self,
        options: HashMap<String, OwnedValue>,
        #[zbus(connection)] connection: &zbus::Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), BusError> {
        let invocation = self.invocation(connection, &header).await?;
        let object = self.daemon.mdraid(&self.object_path)?;
        let result = object.lock().delete(&self.daemon, &invocation, &options);
        Ok(result?)
    }

    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.raid_snapshot().uuid
    }

    #[zbus(property)]
    fn name(&self) -> String {
        self.raid_snapshot().name
    }

    #[zbus(property)]
    fn level(&self) -> String {
        self.raid_snapshot().level
    }

    #[zbus(property)]
    fn num_devices(&self) -> u32 {
        self.raid_snapshot().num_devices
    }

    #[zbus(property)]
    fn size(&self) -> u64 {
        self.raid_snapshot().size
    }

    #[zbus(property)]
    fn degraded(&self) -> u32 {
        self.raid_snapshot().degraded
    }

    #[zbus(property)]
    fn sync_action(&self) -> String {
        self.raid_snapshot().sync_action
    }

    #[zbus(property)]
    fn sync_completed(&self) -> f64 {
        self.raid_snapshot().sync_completed
    }

    #[zbus(property)]
    fn sync_rate(&self) -> u64 {
        self.raid_snapshot().sync_rate
    }

    #[zbus(property)]
    fn sync_remaining_time(&self) -> u64 {
        self.raid_snapshot().sync_remaining_time
    }

    #[zbus(property)]
    fn bitmap_location(&self) -> String {
        self.raid_snapshot().bitmap_location
    }

    #[zbus(property)]
    fn chunk_size(&self) -> u64 {
        self.raid_snapshot().chunk_size
    }

    #[zbus(property)]
    fn active_devices(&self) -> Vec<ActiveDevice> {
        self.raid_snapshot().active_devices
    }
}

/// Exports the array object at its object path.
pub async fn export_mdraid(
    connection: &zbus::Connection,
    daemon: Arc<Daemon>,
    object_path: &str,
) -> zbus::Result<()> {
    connection
        .object_server()
        .at(object_path, MdRaidInterface::new(daemon, object_path.to_string()))
        .await?;
    Ok(())
}
