//! Authorization.
//!
//! Operations consult an [`Authority`] before touching the system. The
//! production implementation asks polkit
//! (`org.freedesktop.PolicyKit1.Authority`) over its own blocking system-bus
//! connection, identifying the caller by bus name.

use std::collections::HashMap;

use zbus::proxy;
use zbus::zvariant::{OwnedValue, Type, Value};

use crate::daemon::Invocation;
use crate::error::{Error, Result};
use crate::gettext::{gettext, GETTEXT_PACKAGE};

/// Action id guarding RAID management operations.
pub const ACTION_MANAGE_MD_RAID: &str = "org.storaged.Storaged.manage-md-raid";

/// Action id guarding changes to the system configuration (tear-down).
pub const ACTION_MODIFY_SYSTEM_CONFIGURATION: &str =
    "org.storaged.Storaged.modify-system-configuration";

/// Policy decision contract.
pub trait Authority: Send + Sync {
    /// Checks whether the caller behind `invocation` may perform `action_id`.
    ///
    /// `message` is shown in the authentication dialog when `interactive`
    /// allows one. Returns [`Error::NotAuthorized`] on denial.
    fn check_authorization(
        &self,
        invocation: &Invocation,
        action_id: &str,
        message: &str,
        interactive: bool,
    ) -> Result<()>;
}

/// A polkit subject, `(sa{sv})` on the wire.
#[derive(Debug, serde::Serialize, Type)]
pub struct Subject {
    pub subject_kind: String,
    pub subject_details: HashMap<String, OwnedValue>,
}

/// A polkit authorization result, `(bba{ss})` on the wire.
#[derive(Debug, serde::Deserialize, Type)]
pub struct AuthorizationResult {
    pub is_authorized: bool,
    pub is_challenge: bool,
    pub details: HashMap<String, String>,
}

const CHECK_AUTHORIZATION_FLAGS_NONE: u32 = 0;
const CHECK_AUTHORIZATION_FLAGS_ALLOW_USER_INTERACTION: u32 = 1;

#[proxy(
    interface = "org.freedesktop.PolicyKit1.Authority",
    default_service = "org.freedesktop.PolicyKit1",
    default_path = "/org/freedesktop/PolicyKit1/Authority"
)]
trait PolicyKitAuthority {
    /// CheckAuthorization method
    fn check_authorization(
        &self,
        subject: &Subject,
        action_id: &str,
        details: HashMap<&str, &str>,
        flags: u32,
        cancellation_id: &str,
    ) -> zbus::Result<AuthorizationResult>;
}

/// [`Authority`] backed by the system polkit daemon.
pub struct PolkitAuthority {
    proxy: PolicyKitAuthorityProxyBlocking<'static>,
}

impl PolkitAuthority {
    /// Connects to polkit on the system bus.
    pub fn system() -> Result<Self> {
        let connection = zbus::blocking::Connection::system()?;
        let proxy = PolicyKitAuthorityProxyBlocking::new(&connection)?;
        Ok(Self { proxy })
    }
}

impl Authority for PolkitAuthority {
    fn check_authorization(
        &self,
        invocation: &Invocation,
        action_id: &str,
        message: &str,
        interactive: bool,
    ) -> Result<()> {
        let Some(sender) = invocation.sender() else {
            return Err(Error::Failed(
                "Cannot check authorization for a caller without a bus name".to_string(),
            ));
        };

        let mut subject_details = HashMap::new();
        subject_details.insert("name".to_string(), Value::from(sender).try_into()?);
        let subject = Subject {
            subject_kind: "system-bus-name".to_string(),
            subject_details,
        };

        let details = HashMap::from([
            ("polkit.message", message),
            ("polkit.gettext_domain", GETTEXT_PACKAGE),
        ]);
        let flags = if interactive {
            CHECK_AUTHORIZATION_FLAGS_ALLOW_USER_INTERACTION
        } else {
            CHECK_AUTHORIZATION_FLAGS_NONE
        };

        let result = self
            .proxy
            .check_authorization(&subject, action_id, details, flags, "")?;
        if result.is_authorized {
            Ok(())
        } else {
            Err(Error::NotAuthorized(gettext(
                "Not authorized to perform operation",
            )))
        }
    }
}
