use std::{convert::Infallible, fmt::Display};

/// Alias for a `Result` with the error type [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The error type surfaced at the storaged control surface.
///
/// Every variant carries the message reported to the caller and maps to a
/// stable D-Bus error name, see [`Error::name`].
#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    /// The operation failed.
    Failed(String),
    /// The operation was cancelled by the caller.
    Cancelled,
    /// Not authorized to perform the requested operation.
    NotAuthorized(String),
    /// The referenced object or device is gone.
    NotFound(String),
    /// Another operation on the same resource is in flight, or the resource
    /// itself reported being busy.
    Busy(String),
    /// An argument was outside the recognized set of values.
    InvalidArgument(String),
    /// The operation timed out.
    TimedOut(String),
}

impl Error {
    /// The D-Bus error name for this error.
    pub fn name(&self) -> &'static str {
        match self {
            Error::Failed(_) => "org.storaged.Storaged.Error.Failed",
            Error::Cancelled => "org.storaged.Storaged.Error.Cancelled",
            Error::NotAuthorized(_) => "org.storaged.Storaged.Error.NotAuthorized",
            Error::NotFound(_) => "org.storaged.Storaged.Error.NotFound",
            Error::Busy(_) => "org.storaged.Storaged.Error.Busy",
            Error::InvalidArgument(_) => "org.storaged.Storaged.Error.InvalidArgument",
            Error::TimedOut(_) => "org.storaged.Storaged.Error.Timedout",
        }
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Failed(msg) => write!(f, "{}", msg),
            Error::Cancelled => write!(f, "The operation was cancelled."),
            Error::NotAuthorized(msg) => write!(f, "{}", msg),
            Error::NotFound(msg) => write!(f, "{}", msg),
            Error::Busy(msg) => write!(f, "{}", msg),
            Error::InvalidArgument(msg) => write!(f, "{}", msg),
            Error::TimedOut(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Failed(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Failed(value.to_string())
    }
}

impl From<zbus::Error> for Error {
    fn from(value: zbus::Error) -> Self {
        let zbus::Error::MethodError(ref name, ref msg, ref _info) = value else {
            return Error::Failed(value.to_string());
        };

        let msg = msg.clone().unwrap_or_default();
        match name.as_str() {
            "org.storaged.Storaged.Error.Failed" => Error::Failed(msg),
            "org.storaged.Storaged.Error.Cancelled" => Error::Cancelled,
            "org.storaged.Storaged.Error.NotAuthorized" => Error::NotAuthorized(msg),
            "org.storaged.Storaged.Error.NotFound" => Error::NotFound(msg),
            "org.storaged.Storaged.Error.Busy" => Error::Busy(msg),
            "org.storaged.Storaged.Error.InvalidArgument" => Error::InvalidArgument(msg),
            "org.storaged.Storaged.Error.Timedout" => Error::TimedOut(msg),
            _ => Error::Failed(value.to_string()),
        }
    }
}

impl From<zbus::fdo::Error> for Error {
    fn from(value: zbus::fdo::Error) -> Self {
        Error::Failed(value.to_string())
    }
}

impl From<zbus::zvariant::Error> for Error {
    fn from(value: zbus::zvariant::Error) -> Self {
        Error::Failed(value.to_string())
    }
}

impl From<Infallible> for Error {
    fn from(i: Infallible) -> Self {
        match i {}
    }
}
