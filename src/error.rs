use std::fmt;

/// A result type hardwired to use [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type used throughout this library.
///
/// Use [`Error::kind`] to find out which part of the stack failed.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: Inner,
}

/// Classifies an [`Error`] by the component that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The object bus is unreachable, an object path is already taken, or the targeted object does
    /// not exist (anymore).
    Transport,
    /// The Bluetooth manager rejected one of our requests.
    ManagerRpc,
    /// A call into the Bluetooth manager did not complete in time.
    Timeout,
    /// An application-supplied read or write handler failed.
    Handler,
    /// The operation is not valid in the current lifecycle state.
    InvalidState,
    /// Anything else (parse errors, missing adapter, ...).
    Other,
}

impl Error {
    pub(crate) fn from(e: impl Into<Inner>) -> Self {
        let inner = e.into();
        let kind = match &inner {
            Inner::Zbus(_) | Inner::Fdo(_) => ErrorKind::Transport,
            Inner::Request(_) => ErrorKind::Handler,
            Inner::Other(_) => ErrorKind::Other,
        };
        Self { kind, inner }
    }

    pub(crate) fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            inner: Inner::Other(msg.into()),
        }
    }

    /// Classifies an error returned by a call into the Bluetooth manager.
    ///
    /// Error replies sent by the manager are [`ErrorKind::ManagerRpc`], everything else is a
    /// transport problem.
    pub(crate) fn manager(e: zbus::Error) -> Self {
        let kind = match &e {
            zbus::Error::MethodError(..) | zbus::Error::FDO(_) => ErrorKind::ManagerRpc,
            _ => ErrorKind::Transport,
        };
        Self {
            kind,
            inner: Inner::Zbus(e),
        }
    }

    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the [`ReqError`] reported by a handler, if this error came from one.
    pub fn request_error(&self) -> Option<ReqError> {
        match &self.inner {
            Inner::Request(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Zbus(e) => e.fmt(f),
            Inner::Fdo(e) => e.fmt(f),
            Inner::Request(e) => write!(f, "request failed: {}", e),
            Inner::Other(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Debug)]
pub(crate) enum Inner {
    Zbus(zbus::Error),
    Fdo(zbus::fdo::Error),
    Request(ReqError),
    Other(String),
}

impl From<zbus::Error> for Inner {
    fn from(value: zbus::Error) -> Self {
        Self::Zbus(value)
    }
}

impl From<zbus::fdo::Error> for Inner {
    fn from(value: zbus::fdo::Error) -> Self {
        Self::Fdo(value)
    }
}

impl From<ReqError> for Inner {
    fn from(value: ReqError) -> Self {
        Self::Request(value)
    }
}

impl From<String> for Inner {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}

impl From<&str> for Inner {
    fn from(value: &str) -> Self {
        Self::Other(value.to_string())
    }
}

/// The error a GATT handler reports back to the remote device.
///
/// These map onto the `org.bluez.Error.*` replies BlueZ translates into ATT error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum ReqError {
    /// Generic failure.
    #[default]
    Failed,
    /// A request of this kind is already being processed.
    InProgress,
    /// The requested offset is beyond the value.
    InvalidOffset,
    /// The written value has the wrong length.
    InvalidValueLength,
    /// The operation is not permitted on this attribute.
    NotPermitted,
    /// The remote device is not authorized.
    NotAuthorized,
    /// The operation is not supported.
    NotSupported,
}

impl ReqError {
    /// Returns the name of the error, as used in the `org.bluez.Error.` namespace.
    pub fn name(self) -> &'static str {
        match self {
            Self::Failed => "Failed",
            Self::InProgress => "InProgress",
            Self::InvalidOffset => "InvalidOffset",
            Self::InvalidValueLength => "InvalidValueLength",
            Self::NotPermitted => "NotPermitted",
            Self::NotAuthorized => "NotAuthorized",
            Self::NotSupported => "NotSupported",
        }
    }
}

impl fmt::Display for ReqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "org.bluez.Error.{}", self.name())
    }
}

impl std::error::Error for ReqError {}
