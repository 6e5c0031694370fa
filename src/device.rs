//! Remote devices connecting to the peripheral.

use core::fmt;
use std::sync::Arc;

use zbus::{
    fdo::{InterfacesAdded, PropertiesChanged},
    zvariant::{ObjectPath, Value},
    MatchRule, Message, MessageType,
};

use crate::{address::Address, Error, Result};

pub(crate) const DEVICE_INTERFACE: &str = "org.bluez.Device1";

/// A remote device (central) connected to or disconnected from the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// The BlueZ object path of the remote device.
    pub path: String,
    /// The device's address, decoded from [`ConnectionEvent::path`].
    pub address: Option<Address>,
    /// Whether the device is now connected.
    pub connected: bool,
}

impl ConnectionEvent {
    pub fn new(path: impl Into<String>, connected: bool) -> Self {
        let path = path.into();
        Self {
            address: Address::from_device_path(&path),
            path,
            connected,
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.connected {
            "connected"
        } else {
            "disconnected"
        };
        match &self.address {
            Some(addr) => write!(f, "{} {}", addr, state),
            None => write!(f, "{} {}", self.path, state),
        }
    }
}

/// Builds the match rule selecting `Connected` changes of devices below `adapter_path`.
pub(crate) fn connection_rule(adapter_path: &str) -> Result<MatchRule<'static>> {
    let adapter_path = ObjectPath::try_from(adapter_path)
        .map_err(|e| Error::from(format!("invalid adapter path {}: {}", adapter_path, e)))?
        .into_owned();
    Ok(MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender("org.bluez")
        .map_err(Error::from)?
        .interface("org.freedesktop.DBus.Properties")
        .map_err(Error::from)?
        .member("PropertiesChanged")
        .map_err(Error::from)?
        .path_namespace(adapter_path)
        .map_err(Error::from)?
        .build())
}

/// Builds the match rule selecting devices appearing on the bus.
///
/// A central that connects before BlueZ knew about it shows up as an `InterfacesAdded` signal with
/// `Connected` already set, and never sends a `PropertiesChanged` for it.
pub(crate) fn interfaces_added_rule() -> Result<MatchRule<'static>> {
    Ok(MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender("org.bluez")
        .map_err(Error::from)?
        .interface("org.freedesktop.DBus.ObjectManager")
        .map_err(Error::from)?
        .member("InterfacesAdded")
        .map_err(Error::from)?
        .build())
}

/// Turns a signal matched by [`connection_rule`] or [`interfaces_added_rule`] into a
/// [`ConnectionEvent`] for a device below `adapter_path`.
pub(crate) fn connection_event(
    message: zbus::Result<Arc<Message>>,
    adapter_path: &str,
) -> Option<ConnectionEvent> {
    let message = match message {
        Ok(message) => message,
        Err(e) => {
            log::warn!("error on connection event stream: {}", e);
            return None;
        }
    };

    let member = message.member()?.to_string();
    match member.as_str() {
        "PropertiesChanged" => properties_changed(message),
        "InterfacesAdded" => interfaces_added(message, adapter_path),
        _ => None,
    }
}

fn interfaces_added(message: Arc<Message>, adapter_path: &str) -> Option<ConnectionEvent> {
    let added = InterfacesAdded::from_message(message)?;
    let args = added.args().ok()?;
    let (_, props) = args
        .interfaces_and_properties
        .iter()
        .find(|(name, _)| name.to_string() == DEVICE_INTERFACE)?;

    added_device(
        adapter_path,
        args.object_path.as_str(),
        props.get("Connected"),
    )
}

/// Returns the event for a device object appearing at `path`, if it belongs to the adapter and is
/// already connected.
///
/// Devices that merely got discovered are not reported.
fn added_device(
    adapter_path: &str,
    path: &str,
    connected: Option<&Value<'_>>,
) -> Option<ConnectionEvent> {
    if !is_below(adapter_path, path) {
        return None;
    }
    match connected {
        Some(Value::Bool(true)) => Some(ConnectionEvent::new(path, true)),
        _ => None,
    }
}

fn is_below(parent: &str, path: &str) -> bool {
    path.strip_prefix(parent)
        .map_or(false, |rest| rest.starts_with('/'))
}

fn properties_changed(message: Arc<Message>) -> Option<ConnectionEvent> {
    let path = message.path()?.to_string();
    let changed = PropertiesChanged::from_message(message)?;
    let args = changed.args().ok()?;

    if args.interface_name.as_str() != DEVICE_INTERFACE {
        return None;
    }

    log::trace!("{}: changed {:?}", path, args.changed_properties.keys());

    match args.changed_properties.get("Connected") {
        Some(Value::Bool(connected)) => Some(ConnectionEvent::new(path, *connected)),
        _ => None,
    }
}
