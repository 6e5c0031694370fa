//! The object bus GATT objects are published on.
//!
//! Everything this crate exports to the Bluetooth manager is a [`BusObject`]: a value that knows
//! which interface it implements, what its properties currently are, and how to answer a
//! [`MethodCall`]. An [`ObjectBus`] publishes such objects at object paths and forwards inbound
//! calls to them, and carries the few outbound calls ([`ManagerCall`]) the peripheral makes into
//! the Bluetooth manager.
//!
//! [`Session`][crate::Session] implements [`ObjectBus`] on top of D-Bus,
//! [`MemoryBus`][crate::memory::MemoryBus] implements it in-process.

use std::{collections::BTreeMap, fmt, future::Future, pin::pin, sync::Arc, time::Duration};

use async_io::Timer;
use async_trait::async_trait;
use futures_util::{
    future::{select, Either},
    stream::BoxStream,
};

use crate::{address::Address, device::ConnectionEvent, Error, ErrorKind, ReqError, Result};

pub const SERVICE_INTERFACE: &str = "org.bluez.GattService1";
pub const CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";
pub const DESCRIPTOR_INTERFACE: &str = "org.bluez.GattDescriptor1";
pub const ADVERTISEMENT_INTERFACE: &str = "org.bluez.LEAdvertisement1";
pub const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

/// The value of a property exposed by a [`BusObject`].
///
/// Each variant corresponds to exactly one D-Bus signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    /// `s`
    Str(String),
    /// `as`
    StrList(Vec<String>),
    /// `b`
    Bool(bool),
    /// `q`
    U16(u16),
    /// `ay`
    Bytes(Vec<u8>),
    /// `o`
    Path(String),
    /// `ao`
    PathList(Vec<String>),
    /// `a{qv}` where every value is an `ay`.
    BytesByU16(BTreeMap<u16, Vec<u8>>),
    /// `a{sv}` where every value is an `ay`.
    BytesByStr(BTreeMap<String, Vec<u8>>),
}

/// The properties of one interface, keyed by property name.
pub type Properties = BTreeMap<&'static str, PropValue>;

/// The reply to `GetManagedObjects`: object path → interface → properties.
pub type ManagedObjects = BTreeMap<String, BTreeMap<&'static str, Properties>>;

/// Connection-specific hints BlueZ passes along with `ReadValue` and `WriteValue`.
///
/// These are informational only. Offsets in particular are not honored: values are always read
/// and written as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub offset: Option<u16>,
    pub mtu: Option<u16>,
    /// Object path of the remote device issuing the request.
    pub device: Option<String>,
}

impl RequestOptions {
    /// Returns the [`Address`] of the remote device issuing the request, if BlueZ told us.
    pub fn device_address(&self) -> Option<Address> {
        self.device.as_deref().and_then(Address::from_device_path)
    }
}

/// An inbound method call dispatched to a [`BusObject`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodCall {
    ReadValue { options: RequestOptions },
    WriteValue { value: Vec<u8>, options: RequestOptions },
    StartNotify,
    StopNotify,
    Release,
    GetManagedObjects,
}

impl MethodCall {
    /// The D-Bus member name of this call.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadValue { .. } => "ReadValue",
            Self::WriteValue { .. } => "WriteValue",
            Self::StartNotify => "StartNotify",
            Self::StopNotify => "StopNotify",
            Self::Release => "Release",
            Self::GetManagedObjects => "GetManagedObjects",
        }
    }
}

/// The successful result of a [`MethodCall`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Empty,
    Bytes(Vec<u8>),
    ManagedObjects(ManagedObjects),
}

/// An object that can be published on an [`ObjectBus`].
///
/// Objects are called from the bus's dispatcher. Implementations must not block for long, since
/// a slow object stalls every other call on the same bus.
pub trait BusObject: Send + Sync {
    /// The interface this object implements (one of the `*_INTERFACE` constants).
    fn interface(&self) -> &'static str;

    /// Returns a snapshot of all properties of this object.
    fn properties(&self) -> Properties;

    /// Returns the current value of a single property.
    fn property(&self, name: &str) -> Option<PropValue> {
        self.properties().remove(name)
    }

    /// Handles an inbound method call.
    fn call(&self, call: MethodCall) -> std::result::Result<Reply, ReqError>;
}

/// A call from the peripheral into the Bluetooth manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerCall {
    /// `org.bluez.LEAdvertisingManager1.RegisterAdvertisement(path, {})`
    RegisterAdvertisement { path: String },
    /// `org.bluez.LEAdvertisingManager1.UnregisterAdvertisement(path)`
    UnregisterAdvertisement { path: String },
    /// `org.bluez.GattManager1.RegisterApplication(path, {})`
    RegisterApplication { path: String },
    /// `org.bluez.GattManager1.UnregisterApplication(path)`
    UnregisterApplication { path: String },
    /// Sets `org.bluez.Adapter1.Powered` to `true`.
    PowerOn,
}

impl ManagerCall {
    /// The D-Bus member name of this call.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegisterAdvertisement { .. } => "RegisterAdvertisement",
            Self::UnregisterAdvertisement { .. } => "UnregisterAdvertisement",
            Self::RegisterApplication { .. } => "RegisterApplication",
            Self::UnregisterApplication { .. } => "UnregisterApplication",
            Self::PowerOn => "PowerOn",
        }
    }
}

/// A Bluetooth adapter known to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// The adapter's device name (eg. `hci0`).
    pub name: String,
    /// The adapter's object path (eg. `/org/bluez/hci0`).
    pub path: String,
    /// The adapter's own address, if it could be determined.
    pub address: Option<Address>,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Some(addr) => write!(f, "{} ({})", self.name, addr),
            None => f.write_str(&self.name),
        }
    }
}

/// A stream of devices connecting to and disconnecting from the adapter.
pub type ConnectionEvents = BoxStream<'static, ConnectionEvent>;

/// An object bus connected to a Bluetooth manager.
#[async_trait]
pub trait ObjectBus: Send + Sync {
    /// Publishes `object` at `path`.
    ///
    /// Fails with [`ErrorKind::Transport`] if the path is malformed or already taken.
    async fn register_object(&self, path: &str, object: Arc<dyn BusObject>) -> Result<()>;

    /// Removes the object at `path`.
    ///
    /// Returns `false` if there was nothing to remove.
    async fn unregister_object(&self, path: &str) -> Result<bool>;

    /// Calls into the Bluetooth manager on behalf of the adapter at `adapter`.
    ///
    /// If `timeout` is given and elapses before the manager replies, fails with
    /// [`ErrorKind::Timeout`].
    async fn call_method(
        &self,
        adapter: &str,
        call: ManagerCall,
        timeout: Option<Duration>,
    ) -> Result<()>;

    /// Signals that property `name` of `interface` on the object at `path` changed to `value`.
    async fn emit_property_changed(
        &self,
        path: &str,
        interface: &'static str,
        name: &'static str,
        value: PropValue,
    ) -> Result<()>;

    /// Looks up the adapter to use: the one called `name`, or the first suitable one.
    async fn adapter(&self, name: Option<&str>) -> Result<AdapterInfo>;

    /// Returns a stream reporting devices connecting to and disconnecting from `adapter`.
    async fn connection_events(&self, adapter: &str) -> Result<ConnectionEvents>;
}

/// Awaits `fut`, giving up after `timeout` (if any).
pub(crate) async fn with_timeout<T>(
    fut: impl Future<Output = Result<T>>,
    timeout: Option<Duration>,
    what: &str,
) -> Result<T> {
    let Some(timeout) = timeout else {
        return fut.await;
    };

    match select(pin!(fut), pin!(Timer::after(timeout))).await {
        Either::Left((res, _)) => res,
        Either::Right(_) => Err(Error::new(
            ErrorKind::Timeout,
            format!("{} timed out after {:?}", what, timeout),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::future::pending;

    use super::*;

    #[test]
    fn timeout_elapses() {
        let res = pollster::block_on(with_timeout(
            pending::<Result<()>>(),
            Some(Duration::from_millis(20)),
            "UnregisterAdvertisement",
        ));
        let err = res.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().starts_with("UnregisterAdvertisement timed out"));
    }

    #[test]
    fn timeout_not_reached() {
        let res = pollster::block_on(with_timeout(
            async { Ok(5) },
            Some(Duration::from_secs(10)),
            "RegisterAdvertisement",
        ));
        assert_eq!(res.unwrap(), 5);

        let res = pollster::block_on(with_timeout(async { Ok(()) }, None, "unbounded"));
        res.unwrap();
    }

    #[test]
    fn request_options_device() {
        let options = RequestOptions {
            device: Some("/org/bluez/hci0/dev_01_02_03_04_05_06".into()),
            ..Default::default()
        };
        assert_eq!(
            options.device_address(),
            Some(Address::from([1, 2, 3, 4, 5, 6]))
        );
        assert_eq!(RequestOptions::default().device_address(), None);
    }
}
