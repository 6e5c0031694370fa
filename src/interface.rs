//! zbus interfaces forwarding to [`BusObject`]s.

use std::{collections::HashMap, sync::Arc};

use zbus::{
    dbus_interface,
    zvariant::{DeserializeDict, ObjectPath, OwnedObjectPath, OwnedValue, Type, Value},
    DBusError, ObjectServer,
};

use crate::{
    bus::{
        BusObject, MethodCall, PropValue, Reply, RequestOptions, ADVERTISEMENT_INTERFACE,
        CHARACTERISTIC_INTERFACE, DESCRIPTOR_INTERFACE, OBJECT_MANAGER_INTERFACE,
        SERVICE_INTERFACE,
    },
    ReqError,
};

/// Error replies sent back to BlueZ.
#[derive(Debug, DBusError)]
#[dbus_error(prefix = "org.bluez.Error")]
pub(crate) enum BluezError {
    #[dbus_error(zbus_error)]
    ZBus(zbus::Error),
    Failed(String),
    InProgress(String),
    InvalidOffset(String),
    InvalidValueLength(String),
    NotPermitted(String),
    NotAuthorized(String),
    NotSupported(String),
}

impl From<ReqError> for BluezError {
    fn from(e: ReqError) -> Self {
        let msg = e.to_string();
        match e {
            ReqError::Failed => Self::Failed(msg),
            ReqError::InProgress => Self::InProgress(msg),
            ReqError::InvalidOffset => Self::InvalidOffset(msg),
            ReqError::InvalidValueLength => Self::InvalidValueLength(msg),
            ReqError::NotPermitted => Self::NotPermitted(msg),
            ReqError::NotAuthorized => Self::NotAuthorized(msg),
            ReqError::NotSupported => Self::NotSupported(msg),
        }
    }
}

#[derive(Default, DeserializeDict, Type)]
#[zvariant(signature = "dict")]
pub(crate) struct ReadOptions {
    offset: Option<u16>,
    mtu: Option<u16>,
    device: Option<OwnedObjectPath>,
}

impl From<ReadOptions> for RequestOptions {
    fn from(options: ReadOptions) -> Self {
        Self {
            offset: options.offset,
            mtu: options.mtu,
            device: options.device.map(|p| p.to_string()),
        }
    }
}

#[derive(Default, DeserializeDict, Type)]
#[zvariant(signature = "dict")]
pub(crate) struct WriteOptions {
    offset: Option<u16>,
    /// `command`, `request`, `reliable`
    #[zvariant(rename = "type")]
    ty: Option<String>,
    mtu: Option<u16>,
    device: Option<OwnedObjectPath>,
    link: Option<String>,
    #[zvariant(rename = "prepare-authorize")]
    prepare_authorize: Option<bool>,
}

impl From<WriteOptions> for RequestOptions {
    fn from(options: WriteOptions) -> Self {
        if options.prepare_authorize == Some(true) {
            log::debug!("prepare-authorize write, treating as a regular write");
        }
        log::trace!(
            "write type {:?} over {:?}",
            options.ty.as_deref(),
            options.link.as_deref()
        );
        Self {
            offset: options.offset,
            mtu: options.mtu,
            device: options.device.map(|p| p.to_string()),
        }
    }
}

/// Converts a property value into its D-Bus representation.
pub(crate) fn to_value(value: PropValue) -> zbus::Result<OwnedValue> {
    let value = match value {
        PropValue::Str(s) => Value::from(s),
        PropValue::StrList(list) => Value::from(list),
        PropValue::Bool(b) => Value::from(b),
        PropValue::U16(n) => Value::from(n),
        PropValue::Bytes(bytes) => Value::from(bytes),
        PropValue::Path(path) => Value::from(ObjectPath::try_from(path)?),
        PropValue::PathList(paths) => Value::from(
            paths
                .into_iter()
                .map(ObjectPath::try_from)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        PropValue::BytesByU16(map) => Value::from(
            map.into_iter()
                .map(|(k, v)| (k, Value::from(v)))
                .collect::<HashMap<_, _>>(),
        ),
        PropValue::BytesByStr(map) => Value::from(
            map.into_iter()
                .map(|(k, v)| (k, Value::from(v)))
                .collect::<HashMap<_, _>>(),
        ),
    };
    Ok(OwnedValue::from(value))
}

/// Typed access to the properties of a [`BusObject`].
///
/// A property of the wrong type indicates a bug in the object; it is logged and replaced with an
/// empty value so the D-Bus signature stays intact.
struct Props<'a>(&'a dyn BusObject);

impl Props<'_> {
    fn get(&self, name: &str) -> Option<PropValue> {
        self.0.property(name)
    }

    fn mismatch(&self, name: &str, value: Option<PropValue>) {
        log::error!(
            "property {} of {} has unexpected value {:?}",
            name,
            self.0.interface(),
            value
        );
    }

    fn string(&self, name: &str) -> String {
        match self.get(name) {
            Some(PropValue::Str(s)) => s,
            other => {
                self.mismatch(name, other);
                String::new()
            }
        }
    }

    fn strings(&self, name: &str) -> Vec<String> {
        match self.get(name) {
            Some(PropValue::StrList(list)) => list,
            other => {
                self.mismatch(name, other);
                Vec::new()
            }
        }
    }

    fn boolean(&self, name: &str) -> bool {
        match self.get(name) {
            Some(PropValue::Bool(b)) => b,
            other => {
                self.mismatch(name, other);
                false
            }
        }
    }

    fn u16(&self, name: &str) -> u16 {
        match self.get(name) {
            Some(PropValue::U16(n)) => n,
            other => {
                self.mismatch(name, other);
                0
            }
        }
    }

    fn bytes(&self, name: &str) -> Vec<u8> {
        match self.get(name) {
            Some(PropValue::Bytes(bytes)) => bytes,
            other => {
                self.mismatch(name, other);
                Vec::new()
            }
        }
    }

    fn path(&self, name: &str) -> OwnedObjectPath {
        match self.get(name) {
            Some(PropValue::Path(path)) => match OwnedObjectPath::try_from(path) {
                Ok(path) => path,
                Err(e) => {
                    log::error!("property {} is not an object path: {}", name, e);
                    OwnedObjectPath::from(ObjectPath::from_static_str_unchecked("/"))
                }
            },
            other => {
                self.mismatch(name, other);
                OwnedObjectPath::from(ObjectPath::from_static_str_unchecked("/"))
            }
        }
    }

    fn paths(&self, name: &str) -> Vec<OwnedObjectPath> {
        match self.get(name) {
            Some(PropValue::PathList(paths)) => paths
                .into_iter()
                .filter_map(|path| OwnedObjectPath::try_from(path).ok())
                .collect(),
            other => {
                self.mismatch(name, other);
                Vec::new()
            }
        }
    }

    fn bytes_by_u16(&self, name: &str) -> HashMap<u16, OwnedValue> {
        match self.get(name) {
            Some(PropValue::BytesByU16(map)) => map
                .into_iter()
                .map(|(k, v)| (k, OwnedValue::from(Value::from(v))))
                .collect(),
            other => {
                self.mismatch(name, other);
                HashMap::new()
            }
        }
    }

    fn bytes_by_str(&self, name: &str) -> HashMap<String, OwnedValue> {
        match self.get(name) {
            Some(PropValue::BytesByStr(map)) => map
                .into_iter()
                .map(|(k, v)| (k, OwnedValue::from(Value::from(v))))
                .collect(),
            // Absent unless service data was set.
            None => HashMap::new(),
            other => {
                self.mismatch(name, other);
                HashMap::new()
            }
        }
    }
}

fn dispatch(object: &dyn BusObject, call: MethodCall) -> Result<Reply, BluezError> {
    log::trace!("{} on {}", call.name(), object.interface());
    object.call(call).map_err(BluezError::from)
}

fn unexpected(reply: Reply) -> BluezError {
    log::error!("unexpected reply {:?}", reply);
    BluezError::Failed(ReqError::Failed.to_string())
}

fn read(object: &dyn BusObject, options: ReadOptions) -> Result<Vec<u8>, BluezError> {
    let options = options.into();
    match dispatch(object, MethodCall::ReadValue { options })? {
        Reply::Bytes(value) => Ok(value),
        reply => Err(unexpected(reply)),
    }
}

fn write(object: &dyn BusObject, value: Vec<u8>, options: WriteOptions) -> Result<(), BluezError> {
    let options = options.into();
    dispatch(object, MethodCall::WriteValue { value, options }).map(drop)
}

pub(crate) struct ServiceInterface(Arc<dyn BusObject>);

#[dbus_interface(name = "org.bluez.GattService1")]
impl ServiceInterface {
    #[dbus_interface(property, name = "UUID")]
    fn uuid(&self) -> String {
        Props(&*self.0).string("UUID")
    }

    #[dbus_interface(property)]
    fn primary(&self) -> bool {
        Props(&*self.0).boolean("Primary")
    }

    #[dbus_interface(property)]
    fn characteristics(&self) -> Vec<OwnedObjectPath> {
        Props(&*self.0).paths("Characteristics")
    }
}

pub(crate) struct CharacteristicInterface(Arc<dyn BusObject>);

#[dbus_interface(name = "org.bluez.GattCharacteristic1")]
impl CharacteristicInterface {
    fn read_value(&self, options: ReadOptions) -> Result<Vec<u8>, BluezError> {
        read(&*self.0, options)
    }

    fn write_value(&self, value: Vec<u8>, options: WriteOptions) -> Result<(), BluezError> {
        write(&*self.0, value, options)
    }

    fn start_notify(&self) -> Result<(), BluezError> {
        dispatch(&*self.0, MethodCall::StartNotify).map(drop)
    }

    fn stop_notify(&self) -> Result<(), BluezError> {
        dispatch(&*self.0, MethodCall::StopNotify).map(drop)
    }

    #[dbus_interface(property, name = "UUID")]
    fn uuid(&self) -> String {
        Props(&*self.0).string("UUID")
    }

    #[dbus_interface(property)]
    fn service(&self) -> OwnedObjectPath {
        Props(&*self.0).path("Service")
    }

    #[dbus_interface(property)]
    fn value(&self) -> Vec<u8> {
        Props(&*self.0).bytes("Value")
    }

    #[dbus_interface(property)]
    fn flags(&self) -> Vec<String> {
        Props(&*self.0).strings("Flags")
    }

    #[dbus_interface(property)]
    fn descriptors(&self) -> Vec<OwnedObjectPath> {
        Props(&*self.0).paths("Descriptors")
    }
}

pub(crate) struct DescriptorInterface(Arc<dyn BusObject>);

#[dbus_interface(name = "org.bluez.GattDescriptor1")]
impl DescriptorInterface {
    fn read_value(&self, options: ReadOptions) -> Result<Vec<u8>, BluezError> {
        read(&*self.0, options)
    }

    fn write_value(&self, value: Vec<u8>, options: WriteOptions) -> Result<(), BluezError> {
        write(&*self.0, value, options)
    }

    #[dbus_interface(property, name = "UUID")]
    fn uuid(&self) -> String {
        Props(&*self.0).string("UUID")
    }

    #[dbus_interface(property)]
    fn characteristic(&self) -> OwnedObjectPath {
        Props(&*self.0).path("Characteristic")
    }

    #[dbus_interface(property)]
    fn value(&self) -> Vec<u8> {
        Props(&*self.0).bytes("Value")
    }

    #[dbus_interface(property)]
    fn flags(&self) -> Vec<String> {
        Props(&*self.0).strings("Flags")
    }
}

pub(crate) struct AdvertisementInterface(Arc<dyn BusObject>);

#[dbus_interface(name = "org.bluez.LEAdvertisement1")]
impl AdvertisementInterface {
    fn release(&self) -> Result<(), BluezError> {
        dispatch(&*self.0, MethodCall::Release).map(drop)
    }

    #[dbus_interface(property, name = "Type")]
    fn kind(&self) -> String {
        Props(&*self.0).string("Type")
    }

    #[dbus_interface(property, name = "ServiceUUIDs")]
    fn service_uuids(&self) -> Vec<String> {
        Props(&*self.0).strings("ServiceUUIDs")
    }

    #[dbus_interface(property)]
    fn local_name(&self) -> String {
        Props(&*self.0).string("LocalName")
    }

    #[dbus_interface(property)]
    fn manufacturer_data(&self) -> HashMap<u16, OwnedValue> {
        Props(&*self.0).bytes_by_u16("ManufacturerData")
    }

    #[dbus_interface(property)]
    fn service_data(&self) -> HashMap<String, OwnedValue> {
        Props(&*self.0).bytes_by_str("ServiceData")
    }

    #[dbus_interface(property)]
    fn includes(&self) -> Vec<String> {
        Props(&*self.0).strings("Includes")
    }

    #[dbus_interface(property)]
    fn appearance(&self) -> u16 {
        Props(&*self.0).u16("Appearance")
    }

    #[dbus_interface(property)]
    fn flags(&self) -> Vec<u8> {
        Props(&*self.0).bytes("Flags")
    }
}

type ManagedObjects = HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>>;

pub(crate) struct ApplicationInterface(Arc<dyn BusObject>);

#[dbus_interface(name = "org.freedesktop.DBus.ObjectManager")]
impl ApplicationInterface {
    fn get_managed_objects(&self) -> Result<ManagedObjects, BluezError> {
        let objects = match dispatch(&*self.0, MethodCall::GetManagedObjects)? {
            Reply::ManagedObjects(objects) => objects,
            reply => return Err(unexpected(reply)),
        };

        let mut managed = ManagedObjects::new();
        for (path, interfaces) in objects {
            let path = OwnedObjectPath::try_from(path).map_err(|e| BluezError::ZBus(e.into()))?;
            let mut converted = HashMap::new();
            for (interface, props) in interfaces {
                let props = props
                    .into_iter()
                    .map(|(name, value)| Ok((name.to_string(), to_value(value)?)))
                    .collect::<zbus::Result<HashMap<_, _>>>()
                    .map_err(BluezError::ZBus)?;
                converted.insert(interface.to_string(), props);
            }
            managed.insert(path, converted);
        }
        Ok(managed)
    }
}

/// Adds the zbus interface matching `object` at `path`.
///
/// Returns `false` if `path` already carries that interface.
pub(crate) async fn serve(
    server: &ObjectServer,
    path: &str,
    object: Arc<dyn BusObject>,
) -> zbus::Result<bool> {
    match object.interface() {
        SERVICE_INTERFACE => server.at(path, ServiceInterface(object)).await,
        CHARACTERISTIC_INTERFACE => server.at(path, CharacteristicInterface(object)).await,
        DESCRIPTOR_INTERFACE => server.at(path, DescriptorInterface(object)).await,
        ADVERTISEMENT_INTERFACE => server.at(path, AdvertisementInterface(object)).await,
        OBJECT_MANAGER_INTERFACE => server.at(path, ApplicationInterface(object)).await,
        _ => Err(zbus::Error::InterfaceNotFound),
    }
}

/// Removes the zbus interface `interface` (as previously added by [`serve`]) from `path`.
pub(crate) async fn unserve(
    server: &ObjectServer,
    path: &str,
    interface: &str,
) -> zbus::Result<bool> {
    match interface {
        SERVICE_INTERFACE => server.remove::<ServiceInterface, _>(path).await,
        CHARACTERISTIC_INTERFACE => server.remove::<CharacteristicInterface, _>(path).await,
        DESCRIPTOR_INTERFACE => server.remove::<DescriptorInterface, _>(path).await,
        ADVERTISEMENT_INTERFACE => server.remove::<AdvertisementInterface, _>(path).await,
        OBJECT_MANAGER_INTERFACE => server.remove::<ApplicationInterface, _>(path).await,
        _ => Err(zbus::Error::InterfaceNotFound),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
    };

    use super::*;
    use crate::bus::Properties;

    /// Serves a fixed value and remembers the options of the last call.
    struct Recorder {
        value: Vec<u8>,
        seen: Mutex<Vec<RequestOptions>>,
    }

    impl BusObject for Recorder {
        fn interface(&self) -> &'static str {
            DESCRIPTOR_INTERFACE
        }

        fn properties(&self) -> Properties {
            Properties::from([
                ("Characteristic", PropValue::Path("/app/service0/char0".into())),
                ("Flags", PropValue::StrList(vec!["read".into()])),
            ])
        }

        fn call(&self, call: MethodCall) -> Result<Reply, ReqError> {
            match call {
                MethodCall::ReadValue { options } => {
                    self.seen.lock().unwrap().push(options);
                    Ok(Reply::Bytes(self.value.clone()))
                }
                MethodCall::WriteValue { options, .. } => {
                    self.seen.lock().unwrap().push(options);
                    Ok(Reply::Empty)
                }
                _ => Err(ReqError::NotSupported),
            }
        }
    }

    fn device() -> OwnedObjectPath {
        OwnedObjectPath::try_from("/org/bluez/hci0/dev_01_02_03_04_05_06").unwrap()
    }

    #[test]
    fn values() {
        let value = to_value(PropValue::Path("/org/bluez/blues/service0".into())).unwrap();
        assert_eq!(value.value_signature().as_str(), "o");

        let value = to_value(PropValue::BytesByU16(BTreeMap::from([(0xffff, vec![1])]))).unwrap();
        assert_eq!(value.value_signature().as_str(), "a{qv}");

        let value = to_value(PropValue::BytesByStr(BTreeMap::new())).unwrap();
        assert_eq!(value.value_signature().as_str(), "a{sv}");

        let value = to_value(PropValue::StrList(vec!["read".into()])).unwrap();
        assert_eq!(value.value_signature().as_str(), "as");

        to_value(PropValue::Path("not a path".into())).unwrap_err();
    }

    #[test]
    fn request_errors() {
        let e = BluezError::from(ReqError::NotPermitted);
        assert_eq!(e.name().as_str(), "org.bluez.Error.NotPermitted");

        let e = BluezError::from(ReqError::Failed);
        assert_eq!(e.name().as_str(), "org.bluez.Error.Failed");
    }

    #[test]
    fn options() {
        let options = RequestOptions::from(ReadOptions {
            offset: Some(4),
            mtu: Some(23),
            device: Some(
                OwnedObjectPath::try_from("/org/bluez/hci0/dev_01_02_03_04_05_06").unwrap(),
            ),
        });
        assert_eq!(options.offset, Some(4));
        assert_eq!(
            options.device.as_deref(),
            Some("/org/bluez/hci0/dev_01_02_03_04_05_06")
        );
    }

    #[test]
    fn options_reach_objects_and_values_stay_whole() {
        let recorder = Arc::new(Recorder {
            value: b"0123456789".to_vec(),
            seen: Mutex::new(Vec::new()),
        });
        let descriptor = DescriptorInterface(recorder.clone());

        let value = descriptor
            .read_value(ReadOptions {
                offset: Some(4),
                mtu: Some(23),
                device: Some(device()),
            })
            .unwrap();
        assert_eq!(value, b"0123456789");

        descriptor
            .write_value(
                b"ab".to_vec(),
                WriteOptions {
                    offset: Some(2),
                    ty: Some("request".into()),
                    prepare_authorize: Some(true),
                    ..WriteOptions::default()
                },
            )
            .unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(
            *seen,
            [
                RequestOptions {
                    offset: Some(4),
                    mtu: Some(23),
                    device: Some("/org/bluez/hci0/dev_01_02_03_04_05_06".into()),
                },
                RequestOptions {
                    offset: Some(2),
                    mtu: None,
                    device: None,
                },
            ]
        );
        assert_eq!(
            seen[0].device_address().map(|a| a.to_string()).as_deref(),
            Some("01:02:03:04:05:06")
        );
    }

    #[test]
    fn descriptor_properties() {
        let recorder = Arc::new(Recorder {
            value: Vec::new(),
            seen: Mutex::new(Vec::new()),
        });
        let descriptor = DescriptorInterface(recorder);
        assert_eq!(descriptor.characteristic().as_str(), "/app/service0/char0");
        assert_eq!(descriptor.flags(), ["read"]);
        // Missing properties degrade to empty values.
        assert_eq!(descriptor.uuid(), "");
    }
}
