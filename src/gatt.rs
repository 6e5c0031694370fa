//! GATT [`Service`]s, [`Characteristic`]s and [`Descriptor`]s published by the peripheral.

use std::{
    mem,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use crate::{
    bus::{
        BusObject, MethodCall, ObjectBus, PropValue, Properties, Reply, RequestOptions,
        CHARACTERISTIC_INTERFACE, DESCRIPTOR_INTERFACE, SERVICE_INTERFACE,
    },
    uuid::Uuid,
    Error, ErrorKind, ReqError, Result,
};

// Object path suffixes are never reused, not even after unregistering.
static NEXT_SERVICE_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_CHARACTERISTIC_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_DESCRIPTOR_ID: AtomicU64 = AtomicU64::new(0);

bitflags::bitflags! {
    /// A set of flags detailing the supported operations on a [`Characteristic`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CharacteristicFlags: u8 {
        /// The remote device may read the value.
        const READ = 1 << 0;
        /// The remote device may write the value.
        const WRITE = 1 << 1;
        /// Value changes are pushed to the remote device without acknowledgement.
        const NOTIFY = 1 << 2;
        /// Value changes are pushed to the remote device and acknowledged by it.
        const INDICATE = 1 << 3;
    }
}

impl CharacteristicFlags {
    /// Returns a [`bool`] indicating whether value changes are pushed to remote devices (via
    /// either notifications or indications).
    pub fn can_notify(self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }

    /// Returns the flags as the strings used in the `Flags` property of
    /// `org.bluez.GattCharacteristic1`.
    pub fn to_strings(self) -> Vec<String> {
        [
            (Self::READ, "read"),
            (Self::WRITE, "write"),
            (Self::NOTIFY, "notify"),
            (Self::INDICATE, "indicate"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name.to_string())
        .collect()
    }
}

bitflags::bitflags! {
    /// A set of flags detailing the supported operations on a [`Descriptor`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DescriptorFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl DescriptorFlags {
    /// Returns the flags as the strings used in the `Flags` property of
    /// `org.bluez.GattDescriptor1`.
    pub fn to_strings(self) -> Vec<String> {
        [(Self::READ, "read"), (Self::WRITE, "write")]
            .into_iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| name.to_string())
            .collect()
    }
}

type ReadHandler = Arc<dyn Fn() -> std::result::Result<Vec<u8>, ReqError> + Send + Sync>;
type WriteHandler = Arc<dyn Fn(&[u8]) -> std::result::Result<(), ReqError> + Send + Sync>;

// A panicking handler never runs with a lock held, but stay usable regardless.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The value and handler slots of a characteristic or descriptor.
struct Attribute {
    kind: &'static str,
    uuid: Uuid,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    value: Vec<u8>,
    read_handler: Option<ReadHandler>,
    write_handler: Option<WriteHandler>,
}

impl Attribute {
    fn new(kind: &'static str, uuid: Uuid) -> Self {
        Self {
            kind,
            uuid,
            slot: Mutex::new(Slot::default()),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        lock(&self.slot)
    }

    fn value(&self) -> Vec<u8> {
        self.slot().value.clone()
    }

    fn set_value(&self, value: Vec<u8>) {
        self.slot().value = value;
    }

    fn read(&self, options: &RequestOptions) -> std::result::Result<Vec<u8>, ReqError> {
        log::debug!(
            "ReadValue on {} {} from {:?}",
            self.kind,
            self.uuid,
            options.device
        );
        let handler = self.slot().read_handler.clone();
        match handler {
            Some(handler) => self.guarded("read", || handler()),
            None => Ok(self.value()),
        }
    }

    fn write(&self, value: Vec<u8>, options: &RequestOptions) -> std::result::Result<(), ReqError> {
        log::debug!(
            "WriteValue of {} bytes on {} {} from {:?}",
            value.len(),
            self.kind,
            self.uuid,
            options.device
        );
        let handler = self.slot().write_handler.clone();
        match handler {
            Some(handler) => self.guarded("write", || handler(&value)),
            None => {
                self.set_value(value);
                Ok(())
            }
        }
    }

    /// Runs an application handler, turning panics into [`ReqError::Failed`].
    fn guarded<T>(
        &self,
        what: &str,
        handler: impl FnOnce() -> std::result::Result<T, ReqError>,
    ) -> std::result::Result<T, ReqError> {
        match catch_unwind(AssertUnwindSafe(handler)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                log::error!("{} handler of {} {} failed: {}", what, self.kind, self.uuid, e);
                Err(e)
            }
            Err(_) => {
                log::error!("{} handler of {} {} panicked", what, self.kind, self.uuid);
                Err(ReqError::Failed)
            }
        }
    }

    /// Answers the `ReadValue` and `WriteValue` calls shared by both object kinds.
    fn call(&self, call: MethodCall) -> std::result::Result<Reply, ReqError> {
        match call {
            MethodCall::ReadValue { options } => self.read(&options).map(Reply::Bytes),
            MethodCall::WriteValue { value, options } => {
                self.write(value, &options).map(|()| Reply::Empty)
            }
            other => {
                log::warn!(
                    "unsupported call {} on {} {}",
                    other.name(),
                    self.kind,
                    self.uuid
                );
                Err(ReqError::NotSupported)
            }
        }
    }
}

/// A GATT characteristic: a value that remote devices can read, write, and/or be notified about.
///
/// [`Characteristic`] is a cheaply cloneable handle. Add one clone to a [`Service`], and keep
/// another to update the value or push notifications while the peripheral is running.
#[derive(Clone)]
pub struct Characteristic {
    inner: Arc<CharacteristicInner>,
}

struct CharacteristicInner {
    attr: Attribute,
    flags: CharacteristicFlags,
    descriptors: Mutex<Vec<Descriptor>>,
    registration: Mutex<Option<CharacteristicRegistration>>,
}

struct CharacteristicRegistration {
    bus: Arc<dyn ObjectBus>,
    path: String,
    object: Arc<CharacteristicObject>,
    /// The descriptors this registration published, and where.
    descriptors: Vec<(Descriptor, String)>,
}

impl Characteristic {
    /// Creates a detached [`Characteristic`] with an empty value and no handlers.
    pub fn new(uuid: Uuid, flags: CharacteristicFlags) -> Self {
        Self {
            inner: Arc::new(CharacteristicInner {
                attr: Attribute::new("characteristic", uuid),
                flags,
                descriptors: Mutex::new(Vec::new()),
                registration: Mutex::new(None),
            }),
        }
    }

    /// Returns the [`Uuid`] identifying this [`Characteristic`].
    pub fn uuid(&self) -> Uuid {
        self.inner.attr.uuid
    }

    /// Returns the [`CharacteristicFlags`] declared for this [`Characteristic`].
    pub fn flags(&self) -> CharacteristicFlags {
        self.inner.flags
    }

    /// Returns the stored value.
    ///
    /// This is the value served to readers when no read handler is installed.
    pub fn value(&self) -> Vec<u8> {
        self.inner.attr.value()
    }

    /// Returns the object path this [`Characteristic`] is published at, if it is registered.
    pub fn object_path(&self) -> Option<String> {
        lock(&self.inner.registration)
            .as_ref()
            .map(|reg| reg.path.clone())
    }

    fn is_registered_at(&self, path: &str) -> bool {
        self.object_path().as_deref() == Some(path)
    }

    /// Returns the [`Descriptor`]s of this [`Characteristic`], in insertion order.
    pub fn descriptors(&self) -> Vec<Descriptor> {
        lock(&self.inner.descriptors).clone()
    }

    /// Appends a [`Descriptor`] to this [`Characteristic`].
    ///
    /// Fails while the characteristic is registered.
    pub fn add_descriptor(&self, descriptor: Descriptor) -> Result<()> {
        if let Some(reg) = &*lock(&self.inner.registration) {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!(
                    "cannot add descriptor {} to characteristic {} registered at {}",
                    descriptor.uuid(),
                    self.uuid(),
                    reg.path
                ),
            ));
        }

        lock(&self.inner.descriptors).push(descriptor);
        Ok(())
    }

    /// Installs the handler producing the value for every `ReadValue` call, replacing any
    /// previous one.
    ///
    /// Handlers are invoked on the bus dispatcher and must not block for long.
    pub fn set_read_handler<F>(&self, handler: F)
    where
        F: Fn() -> std::result::Result<Vec<u8>, ReqError> + Send + Sync + 'static,
    {
        self.inner.attr.slot().read_handler = Some(Arc::new(handler));
    }

    /// Installs the handler consuming the bytes of every `WriteValue` call, replacing any
    /// previous one.
    ///
    /// While a write handler is installed, writes no longer update the stored value. Handlers are
    /// invoked on the bus dispatcher and must not block for long.
    pub fn set_write_handler<F>(&self, handler: F)
    where
        F: Fn(&[u8]) -> std::result::Result<(), ReqError> + Send + Sync + 'static,
    {
        self.inner.attr.slot().write_handler = Some(Arc::new(handler));
    }

    /// Replaces the stored value.
    pub fn set_value(&self, value: impl Into<Vec<u8>>) {
        self.inner.attr.set_value(value.into());
    }

    /// Replaces the stored value and, if this characteristic has the `notify` or `indicate` flag,
    /// pushes the new value to subscribed devices.
    ///
    /// Nothing is sent while the characteristic is not registered. Transport failures are logged.
    pub async fn notify_value(&self, value: impl Into<Vec<u8>>) {
        let value = value.into();
        self.inner.attr.set_value(value.clone());
        let uuid = self.uuid();

        if !self.inner.flags.can_notify() {
            log::debug!("characteristic {} cannot notify, only storing value", uuid);
            return;
        }
        let target = lock(&self.inner.registration)
            .as_ref()
            .map(|reg| (reg.bus.clone(), reg.path.clone()));
        let Some((bus, path)) = target else {
            log::debug!(
                "characteristic {} is not registered, only storing value",
                uuid
            );
            return;
        };

        log::debug!("notifying value change of characteristic {}", uuid);
        if let Err(e) = bus
            .emit_property_changed(
                &path,
                CHARACTERISTIC_INTERFACE,
                "Value",
                PropValue::Bytes(value),
            )
            .await
        {
            log::warn!(
                "failed to notify value change of characteristic {}: {}",
                uuid,
                e
            );
        }
    }

    /// Publishes this [`Characteristic`] on `bus`, below the service at `service_path`, followed
    /// by its descriptors.
    ///
    /// Returns the assigned object path. Descriptors that fail to register are logged and left
    /// out of the `Descriptors` property.
    pub async fn register(&self, bus: &Arc<dyn ObjectBus>, service_path: &str) -> Result<String> {
        if let Some(reg) = &*lock(&self.inner.registration) {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!(
                    "characteristic {} is already registered at {}",
                    self.uuid(),
                    reg.path
                ),
            ));
        }

        let path = format!(
            "{}/char{}",
            service_path,
            NEXT_CHARACTERISTIC_ID.fetch_add(1, Ordering::Relaxed)
        );
        let object = Arc::new(CharacteristicObject {
            inner: self.inner.clone(),
            service: service_path.to_string(),
        });
        bus.register_object(&path, object.clone()).await?;
        log::debug!("characteristic {} registered at {}", self.uuid(), path);

        let mut descriptors = Vec::new();
        for descriptor in self.descriptors() {
            match descriptor.register(bus, &path).await {
                Ok(desc_path) => descriptors.push((descriptor, desc_path)),
                Err(e) => log::warn!(
                    "failed to register descriptor {} of characteristic {}: {}",
                    descriptor.uuid(),
                    self.uuid(),
                    e
                ),
            }
        }

        *lock(&self.inner.registration) = Some(CharacteristicRegistration {
            bus: bus.clone(),
            path: path.clone(),
            object,
            descriptors,
        });
        Ok(path)
    }

    /// Removes this [`Characteristic`] and its descriptors from the bus.
    ///
    /// Does nothing if it isn't registered.
    pub async fn unregister(&self) {
        self.release(None).await;
    }

    /// Like [`Characteristic::unregister`], but only if it is still registered at `path`.
    async fn unregister_at(&self, path: &str) {
        self.release(Some(path)).await;
    }

    async fn release(&self, expected: Option<&str>) {
        let registration = {
            let mut registration = lock(&self.inner.registration);
            let moved = match (registration.as_ref(), expected) {
                (Some(reg), Some(path)) => reg.path != path,
                _ => false,
            };
            if moved {
                log::debug!(
                    "characteristic {} was re-registered elsewhere, leaving it alone",
                    self.uuid()
                );
                return;
            }
            registration.take()
        };
        let Some(registration) = registration else {
            return;
        };

        match registration.bus.unregister_object(&registration.path).await {
            Ok(_) => log::debug!(
                "characteristic {} unregistered from {}",
                self.uuid(),
                registration.path
            ),
            Err(e) => log::warn!(
                "failed to unregister characteristic {} from {}: {}",
                self.uuid(),
                registration.path,
                e
            ),
        }

        for (descriptor, path) in registration.descriptors {
            descriptor.unregister_at(&path).await;
        }
    }

    /// Returns the published characteristic object followed by its published descriptors.
    fn published_objects(&self) -> Vec<(String, Arc<dyn BusObject>)> {
        let registration = lock(&self.inner.registration);
        let Some(reg) = registration.as_ref() else {
            return Vec::new();
        };

        let mut objects = vec![(reg.path.clone(), reg.object.clone() as Arc<dyn BusObject>)];
        objects.extend(
            reg.descriptors
                .iter()
                .filter_map(|(descriptor, path)| descriptor.published_object_at(path)),
        );
        objects
    }
}

/// The bus-facing side of a [`Characteristic`].
struct CharacteristicObject {
    inner: Arc<CharacteristicInner>,
    service: String,
}

impl BusObject for CharacteristicObject {
    fn interface(&self) -> &'static str {
        CHARACTERISTIC_INTERFACE
    }

    fn properties(&self) -> Properties {
        let descriptors = lock(&self.inner.registration)
            .as_ref()
            .map(|reg| {
                reg.descriptors
                    .iter()
                    .filter(|(descriptor, path)| descriptor.is_registered_at(path))
                    .map(|(_, path)| path.clone())
                    .collect()
            })
            .unwrap_or_default();

        Properties::from([
            ("UUID", PropValue::Str(self.inner.attr.uuid.to_string())),
            ("Service", PropValue::Path(self.service.clone())),
            ("Value", PropValue::Bytes(self.inner.attr.value())),
            ("Flags", PropValue::StrList(self.inner.flags.to_strings())),
            ("Descriptors", PropValue::PathList(descriptors)),
        ])
    }

    fn call(&self, call: MethodCall) -> std::result::Result<Reply, ReqError> {
        let uuid = self.inner.attr.uuid;
        match call {
            MethodCall::StartNotify => {
                log::info!("start notifications for characteristic {}", uuid);
                Ok(Reply::Empty)
            }
            MethodCall::StopNotify => {
                log::info!("stop notifications for characteristic {}", uuid);
                Ok(Reply::Empty)
            }
            other => self.inner.attr.call(other),
        }
    }
}

/// A GATT descriptor: extra information attached to a [`Characteristic`], such as its
/// user description (`0x2901`).
///
/// Like [`Characteristic`], this is a cheaply cloneable handle.
#[derive(Clone)]
pub struct Descriptor {
    inner: Arc<DescriptorInner>,
}

struct DescriptorInner {
    attr: Attribute,
    flags: DescriptorFlags,
    registration: Mutex<Option<DescriptorRegistration>>,
}

struct DescriptorRegistration {
    bus: Arc<dyn ObjectBus>,
    path: String,
    object: Arc<DescriptorObject>,
}

impl Descriptor {
    /// Creates a detached [`Descriptor`] with an empty value and no handlers.
    pub fn new(uuid: Uuid, flags: DescriptorFlags) -> Self {
        Self {
            inner: Arc::new(DescriptorInner {
                attr: Attribute::new("descriptor", uuid),
                flags,
                registration: Mutex::new(None),
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.attr.uuid
    }

    pub fn flags(&self) -> DescriptorFlags {
        self.inner.flags
    }

    /// Returns the stored value.
    pub fn value(&self) -> Vec<u8> {
        self.inner.attr.value()
    }

    /// Returns the object path this [`Descriptor`] is published at, if it is registered.
    pub fn object_path(&self) -> Option<String> {
        lock(&self.inner.registration)
            .as_ref()
            .map(|reg| reg.path.clone())
    }

    fn is_registered_at(&self, path: &str) -> bool {
        self.object_path().as_deref() == Some(path)
    }

    /// Installs the handler producing the value for every `ReadValue` call.
    ///
    /// Same rules as [`Characteristic::set_read_handler`].
    pub fn set_read_handler<F>(&self, handler: F)
    where
        F: Fn() -> std::result::Result<Vec<u8>, ReqError> + Send + Sync + 'static,
    {
        self.inner.attr.slot().read_handler = Some(Arc::new(handler));
    }

    /// Installs the handler consuming the bytes of every `WriteValue` call.
    ///
    /// Same rules as [`Characteristic::set_write_handler`].
    pub fn set_write_handler<F>(&self, handler: F)
    where
        F: Fn(&[u8]) -> std::result::Result<(), ReqError> + Send + Sync + 'static,
    {
        self.inner.attr.slot().write_handler = Some(Arc::new(handler));
    }

    /// Replaces the stored value.
    pub fn set_value(&self, value: impl Into<Vec<u8>>) {
        self.inner.attr.set_value(value.into());
    }

    /// Publishes this [`Descriptor`] on `bus`, below the characteristic at `characteristic_path`.
    ///
    /// Returns the assigned object path.
    pub async fn register(
        &self,
        bus: &Arc<dyn ObjectBus>,
        characteristic_path: &str,
    ) -> Result<String> {
        if let Some(reg) = &*lock(&self.inner.registration) {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!(
                    "descriptor {} is already registered at {}",
                    self.uuid(),
                    reg.path
                ),
            ));
        }

        let path = format!(
            "{}/desc{}",
            characteristic_path,
            NEXT_DESCRIPTOR_ID.fetch_add(1, Ordering::Relaxed)
        );
        let object = Arc::new(DescriptorObject {
            inner: self.inner.clone(),
            characteristic: characteristic_path.to_string(),
        });
        bus.register_object(&path, object.clone()).await?;

        log::debug!("descriptor {} registered at {}", self.uuid(), path);
        *lock(&self.inner.registration) = Some(DescriptorRegistration {
            bus: bus.clone(),
            path: path.clone(),
            object,
        });
        Ok(path)
    }

    /// Removes this [`Descriptor`] from the bus.
    ///
    /// Does nothing if it isn't registered.
    pub async fn unregister(&self) {
        self.release(None).await;
    }

    async fn unregister_at(&self, path: &str) {
        self.release(Some(path)).await;
    }

    async fn release(&self, expected: Option<&str>) {
        let registration = {
            let mut registration = lock(&self.inner.registration);
            let moved = match (registration.as_ref(), expected) {
                (Some(reg), Some(path)) => reg.path != path,
                _ => false,
            };
            if moved {
                return;
            }
            registration.take()
        };
        let Some(registration) = registration else {
            return;
        };

        match registration.bus.unregister_object(&registration.path).await {
            Ok(_) => log::debug!(
                "descriptor {} unregistered from {}",
                self.uuid(),
                registration.path
            ),
            Err(e) => log::warn!(
                "failed to unregister descriptor {} from {}: {}",
                self.uuid(),
                registration.path,
                e
            ),
        }
    }

    fn published_object_at(&self, path: &str) -> Option<(String, Arc<dyn BusObject>)> {
        let registration = lock(&self.inner.registration);
        let reg = registration.as_ref().filter(|reg| reg.path == path)?;
        Some((reg.path.clone(), reg.object.clone() as Arc<dyn BusObject>))
    }
}

/// The bus-facing side of a [`Descriptor`].
struct DescriptorObject {
    inner: Arc<DescriptorInner>,
    characteristic: String,
}

impl BusObject for DescriptorObject {
    fn interface(&self) -> &'static str {
        DESCRIPTOR_INTERFACE
    }

    fn properties(&self) -> Properties {
        Properties::from([
            ("UUID", PropValue::Str(self.inner.attr.uuid.to_string())),
            (
                "Characteristic",
                PropValue::Path(self.characteristic.clone()),
            ),
            ("Value", PropValue::Bytes(self.inner.attr.value())),
            ("Flags", PropValue::StrList(self.inner.flags.to_strings())),
        ])
    }

    fn call(&self, call: MethodCall) -> std::result::Result<Reply, ReqError> {
        self.inner.attr.call(call)
    }
}

/// A GATT service: a group of [`Characteristic`]s identified by a [`Uuid`].
pub struct Service {
    uuid: Uuid,
    primary: bool,
    characteristics: Vec<Characteristic>,
    registration: Option<ServiceHandle>,
}

struct ServiceHandle {
    bus: Arc<dyn ObjectBus>,
    path: String,
    object: Arc<ServiceObject>,
}

/// The outcome of [`Service::register`].
///
/// The service object itself was published; each of its characteristics may or may not have
/// been.
#[derive(Debug)]
pub struct ServiceRegistration {
    /// The object path of the service.
    pub path: String,
    /// The registration result of every characteristic, in insertion order.
    pub characteristics: Vec<(Uuid, Result<String>)>,
}

impl ServiceRegistration {
    /// Returns `true` if every characteristic was registered.
    pub fn is_complete(&self) -> bool {
        self.characteristics.iter().all(|(_, res)| res.is_ok())
    }

    /// Returns the characteristics that could not be registered.
    pub fn failures(&self) -> impl Iterator<Item = (Uuid, &Error)> + '_ {
        self.characteristics
            .iter()
            .filter_map(|(uuid, res)| res.as_ref().err().map(|e| (*uuid, e)))
    }
}

impl Service {
    /// Creates a detached [`Service`] without characteristics.
    ///
    /// If `primary` is `false`, the service is secondary.
    pub fn new(uuid: Uuid, primary: bool) -> Self {
        Self {
            uuid,
            primary,
            characteristics: Vec::new(),
            registration: None,
        }
    }

    /// Returns the [`Uuid`] identifying this [`Service`].
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns a [`bool`] indicating whether this [`Service`] is a primary service.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Returns the [`Characteristic`]s of this [`Service`], in insertion order.
    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }

    /// Returns the object path this [`Service`] is published at, if it is registered.
    pub fn object_path(&self) -> Option<&str> {
        self.registration.as_ref().map(|reg| reg.path.as_str())
    }

    /// Appends a [`Characteristic`] to this [`Service`].
    ///
    /// Fails while the service is registered: its membership is fixed once it is published.
    pub fn add_characteristic(&mut self, characteristic: Characteristic) -> Result<()> {
        if let Some(reg) = &self.registration {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!(
                    "cannot add characteristic {} to service {} registered at {}",
                    characteristic.uuid(),
                    self.uuid,
                    reg.path
                ),
            ));
        }

        self.characteristics.push(characteristic);
        Ok(())
    }

    /// Publishes this [`Service`] on `bus` below `path_prefix`, followed by each of its
    /// characteristics in insertion order.
    ///
    /// Only a failure to publish the service object itself is an error. Characteristics that fail
    /// to register (for example because another service already published them) are logged,
    /// reported in the returned [`ServiceRegistration`], and not listed as part of this service.
    /// The caller decides whether to accept the partial registration or [`Service::unregister`]
    /// it.
    pub async fn register(
        &mut self,
        bus: &Arc<dyn ObjectBus>,
        path_prefix: &str,
    ) -> Result<ServiceRegistration> {
        if let Some(reg) = &self.registration {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("service {} is already registered at {}", self.uuid, reg.path),
            ));
        }

        let path = format!(
            "{}/service{}",
            path_prefix,
            NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed)
        );
        let object = Arc::new(ServiceObject {
            uuid: self.uuid,
            primary: self.primary,
            children: Mutex::new(Vec::new()),
        });
        bus.register_object(&path, object.clone()).await?;
        self.registration = Some(ServiceHandle {
            bus: bus.clone(),
            path: path.clone(),
            object: object.clone(),
        });

        let mut characteristics = Vec::with_capacity(self.characteristics.len());
        for characteristic in &self.characteristics {
            let res = characteristic.register(bus, &path).await;
            match &res {
                Ok(char_path) => {
                    lock(&object.children).push((characteristic.clone(), char_path.clone()));
                }
                Err(e) => log::warn!(
                    "failed to register characteristic {} of service {}: {}",
                    characteristic.uuid(),
                    self.uuid,
                    e
                ),
            }
            characteristics.push((characteristic.uuid(), res));
        }

        log::info!("service {} registered at {}", self.uuid, path);
        Ok(ServiceRegistration {
            path,
            characteristics,
        })
    }

    /// Removes this [`Service`] and the characteristics it registered from the bus.
    ///
    /// The service object is removed first. Characteristics that were registered by someone else
    /// are left alone. Does nothing if the service isn't registered.
    pub async fn unregister(&mut self) {
        let Some(reg) = self.registration.take() else {
            return;
        };

        match reg.bus.unregister_object(&reg.path).await {
            Ok(_) => log::debug!("service {} unregistered from {}", self.uuid, reg.path),
            Err(e) => log::warn!(
                "failed to unregister service {} from {}: {}",
                self.uuid,
                reg.path,
                e
            ),
        }

        let children = mem::take(&mut *lock(&reg.object.children));
        for (characteristic, path) in children {
            characteristic.unregister_at(&path).await;
        }
    }

    /// Returns the currently published objects of this service: the service itself, followed by
    /// the characteristics it registered and their descriptors.
    pub(crate) fn published_objects(&self) -> Vec<(String, Arc<dyn BusObject>)> {
        let Some(reg) = &self.registration else {
            return Vec::new();
        };

        let mut objects = vec![(reg.path.clone(), reg.object.clone() as Arc<dyn BusObject>)];
        objects.extend(
            lock(&reg.object.children)
                .iter()
                .filter(|(characteristic, path)| characteristic.is_registered_at(path))
                .flat_map(|(characteristic, _)| characteristic.published_objects()),
        );
        objects
    }
}

/// The bus-facing side of a [`Service`].
struct ServiceObject {
    uuid: Uuid,
    primary: bool,
    /// The characteristics this service registered, and where.
    children: Mutex<Vec<(Characteristic, String)>>,
}

impl BusObject for ServiceObject {
    fn interface(&self) -> &'static str {
        SERVICE_INTERFACE
    }

    fn properties(&self) -> Properties {
        let paths = lock(&self.children)
            .iter()
            .filter(|(characteristic, path)| characteristic.is_registered_at(path))
            .map(|(_, path)| path.clone())
            .collect();
        Properties::from([
            ("UUID", PropValue::Str(self.uuid.to_string())),
            ("Primary", PropValue::Bool(self.primary)),
            ("Characteristics", PropValue::PathList(paths)),
        ])
    }

    fn call(&self, call: MethodCall) -> std::result::Result<Reply, ReqError> {
        log::warn!("unsupported call {} on service {}", call.name(), self.uuid);
        Err(ReqError::NotSupported)
    }
}
