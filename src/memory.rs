//! An in-process [`ObjectBus`] with a simulated Bluetooth manager.
//!
//! [`MemoryBus`] plays both sides of the bus: it hosts published objects like a D-Bus connection
//! would, answers [`ManagerCall`]s the way BlueZ does, and acts as a remote client issuing
//! method calls against the published objects. Failures and hangs of individual manager methods
//! can be injected.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Poll, Waker},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{future::pending, stream, StreamExt};
use zbus::zvariant::ObjectPath;

use crate::{
    address::Address,
    bus::{
        with_timeout, AdapterInfo, BusObject, ConnectionEvents, ManagerCall, MethodCall,
        ObjectBus, PropValue, Reply, RequestOptions, ADVERTISEMENT_INTERFACE,
        OBJECT_MANAGER_INTERFACE,
    },
    device::ConnectionEvent,
    Error, ErrorKind, Result,
};

/// A `PropertiesChanged` signal recorded by a [`MemoryBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub path: String,
    pub interface: &'static str,
    pub name: &'static str,
    pub value: PropValue,
}

/// An in-process object bus.
///
/// Clones share the same objects and manager state, so tests can hand one clone to the code
/// under test (as an `Arc<dyn ObjectBus>`) and inspect the bus through another.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Arc<dyn BusObject>>,
    changes: Vec<PropertyChange>,
    calls: Vec<ManagerCall>,
    failing: HashSet<&'static str>,
    hanging: HashSet<&'static str>,
    adapters: Vec<AdapterInfo>,
    powered: BTreeSet<String>,
    advertisements: BTreeSet<String>,
    applications: BTreeSet<String>,
    events: VecDeque<ConnectionEvent>,
    event_waker: Option<Waker>,
}

enum Outcome {
    Done(Result<()>),
    Hang,
    Validate(Arc<dyn BusObject>),
}

impl MemoryBus {
    /// Creates a bus whose manager knows a single, unpowered adapter `hci0`.
    pub fn new() -> Self {
        let bus = Self::without_adapters();
        bus.add_adapter(AdapterInfo {
            name: "hci0".into(),
            path: "/org/bluez/hci0".into(),
            address: Some(Address::from([0xdc, 0xa6, 0x32, 0x00, 0x00, 0x01])),
        });
        bus
    }

    /// Creates a bus whose manager knows no adapters at all.
    pub fn without_adapters() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes another adapter known to the manager.
    pub fn add_adapter(&self, adapter: AdapterInfo) {
        self.state().adapters.push(adapter);
    }

    /// Makes every future manager call named `method` fail with an error reply.
    pub fn fail_method(&self, method: &'static str) {
        self.state().failing.insert(method);
    }

    /// Makes every future manager call named `method` never reply.
    pub fn hang_method(&self, method: &'static str) {
        self.state().hanging.insert(method);
    }

    /// Reports a remote device connecting or disconnecting.
    pub fn push_connection_event(&self, event: ConnectionEvent) {
        let mut state = self.state();
        state.events.push_back(event);
        if let Some(waker) = state.event_waker.take() {
            waker.wake();
        }
    }

    /// Calls a method on the object at `path`, as a remote client would.
    pub fn call(&self, path: &str, call: MethodCall) -> Result<Reply> {
        let object = self.object(path)?;
        object.call(call).map_err(Error::from)
    }

    /// Issues `ReadValue` on the characteristic at `path`.
    pub fn read_value(&self, path: &str) -> Result<Vec<u8>> {
        let options = RequestOptions::default();
        match self.call(path, MethodCall::ReadValue { options })? {
            Reply::Bytes(value) => Ok(value),
            reply => Err(Error::from(format!(
                "unexpected reply to ReadValue: {:?}",
                reply
            ))),
        }
    }

    /// Issues `WriteValue` on the characteristic at `path`.
    pub fn write_value(&self, path: &str, value: &[u8]) -> Result<()> {
        let call = MethodCall::WriteValue {
            value: value.to_vec(),
            options: RequestOptions::default(),
        };
        self.call(path, call).map(drop)
    }

    /// Reads the property `name` of the object at `path`.
    pub fn property(&self, path: &str, name: &str) -> Result<PropValue> {
        self.object(path)?
            .property(name)
            .ok_or_else(|| Error::from(format!("{} has no property {}", path, name)))
    }

    /// Returns the interface implemented by the object at `path`, if there is one.
    pub fn interface_at(&self, path: &str) -> Option<&'static str> {
        self.state().objects.get(path).map(|obj| obj.interface())
    }

    /// Returns the paths of all published objects, in order.
    pub fn object_paths(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    /// Returns all `PropertiesChanged` signals emitted so far.
    pub fn property_changes(&self) -> Vec<PropertyChange> {
        self.state().changes.clone()
    }

    /// Returns all calls made into the manager so far, including failed ones.
    pub fn manager_calls(&self) -> Vec<ManagerCall> {
        self.state().calls.clone()
    }

    /// Returns the paths of the advertisements the manager currently has registered.
    pub fn advertisements(&self) -> Vec<String> {
        self.state().advertisements.iter().cloned().collect()
    }

    /// Returns the paths of the GATT applications the manager currently has registered.
    pub fn applications(&self) -> Vec<String> {
        self.state().applications.iter().cloned().collect()
    }

    /// Returns whether the adapter at `adapter_path` was powered on.
    pub fn is_powered(&self, adapter_path: &str) -> bool {
        self.state().powered.contains(adapter_path)
    }

    fn object(&self, path: &str) -> Result<Arc<dyn BusObject>> {
        self.state()
            .objects
            .get(path)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::Transport, format!("no object at {}", path)))
    }

    /// Decides how the manager answers `call`, without blocking.
    fn dispatch(&self, adapter: &str, call: &ManagerCall) -> Outcome {
        let mut state = self.state();
        state.calls.push(call.clone());

        if !state.adapters.iter().any(|a| a.path == adapter) {
            return Outcome::Done(Err(Error::new(
                ErrorKind::Transport,
                format!("no adapter at {}", adapter),
            )));
        }
        if state.hanging.contains(call.name()) {
            return Outcome::Hang;
        }
        if state.failing.contains(call.name()) {
            return Outcome::Done(Err(rejected("Failed", call.name())));
        }

        match call {
            ManagerCall::PowerOn => {
                state.powered.insert(adapter.to_string());
                Outcome::Done(Ok(()))
            }
            ManagerCall::RegisterAdvertisement { path } => {
                match state.objects.get(path) {
                    Some(obj) if obj.interface() == ADVERTISEMENT_INTERFACE => {}
                    _ => return Outcome::Done(Err(rejected("InvalidArguments", path))),
                }
                if !state.advertisements.insert(path.clone()) {
                    return Outcome::Done(Err(rejected("AlreadyExists", path)));
                }
                Outcome::Done(Ok(()))
            }
            ManagerCall::RegisterApplication { path } => {
                let object = match state.objects.get(path) {
                    Some(obj) if obj.interface() == OBJECT_MANAGER_INTERFACE => obj.clone(),
                    _ => return Outcome::Done(Err(rejected("InvalidArguments", path))),
                };
                if state.applications.contains(path) {
                    return Outcome::Done(Err(rejected("AlreadyExists", path)));
                }
                Outcome::Validate(object)
            }
            ManagerCall::UnregisterAdvertisement { path } => {
                if !state.advertisements.remove(path) {
                    return Outcome::Done(Err(rejected("DoesNotExist", path)));
                }
                Outcome::Done(Ok(()))
            }
            ManagerCall::UnregisterApplication { path } => {
                if !state.applications.remove(path) {
                    return Outcome::Done(Err(rejected("DoesNotExist", path)));
                }
                Outcome::Done(Ok(()))
            }
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

fn rejected(error: &str, subject: &str) -> Error {
    Error::new(
        ErrorKind::ManagerRpc,
        format!("org.bluez.Error.{}: {}", error, subject),
    )
}

#[async_trait]
impl ObjectBus for MemoryBus {
    async fn register_object(&self, path: &str, object: Arc<dyn BusObject>) -> Result<()> {
        ObjectPath::try_from(path).map_err(|e| {
            Error::new(
                ErrorKind::Transport,
                format!("invalid object path {}: {}", path, e),
            )
        })?;

        let mut state = self.state();
        if state.objects.contains_key(path) {
            return Err(Error::new(
                ErrorKind::Transport,
                format!("object path {} is already in use", path),
            ));
        }
        state.objects.insert(path.to_string(), object);
        Ok(())
    }

    async fn unregister_object(&self, path: &str) -> Result<bool> {
        Ok(self.state().objects.remove(path).is_some())
    }

    async fn call_method(
        &self,
        adapter: &str,
        call: ManagerCall,
        timeout: Option<Duration>,
    ) -> Result<()> {
        match self.dispatch(adapter, &call) {
            Outcome::Done(res) => res,
            Outcome::Hang => with_timeout(pending::<Result<()>>(), timeout, call.name()).await,
            Outcome::Validate(object) => {
                // BlueZ walks the application's object tree before accepting it.
                match object.call(MethodCall::GetManagedObjects) {
                    Ok(Reply::ManagedObjects(_)) => {}
                    _ => return Err(rejected("Failed", call.name())),
                }
                if let ManagerCall::RegisterApplication { path } = call {
                    self.state().applications.insert(path);
                }
                Ok(())
            }
        }
    }

    async fn emit_property_changed(
        &self,
        path: &str,
        interface: &'static str,
        name: &'static str,
        value: PropValue,
    ) -> Result<()> {
        let mut state = self.state();
        if !state.objects.contains_key(path) {
            return Err(Error::new(
                ErrorKind::Transport,
                format!("no object at {}", path),
            ));
        }
        state.changes.push(PropertyChange {
            path: path.to_string(),
            interface,
            name,
            value,
        });
        Ok(())
    }

    async fn adapter(&self, name: Option<&str>) -> Result<AdapterInfo> {
        let state = self.state();
        let adapter = match name {
            Some(name) => state.adapters.iter().find(|a| a.name == name),
            None => state.adapters.first(),
        };
        adapter.cloned().ok_or_else(|| match name {
            Some(name) => Error::from(format!("Bluetooth adapter {} not found", name)),
            None => Error::from("no Bluetooth adapter found"),
        })
    }

    async fn connection_events(&self, adapter: &str) -> Result<ConnectionEvents> {
        let state = self.state.clone();
        let prefix = format!("{}/", adapter);
        let events = stream::poll_fn(move |cx| {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.events.pop_front() {
                Some(event) => Poll::Ready(Some(event)),
                None => {
                    state.event_waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .filter(move |event| std::future::ready(event.path.starts_with(&prefix)));
        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use pollster::block_on;

    use super::*;
    use crate::bus::{Properties, CHARACTERISTIC_INTERFACE};

    struct Fixed;

    impl BusObject for Fixed {
        fn interface(&self) -> &'static str {
            CHARACTERISTIC_INTERFACE
        }

        fn properties(&self) -> Properties {
            Properties::from([("Value", PropValue::Bytes(vec![1, 2]))])
        }

        fn call(&self, _: MethodCall) -> std::result::Result<Reply, crate::ReqError> {
            Ok(Reply::Bytes(vec![1, 2]))
        }
    }

    #[test]
    fn object_registry() {
        let bus = MemoryBus::new();
        block_on(bus.register_object("/a/b", Arc::new(Fixed))).unwrap();
        let err = block_on(bus.register_object("/a/b", Arc::new(Fixed))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        let err = block_on(bus.register_object("a/b/", Arc::new(Fixed))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        assert_eq!(bus.object_paths(), ["/a/b"]);
        assert_eq!(bus.read_value("/a/b").unwrap(), [1, 2]);
        assert_eq!(
            bus.property("/a/b", "Value").unwrap(),
            PropValue::Bytes(vec![1, 2])
        );
        bus.property("/a/b", "Flags").unwrap_err();

        assert!(block_on(bus.unregister_object("/a/b")).unwrap());
        assert!(!block_on(bus.unregister_object("/a/b")).unwrap());
        assert_eq!(
            bus.read_value("/a/b").unwrap_err().kind(),
            ErrorKind::Transport
        );
    }

    #[test]
    fn manager_validates_objects() {
        let bus = MemoryBus::new();
        block_on(bus.register_object("/adv", Arc::new(Fixed))).unwrap();

        let call = ManagerCall::RegisterAdvertisement {
            path: "/adv".into(),
        };
        let err = block_on(bus.call_method("/org/bluez/hci0", call.clone(), None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManagerRpc);
        assert!(err.to_string().contains("InvalidArguments"));

        let err = block_on(bus.call_method("/org/bluez/hci9", call.clone(), None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(bus.manager_calls(), [call.clone(), call]);
    }

    #[test]
    fn injected_failures() {
        let bus = MemoryBus::new();
        bus.fail_method("PowerOn");
        let err = block_on(bus.call_method("/org/bluez/hci0", ManagerCall::PowerOn, None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManagerRpc);
        assert!(!bus.is_powered("/org/bluez/hci0"));

        bus.hang_method("UnregisterApplication");
        let call = ManagerCall::UnregisterApplication { path: "/x".into() };
        let err = block_on(bus.call_method(
            "/org/bluez/hci0",
            call,
            Some(Duration::from_millis(10)),
        ))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn adapters() {
        let bus = MemoryBus::new();
        assert_eq!(block_on(bus.adapter(None)).unwrap().name, "hci0");
        assert_eq!(
            block_on(bus.adapter(Some("hci1"))).unwrap_err().kind(),
            ErrorKind::Other
        );

        let bus = MemoryBus::without_adapters();
        block_on(bus.adapter(None)).unwrap_err();
    }

    #[test]
    fn connection_events_filtered_by_adapter() {
        let bus = MemoryBus::new();
        let mut events = block_on(bus.connection_events("/org/bluez/hci0")).unwrap();
        bus.push_connection_event(ConnectionEvent::new("/org/bluez/hci1/dev_01_02_03_04_05_06", true));
        bus.push_connection_event(ConnectionEvent::new("/org/bluez/hci0/dev_01_02_03_04_05_06", true));

        let event = block_on(events.next()).unwrap();
        assert_eq!(event.address, Some(Address::from([1, 2, 3, 4, 5, 6])));
        assert!(event.path.starts_with("/org/bluez/hci0/"));
    }
}
