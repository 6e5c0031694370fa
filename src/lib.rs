//! A BLE GATT peripheral on top of BlueZ.
//!
//! Build [`gatt::Service`]s out of [`gatt::Characteristic`]s, add them to a [`Peripheral`], and
//! [`Peripheral::run`] it on a [`Session`]. The peripheral publishes the services, registers them
//! with BlueZ as a GATT application, and advertises them until it is shut down.

mod adapter;
pub mod address;
pub mod advertisement;
mod application;
pub mod bus;
pub mod config;
pub mod device;
mod error;
pub mod gatt;
mod interface;
pub mod memory;
mod peripheral;
pub mod uuid;

pub use config::PeripheralConfig;
pub use error::{Error, ErrorKind, ReqError, Result};
pub use peripheral::{Peripheral, StartReport, State};

use std::{
    collections::HashMap,
    future::ready,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use zbus::{
    fdo::{ObjectManagerProxy, Properties},
    names::InterfaceName,
    zvariant::ObjectPath,
    Connection, MessageStream, SignalContext,
};

use crate::bus::{
    with_timeout, AdapterInfo, BusObject, ConnectionEvents, ManagerCall, ObjectBus, PropValue,
};

/// A cloneable handle to a D-Bus connection.
///
/// This is the production [`ObjectBus`]: objects registered through it are served on the system
/// bus, and manager calls go to BlueZ.
#[derive(Clone)]
pub struct Session {
    conn: Connection,
    /// Object path → interface served there.
    registry: Arc<Mutex<HashMap<String, &'static str>>>,
}

impl Session {
    /// Creates a new D-Bus connection.
    pub async fn new() -> Result<Self> {
        Ok(Self {
            conn: Connection::system().await.map_err(Error::from)?,
            registry: Arc::default(),
        })
    }

    /// Connects to the BlueZ D-Bus object manager.
    async fn object_manager(&self) -> Result<ObjectManagerProxy<'static>> {
        Ok(ObjectManagerProxy::builder(&self.conn)
            .destination("org.bluez")
            .map_err(Error::from)?
            .path("/")
            .map_err(Error::from)?
            .build()
            .await
            .map_err(Error::from)?)
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, &'static str>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn path_in_use(path: &str) -> Error {
    Error::new(
        ErrorKind::Transport,
        format!("object path {} is already in use", path),
    )
}

#[async_trait]
impl ObjectBus for Session {
    async fn register_object(&self, path: &str, object: Arc<dyn BusObject>) -> Result<()> {
        ObjectPath::try_from(path).map_err(|e| {
            Error::new(
                ErrorKind::Transport,
                format!("invalid object path {}: {}", path, e),
            )
        })?;

        let interface = object.interface();
        {
            let mut registry = self.registry();
            if registry.contains_key(path) {
                return Err(path_in_use(path));
            }
            registry.insert(path.to_string(), interface);
        }

        match interface::serve(&self.conn.object_server(), path, object).await {
            Ok(true) => {
                log::trace!("serving {} at {}", interface, path);
                Ok(())
            }
            Ok(false) => {
                self.registry().remove(path);
                Err(path_in_use(path))
            }
            Err(e) => {
                self.registry().remove(path);
                Err(Error::from(e))
            }
        }
    }

    async fn unregister_object(&self, path: &str) -> Result<bool> {
        let Some(interface) = self.registry().remove(path) else {
            return Ok(false);
        };

        interface::unserve(&self.conn.object_server(), path, interface)
            .await
            .map_err(Error::from)
    }

    async fn call_method(
        &self,
        adapter: &str,
        call: ManagerCall,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let name = call.name();
        log::debug!("calling {} on {}", name, adapter);
        with_timeout(adapter::call(&self.conn, adapter, call), timeout, name).await
    }

    async fn emit_property_changed(
        &self,
        path: &str,
        interface: &'static str,
        name: &'static str,
        value: PropValue,
    ) -> Result<()> {
        let ctxt = SignalContext::new(&self.conn, path).map_err(Error::from)?;
        let value = interface::to_value(value).map_err(Error::from)?;
        let changed = HashMap::from([(name, &*value)]);
        Properties::properties_changed(
            &ctxt,
            InterfaceName::from_static_str_unchecked(interface),
            &changed,
            &[],
        )
        .await
        .map_err(Error::from)
    }

    async fn adapter(&self, name: Option<&str>) -> Result<AdapterInfo> {
        adapter::find(self, name).await
    }

    async fn connection_events(&self, adapter: &str) -> Result<ConnectionEvents> {
        let rule = device::connection_rule(adapter)?;
        let changed = MessageStream::for_match_rule(rule, &self.conn, None)
            .await
            .map_err(Error::from)?;
        let rule = device::interfaces_added_rule()?;
        let added = MessageStream::for_match_rule(rule, &self.conn, None)
            .await
            .map_err(Error::from)?;

        let adapter = adapter.to_string();
        Ok(stream::select(changed, added)
            .filter_map(move |message| ready(device::connection_event(message, &adapter)))
            .boxed())
    }
}
