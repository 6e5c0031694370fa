//! Calls into the BlueZ manager on behalf of an adapter.

use std::collections::HashMap;

use zbus::{
    zvariant::{ObjectPath, Value},
    Connection,
};

use crate::{
    bus::{AdapterInfo, ManagerCall},
    Error, ErrorKind, Result, Session,
};

mod private {
    use std::collections::HashMap;

    use zbus::{
        dbus_proxy,
        zvariant::{ObjectPath, Value},
    };

    #[dbus_proxy(
        interface = "org.bluez.Adapter1",
        default_service = "org.bluez",
        assume_defaults = false
    )]
    trait Adapter {
        #[dbus_proxy(property)]
        fn powered(&self) -> zbus::Result<bool>;

        #[dbus_proxy(property)]
        fn set_powered(&self, value: bool) -> zbus::Result<()>;
    }

    #[dbus_proxy(
        interface = "org.bluez.LEAdvertisingManager1",
        default_service = "org.bluez",
        assume_defaults = false
    )]
    trait LeAdvertisingManager {
        fn register_advertisement(
            &self,
            advertisement: &ObjectPath<'_>,
            options: HashMap<&str, Value<'_>>,
        ) -> zbus::Result<()>;

        fn unregister_advertisement(&self, advertisement: &ObjectPath<'_>) -> zbus::Result<()>;
    }

    #[dbus_proxy(
        interface = "org.bluez.GattManager1",
        default_service = "org.bluez",
        assume_defaults = false
    )]
    trait GattManager {
        fn register_application(
            &self,
            application: &ObjectPath<'_>,
            options: HashMap<&str, Value<'_>>,
        ) -> zbus::Result<()>;

        fn unregister_application(&self, application: &ObjectPath<'_>) -> zbus::Result<()>;
    }
}

use self::private::{AdapterProxy, GattManagerProxy, LeAdvertisingManagerProxy};

const PATH_PREFIX: &str = "/org/bluez/";
const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
const ADVERTISING_MANAGER_INTERFACE: &str = "org.bluez.LEAdvertisingManager1";

/// Finds the adapter called `name`, or the first adapter that supports LE advertising.
pub(crate) async fn find(session: &Session, name: Option<&str>) -> Result<AdapterInfo> {
    log::debug!(
        "enumerating BlueZ adapters on connection {}",
        session.conn.server_guid()
    );

    let manager = session.object_manager().await?;
    let objects = manager.get_managed_objects().await.map_err(Error::from)?;
    let mut adapters = Vec::new();
    for (obj_path, intfs) in &objects {
        let Some(props) = intfs.get(ADAPTER_INTERFACE) else {
            continue;
        };
        let Some(hci) = obj_path.strip_prefix(PATH_PREFIX) else {
            log::warn!("skipping adapter with unexpected path {}", obj_path);
            continue;
        };
        if !intfs.contains_key(ADVERTISING_MANAGER_INTERFACE) {
            log::debug!("skipping adapter {} without LE advertising support", hci);
            continue;
        }

        let address = match props.get("Address").map(|v| &**v) {
            Some(Value::Str(s)) => s.as_str().parse().ok(),
            _ => None,
        };
        log::debug!("found BlueZ adapter at path {}", obj_path);
        adapters.push(AdapterInfo {
            name: hci.to_string(),
            path: obj_path.to_string(),
            address,
        });
    }
    adapters.sort_by(|a, b| a.name.cmp(&b.name));

    let adapter = match name {
        Some(name) => adapters.into_iter().find(|a| a.name == name),
        None => adapters.into_iter().next(),
    };
    adapter.ok_or_else(|| match name {
        Some(name) => Error::from(format!("Bluetooth adapter {} not found", name)),
        None => Error::from("no adapter found"),
    })
}

/// Performs `call` against the manager objects of the adapter at `adapter`.
pub(crate) async fn call(conn: &Connection, adapter: &str, call: ManagerCall) -> Result<()> {
    match call {
        ManagerCall::RegisterAdvertisement { path } => {
            let manager = LeAdvertisingManagerProxy::builder(conn)
                .path(adapter)
                .map_err(Error::from)?
                .build()
                .await
                .map_err(Error::from)?;
            manager
                .register_advertisement(&object_path(&path)?, HashMap::new())
                .await
                .map_err(Error::manager)
        }
        ManagerCall::UnregisterAdvertisement { path } => {
            let manager = LeAdvertisingManagerProxy::builder(conn)
                .path(adapter)
                .map_err(Error::from)?
                .build()
                .await
                .map_err(Error::from)?;
            manager
                .unregister_advertisement(&object_path(&path)?)
                .await
                .map_err(Error::manager)
        }
        ManagerCall::RegisterApplication { path } => {
            let manager = GattManagerProxy::builder(conn)
                .path(adapter)
                .map_err(Error::from)?
                .build()
                .await
                .map_err(Error::from)?;
            manager
                .register_application(&object_path(&path)?, HashMap::new())
                .await
                .map_err(Error::manager)
        }
        ManagerCall::UnregisterApplication { path } => {
            let manager = GattManagerProxy::builder(conn)
                .path(adapter)
                .map_err(Error::from)?
                .build()
                .await
                .map_err(Error::from)?;
            manager
                .unregister_application(&object_path(&path)?)
                .await
                .map_err(Error::manager)
        }
        ManagerCall::PowerOn => {
            let proxy = AdapterProxy::builder(conn)
                .path(adapter)
                .map_err(Error::from)?
                .build()
                .await
                .map_err(Error::from)?;
            if proxy.powered().await.map_err(Error::manager)? {
                log::debug!("{} is already powered", adapter);
                return Ok(());
            }
            proxy.set_powered(true).await.map_err(Error::manager)
        }
    }
}

fn object_path(path: &str) -> Result<ObjectPath<'_>> {
    ObjectPath::try_from(path).map_err(|e| {
        Error::new(
            ErrorKind::Transport,
            format!("invalid object path {}: {}", path, e),
        )
    })
}
