//! The GATT application root BlueZ enumerates to discover our services.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    bus::{
        AdapterInfo, BusObject, ManagedObjects, ManagerCall, MethodCall, ObjectBus, Properties,
        Reply, OBJECT_MANAGER_INTERFACE,
    },
    config::PeripheralConfig,
    ReqError, Result,
};

/// A registered GATT application.
///
/// BlueZ only publishes a local GATT database once an `org.freedesktop.DBus.ObjectManager`
/// listing it has been passed to `org.bluez.GattManager1.RegisterApplication`.
#[derive(Default)]
pub(crate) struct Application {
    active: Option<ActiveApplication>,
}

struct ActiveApplication {
    bus: Arc<dyn ObjectBus>,
    adapter: String,
    path: String,
}

impl Application {
    pub(crate) fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Publishes the application root at [`PeripheralConfig::path_prefix`], listing `objects`,
    /// and registers it with the manager of `adapter`.
    ///
    /// If the manager rejects it, the root object is removed again and the error is returned.
    pub(crate) async fn start(
        &mut self,
        bus: &Arc<dyn ObjectBus>,
        adapter: &AdapterInfo,
        config: &PeripheralConfig,
        objects: Vec<(String, Arc<dyn BusObject>)>,
    ) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }

        let path = config.path_prefix.clone();
        let count = objects.len();
        bus.register_object(&path, Arc::new(ApplicationObject { objects }))
            .await?;

        let call = ManagerCall::RegisterApplication { path: path.clone() };
        if let Err(e) = bus
            .call_method(&adapter.path, call, Some(config.register_timeout))
            .await
        {
            if let Err(e) = bus.unregister_object(&path).await {
                log::warn!("failed to remove application root {}: {}", path, e);
            }
            return Err(e);
        }

        log::info!(
            "GATT application with {} objects registered at {}",
            count,
            path
        );
        self.active = Some(ActiveApplication {
            bus: bus.clone(),
            adapter: adapter.path.clone(),
            path,
        });
        Ok(())
    }

    /// Unregisters the application from the manager and removes the root object.
    ///
    /// Failures are logged. Does nothing if the application isn't registered.
    pub(crate) async fn stop(&mut self, config: &PeripheralConfig) {
        let Some(active) = self.active.take() else {
            return;
        };

        let call = ManagerCall::UnregisterApplication {
            path: active.path.clone(),
        };
        match active
            .bus
            .call_method(&active.adapter, call, Some(config.unregister_timeout))
            .await
        {
            Ok(()) => log::debug!("GATT application unregistered"),
            Err(e) => log::warn!("failed to unregister GATT application: {}", e),
        }

        if let Err(e) = active.bus.unregister_object(&active.path).await {
            log::warn!("failed to remove application root {}: {}", active.path, e);
        }
    }
}

/// `org.freedesktop.DBus.ObjectManager` over the published GATT objects.
struct ApplicationObject {
    objects: Vec<(String, Arc<dyn BusObject>)>,
}

impl ApplicationObject {
    fn managed_objects(&self) -> ManagedObjects {
        self.objects
            .iter()
            .map(|(path, object)| {
                let interfaces = BTreeMap::from([(object.interface(), object.properties())]);
                (path.clone(), interfaces)
            })
            .collect()
    }
}

impl BusObject for ApplicationObject {
    fn interface(&self) -> &'static str {
        OBJECT_MANAGER_INTERFACE
    }

    fn properties(&self) -> Properties {
        Properties::new()
    }

    fn call(&self, call: MethodCall) -> std::result::Result<Reply, ReqError> {
        match call {
            MethodCall::GetManagedObjects => Ok(Reply::ManagedObjects(self.managed_objects())),
            other => {
                log::warn!("unsupported call {} on application root", other.name());
                Err(ReqError::NotSupported)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pollster::block_on;

    use super::*;
    use crate::{
        bus::{PropValue, CHARACTERISTIC_INTERFACE, DESCRIPTOR_INTERFACE, SERVICE_INTERFACE},
        gatt::{Characteristic, CharacteristicFlags, Descriptor, DescriptorFlags, Service},
        memory::MemoryBus,
        uuid::Uuid,
        ErrorKind,
    };

    fn setup() -> (MemoryBus, Arc<dyn ObjectBus>, AdapterInfo, Service) {
        let bus = MemoryBus::new();
        let handle: Arc<dyn ObjectBus> = Arc::new(bus.clone());
        let adapter = block_on(handle.adapter(None)).unwrap();

        let description = Descriptor::new(Uuid::from_u16(0x2901), DescriptorFlags::READ);
        description.set_value(*b"Device Name");
        let characteristic = Characteristic::new(Uuid::from_u16(0x2A00), CharacteristicFlags::READ);
        characteristic.add_descriptor(description).unwrap();

        let mut service = Service::new(Uuid::from_u16(0x180A), true);
        service.add_characteristic(characteristic).unwrap();
        block_on(service.register(&handle, "/org/bluez/blues")).unwrap();
        (bus, handle, adapter, service)
    }

    #[test]
    fn managed_objects() {
        let (bus, handle, adapter, service) = setup();
        let config = PeripheralConfig::default();

        let mut app = Application::default();
        block_on(app.start(&handle, &adapter, &config, service.published_objects())).unwrap();
        assert!(app.is_active());
        assert_eq!(bus.applications(), ["/org/bluez/blues"]);

        let Reply::ManagedObjects(objects) = bus
            .call("/org/bluez/blues", MethodCall::GetManagedObjects)
            .unwrap()
        else {
            panic!("unexpected reply");
        };
        assert_eq!(objects.len(), 3);

        let service_path = service.object_path().unwrap();
        let service_props = &objects[service_path][SERVICE_INTERFACE];
        assert_eq!(service_props["Primary"], PropValue::Bool(true));

        let char_path = service.characteristics()[0].object_path().unwrap();
        let char_props = &objects[&char_path][CHARACTERISTIC_INTERFACE];
        assert_eq!(
            char_props["Service"],
            PropValue::Path(service_path.to_string())
        );

        let characteristic = &service.characteristics()[0];
        let desc_path = characteristic.descriptors()[0].object_path().unwrap();
        assert_eq!(
            char_props["Descriptors"],
            PropValue::PathList(vec![desc_path.clone()])
        );
        let desc_props = &objects[&desc_path][DESCRIPTOR_INTERFACE];
        assert_eq!(desc_props["Characteristic"], PropValue::Path(char_path));
        assert_eq!(desc_props["Value"], PropValue::Bytes(b"Device Name".to_vec()));

        block_on(app.stop(&config));
        assert!(!app.is_active());
        assert!(bus.applications().is_empty());
        assert!(!bus.object_paths().contains(&"/org/bluez/blues".to_string()));
    }

    #[test]
    fn rejected_registration() {
        let (bus, handle, adapter, service) = setup();
        bus.fail_method("RegisterApplication");

        let mut app = Application::default();
        let err = block_on(app.start(
            &handle,
            &adapter,
            &PeripheralConfig::default(),
            service.published_objects(),
        ))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManagerRpc);
        assert!(!app.is_active());
        assert_eq!(bus.object_paths().len(), 3);
    }
}
