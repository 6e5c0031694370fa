//! The LE advertisement making the peripheral discoverable.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    bus::{
        AdapterInfo, BusObject, ManagerCall, MethodCall, ObjectBus, PropValue, Properties, Reply,
        ADVERTISEMENT_INTERFACE,
    },
    config::PeripheralConfig,
    uuid::Uuid,
    ReqError, Result,
};

/// LE General Discoverable Mode, BR/EDR not supported.
const ADVERTISING_FLAGS: u8 = 0x06;

/// The data advertised by a peripheral.
///
/// All mutators only take effect on the next [`Advertisement::start`].
#[derive(Debug, Default)]
pub struct Advertisement {
    data: AdvertisementData,
    active: Option<ActiveAdvertisement>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct AdvertisementData {
    local_name: String,
    service_uuids: Vec<Uuid>,
    manufacturer_data: Option<(u16, Vec<u8>)>,
    service_data: Vec<(Uuid, Vec<u8>)>,
    include_tx_power: bool,
}

struct ActiveAdvertisement {
    bus: Arc<dyn ObjectBus>,
    adapter: String,
    path: String,
}

impl std::fmt::Debug for ActiveAdvertisement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveAdvertisement")
            .field("adapter", &self.adapter)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Advertisement {
    /// Creates an inactive advertisement broadcasting `local_name`.
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            data: AdvertisementData {
                local_name: local_name.into(),
                ..Default::default()
            },
            active: None,
        }
    }

    /// Returns the object path an advertisement is published at, below `path_prefix`.
    pub fn object_path(path_prefix: &str) -> String {
        format!("{}/advertisement0", path_prefix)
    }

    pub fn local_name(&self) -> &str {
        &self.data.local_name
    }

    pub fn service_uuids(&self) -> &[Uuid] {
        &self.data.service_uuids
    }

    /// Returns `true` between a successful [`Advertisement::start`] and the following
    /// [`Advertisement::stop`].
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn set_local_name(&mut self, name: impl Into<String>) {
        self.data.local_name = name.into();
    }

    /// Appends a service UUID to advertise.
    ///
    /// UUIDs are advertised in insertion order, duplicates included.
    pub fn add_service_uuid(&mut self, uuid: Uuid) {
        self.data.service_uuids.push(uuid);
    }

    /// Sets the manufacturer-specific data, replacing any previous one.
    pub fn set_manufacturer_data(&mut self, company_id: u16, data: impl Into<Vec<u8>>) {
        self.data.manufacturer_data = Some((company_id, data.into()));
    }

    /// Adds service data for `uuid`, replacing previous data for the same UUID.
    pub fn add_service_data(&mut self, uuid: Uuid, data: impl Into<Vec<u8>>) {
        let data = data.into();
        match self.data.service_data.iter_mut().find(|(u, _)| *u == uuid) {
            Some(entry) => entry.1 = data,
            None => self.data.service_data.push((uuid, data)),
        }
    }

    /// Asks the controller to include its TX power level in the advertisement.
    pub fn set_include_tx_power(&mut self, include: bool) {
        self.data.include_tx_power = include;
    }

    /// Publishes the advertisement object and registers it with the manager of `adapter`.
    ///
    /// Does nothing if the advertisement is already active. If the manager rejects the
    /// advertisement (or doesn't answer within [`PeripheralConfig::register_timeout`]), the
    /// published object is removed again and the error is returned.
    pub async fn start(
        &mut self,
        bus: &Arc<dyn ObjectBus>,
        adapter: &AdapterInfo,
        config: &PeripheralConfig,
    ) -> Result<()> {
        if self.active.is_some() {
            log::debug!("advertisement is already active");
            return Ok(());
        }

        let path = Self::object_path(&config.path_prefix);
        let object = Arc::new(AdvertisementObject {
            data: self.data.clone(),
        });
        bus.register_object(&path, object).await?;
        log::debug!("advertisement object registered at {}", path);

        let call = ManagerCall::RegisterAdvertisement { path: path.clone() };
        if let Err(e) = bus
            .call_method(&adapter.path, call, Some(config.register_timeout))
            .await
        {
            if let Err(e) = bus.unregister_object(&path).await {
                log::warn!("failed to remove advertisement object {}: {}", path, e);
            }
            return Err(e);
        }

        log::info!(
            "advertising \"{}\" on {} ({} service UUIDs)",
            self.data.local_name,
            adapter,
            self.data.service_uuids.len()
        );
        self.active = Some(ActiveAdvertisement {
            bus: bus.clone(),
            adapter: adapter.path.clone(),
            path,
        });
        Ok(())
    }

    /// Unregisters the advertisement from the manager and removes its object.
    ///
    /// Does nothing if the advertisement is not active. Manager failures (including running into
    /// [`PeripheralConfig::unregister_timeout`]) are logged, the object is removed regardless.
    pub async fn stop(&mut self, config: &PeripheralConfig) {
        let Some(active) = self.active.take() else {
            return;
        };

        let call = ManagerCall::UnregisterAdvertisement {
            path: active.path.clone(),
        };
        match active
            .bus
            .call_method(&active.adapter, call, Some(config.unregister_timeout))
            .await
        {
            Ok(()) => log::info!("advertising stopped"),
            Err(e) => log::warn!("failed to unregister advertisement: {}", e),
        }

        if let Err(e) = active.bus.unregister_object(&active.path).await {
            log::warn!(
                "failed to remove advertisement object {}: {}",
                active.path,
                e
            );
        }
    }
}

/// The bus-facing side of an [`Advertisement`], holding a snapshot of its data.
struct AdvertisementObject {
    data: AdvertisementData,
}

impl BusObject for AdvertisementObject {
    fn interface(&self) -> &'static str {
        ADVERTISEMENT_INTERFACE
    }

    fn properties(&self) -> Properties {
        let data = &self.data;

        let mut includes = vec!["local-name".to_string()];
        if data.include_tx_power {
            includes.push("tx-power".to_string());
        }
        let manufacturer_data = data
            .manufacturer_data
            .iter()
            .map(|(id, bytes)| (*id, bytes.clone()))
            .collect::<BTreeMap<_, _>>();

        let mut props = Properties::from([
            ("Type", PropValue::Str("peripheral".into())),
            (
                "ServiceUUIDs",
                PropValue::StrList(data.service_uuids.iter().map(Uuid::to_string).collect()),
            ),
            ("LocalName", PropValue::Str(data.local_name.clone())),
            ("ManufacturerData", PropValue::BytesByU16(manufacturer_data)),
            ("Includes", PropValue::StrList(includes)),
            ("Appearance", PropValue::U16(0)),
            ("Flags", PropValue::Bytes(vec![ADVERTISING_FLAGS])),
        ]);
        if !data.service_data.is_empty() {
            let service_data = data
                .service_data
                .iter()
                .map(|(uuid, bytes)| (uuid.to_string(), bytes.clone()))
                .collect();
            props.insert("ServiceData", PropValue::BytesByStr(service_data));
        }
        props
    }

    fn call(&self, call: MethodCall) -> std::result::Result<Reply, ReqError> {
        match call {
            MethodCall::Release => {
                log::info!("advertisement released by the Bluetooth manager");
                Ok(Reply::Empty)
            }
            other => {
                log::warn!("unsupported call {} on advertisement", other.name());
                Err(ReqError::NotSupported)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pollster::block_on;

    use super::*;
    use crate::{memory::MemoryBus, ErrorKind};

    fn setup() -> (MemoryBus, Arc<dyn ObjectBus>, AdapterInfo, PeripheralConfig) {
        let bus = MemoryBus::new();
        let handle: Arc<dyn ObjectBus> = Arc::new(bus.clone());
        let adapter = block_on(handle.adapter(None)).unwrap();
        (bus, handle, adapter, PeripheralConfig::default())
    }

    #[test]
    fn properties() {
        let (bus, handle, adapter, config) = setup();
        let mut adv = Advertisement::new("Pi5-BLE-Device");
        adv.add_service_uuid(Uuid::from_u16(0x180A));
        adv.add_service_uuid(Uuid::from_u16(0x180A));
        adv.set_manufacturer_data(0xFFFF, [1, 2, 3]);
        block_on(adv.start(&handle, &adapter, &config)).unwrap();
        assert!(adv.is_active());

        let path = Advertisement::object_path(&config.path_prefix);
        assert_eq!(path, "/org/bluez/blues/advertisement0");
        assert_eq!(bus.advertisements(), [path.clone()]);

        let prop = |name| bus.property(&path, name).unwrap();
        assert_eq!(prop("Type"), PropValue::Str("peripheral".into()));
        assert_eq!(prop("LocalName"), PropValue::Str("Pi5-BLE-Device".into()));
        assert_eq!(
            prop("ServiceUUIDs"),
            PropValue::StrList(vec![
                "0000180a-0000-1000-8000-00805f9b34fb".into(),
                "0000180a-0000-1000-8000-00805f9b34fb".into(),
            ])
        );
        assert_eq!(
            prop("ManufacturerData"),
            PropValue::BytesByU16(BTreeMap::from([(0xFFFF, vec![1, 2, 3])]))
        );
        assert_eq!(
            prop("Includes"),
            PropValue::StrList(vec!["local-name".into()])
        );
        assert_eq!(prop("Appearance"), PropValue::U16(0));
        assert_eq!(prop("Flags"), PropValue::Bytes(vec![0x06]));
        bus.property(&path, "ServiceData").unwrap_err();
    }

    #[test]
    fn optional_properties() {
        let (bus, handle, adapter, config) = setup();
        let mut adv = Advertisement::new("sensor");
        adv.set_include_tx_power(true);
        adv.add_service_data(Uuid::from_u16(0xFEAA), [0x10]);
        adv.add_service_data(Uuid::from_u16(0xFEAA), [0x20, 0x00]);
        block_on(adv.start(&handle, &adapter, &config)).unwrap();

        let path = Advertisement::object_path(&config.path_prefix);
        assert_eq!(
            bus.property(&path, "Includes").unwrap(),
            PropValue::StrList(vec!["local-name".into(), "tx-power".into()])
        );
        assert_eq!(
            bus.property(&path, "ServiceData").unwrap(),
            PropValue::BytesByStr(BTreeMap::from([(
                "0000feaa-0000-1000-8000-00805f9b34fb".to_string(),
                vec![0x20, 0x00]
            )]))
        );
        assert_eq!(
            bus.property(&path, "ManufacturerData").unwrap(),
            PropValue::BytesByU16(BTreeMap::new())
        );
    }

    #[test]
    fn start_stop() {
        let (bus, handle, adapter, config) = setup();
        let mut adv = Advertisement::new("P");
        block_on(adv.stop(&config));

        block_on(adv.start(&handle, &adapter, &config)).unwrap();
        block_on(adv.start(&handle, &adapter, &config)).unwrap();
        assert_eq!(bus.manager_calls().len(), 1);

        let path = Advertisement::object_path(&config.path_prefix);
        assert_eq!(
            bus.call(&path, MethodCall::Release).unwrap(),
            Reply::Empty
        );

        block_on(adv.stop(&config));
        assert!(!adv.is_active());
        assert!(bus.advertisements().is_empty());
        assert!(bus.object_paths().is_empty());
        assert_eq!(
            bus.manager_calls().last(),
            Some(&ManagerCall::UnregisterAdvertisement { path })
        );
    }

    #[test]
    fn rejected_start_removes_object() {
        let (bus, handle, adapter, config) = setup();
        bus.fail_method("RegisterAdvertisement");

        let mut adv = Advertisement::new("P");
        let err = block_on(adv.start(&handle, &adapter, &config)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManagerRpc);
        assert!(!adv.is_active());
        assert!(bus.object_paths().is_empty());
    }

    #[test]
    fn bounded_unregister() {
        let (bus, handle, adapter, mut config) = setup();
        config.unregister_timeout = Duration::from_millis(20);

        let mut adv = Advertisement::new("P");
        block_on(adv.start(&handle, &adapter, &config)).unwrap();

        bus.hang_method("UnregisterAdvertisement");
        block_on(adv.stop(&config));
        assert!(!adv.is_active());
        assert!(bus.object_paths().is_empty());
    }
}
