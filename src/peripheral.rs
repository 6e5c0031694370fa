//! The [`Peripheral`] orchestrating services, application root and advertisement.

use std::{fmt, future::Future, pin::pin, sync::Arc};

use futures_util::{
    future::{select, Either},
    stream, StreamExt,
};

use crate::{
    advertisement::Advertisement,
    application::Application,
    bus::{AdapterInfo, ManagerCall, ObjectBus},
    config::PeripheralConfig,
    gatt::{Service, ServiceRegistration},
    uuid::Uuid,
    Error, ErrorKind, Result,
};

/// Lifecycle state of a [`Peripheral`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not connected to a bus yet.
    Created,
    /// Connected, nothing published.
    Connected,
    /// Services and advertisement are published.
    Running,
    /// Stopped for good. A stopped peripheral can't be started again.
    Stopped,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Created => "created",
            State::Connected => "connected",
            State::Running => "running",
            State::Stopped => "stopped",
        })
    }
}

/// What [`Peripheral::start`] managed to bring up.
///
/// Only the overall lifecycle transition is guaranteed; every individual step may have failed.
#[derive(Debug)]
pub struct StartReport {
    /// The adapter that was selected.
    pub adapter: Result<AdapterInfo>,
    /// One entry per service, in the order they were added.
    pub services: Vec<(Uuid, Result<ServiceRegistration>)>,
    /// Outcome of the GATT application registration, [`None`] if it is disabled.
    pub application: Option<Result<()>>,
    /// Outcome of starting the advertisement.
    pub advertising: Result<()>,
}

impl StartReport {
    /// Returns `true` if every step succeeded, including every characteristic.
    pub fn is_complete(&self) -> bool {
        self.adapter.is_ok()
            && self
                .services
                .iter()
                .all(|(_, res)| matches!(res, Ok(reg) if reg.is_complete()))
            && !matches!(self.application, Some(Err(_)))
            && self.advertising.is_ok()
    }
}

/// A BLE peripheral: a named set of GATT [`Service`]s plus an [`Advertisement`].
///
/// [`Peripheral::stop`] has to be called to take everything off the bus again; dropping a running
/// peripheral leaves its objects registered until the bus connection closes.
pub struct Peripheral {
    name: String,
    config: PeripheralConfig,
    bus: Option<Arc<dyn ObjectBus>>,
    services: Vec<Service>,
    advertisement: Advertisement,
    application: Application,
    adapter: Option<AdapterInfo>,
    state: State,
}

impl Peripheral {
    /// Creates a peripheral that is not connected to any bus yet.
    ///
    /// Use [`Peripheral::connect`] before starting it.
    pub fn detached(name: impl Into<String>, config: PeripheralConfig) -> Self {
        let name = name.into();
        Self {
            advertisement: Advertisement::new(name.clone()),
            name,
            config,
            bus: None,
            services: Vec::new(),
            application: Application::default(),
            adapter: None,
            state: State::Created,
        }
    }

    /// Creates a peripheral publishing its objects on `bus`.
    pub fn new(name: impl Into<String>, bus: Arc<dyn ObjectBus>, config: PeripheralConfig) -> Self {
        let mut this = Self::detached(name, config);
        this.bus = Some(bus);
        this.state = State::Connected;
        this
    }

    /// Attaches a detached peripheral to `bus`.
    pub fn connect(&mut self, bus: Arc<dyn ObjectBus>) -> Result<()> {
        if self.state != State::Created {
            return Err(self.invalid_state("connect"));
        }

        self.bus = Some(bus);
        self.state = State::Connected;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &PeripheralConfig {
        &self.config
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    /// Gives access to the advertisement, eg. to set manufacturer data.
    ///
    /// Changes take effect the next time the advertisement is started.
    pub fn advertisement_mut(&mut self) -> &mut Advertisement {
        &mut self.advertisement
    }

    /// Returns the adapter in use, once the peripheral is running.
    pub fn adapter(&self) -> Option<&AdapterInfo> {
        self.adapter.as_ref()
    }

    /// Adds a service and advertises its UUID.
    ///
    /// Services can only be added before the peripheral is started.
    pub fn add_service(&mut self, service: Service) -> Result<()> {
        if matches!(self.state, State::Running | State::Stopped) {
            return Err(self.invalid_state("add a service"));
        }

        log::debug!("adding service {} to \"{}\"", service.uuid(), self.name);
        self.advertisement.add_service_uuid(service.uuid());
        self.services.push(service);
        Ok(())
    }

    /// Publishes all services and starts advertising.
    ///
    /// Only lifecycle misuse is an error: failing to find the adapter, to register a service or
    /// the application, or to advertise is logged and reported in the returned [`StartReport`],
    /// and the peripheral is [`State::Running`] afterwards regardless. Returns [`None`] if the
    /// peripheral is already running.
    pub async fn start(&mut self) -> Result<Option<StartReport>> {
        match self.state {
            State::Running => {
                log::debug!("peripheral \"{}\" is already running", self.name);
                return Ok(None);
            }
            State::Created | State::Stopped => return Err(self.invalid_state("start")),
            State::Connected => {}
        }
        let Some(bus) = self.bus.clone() else {
            return Err(self.invalid_state("start"));
        };

        log::info!(
            "starting peripheral \"{}\" with {} services",
            self.name,
            self.services.len()
        );

        let adapter = bus.adapter(self.config.adapter.as_deref()).await;
        match &adapter {
            Ok(adapter) => {
                log::info!("using adapter {}", adapter);
                if self.config.power_on {
                    if let Err(e) = bus
                        .call_method(
                            &adapter.path,
                            ManagerCall::PowerOn,
                            Some(self.config.register_timeout),
                        )
                        .await
                    {
                        log::warn!("failed to power on {}: {}", adapter.name, e);
                    }
                }
            }
            Err(e) => log::warn!("no usable adapter, not advertising: {}", e),
        }

        let mut services = Vec::with_capacity(self.services.len());
        for service in &mut self.services {
            let res = service.register(&bus, &self.config.path_prefix).await;
            if let Err(e) = &res {
                log::warn!("failed to register service {}: {}", service.uuid(), e);
            }
            services.push((service.uuid(), res));
        }

        let application = if self.config.register_application {
            let res = match &adapter {
                Ok(adapter) => {
                    let objects = self
                        .services
                        .iter()
                        .flat_map(Service::published_objects)
                        .collect();
                    self.application
                        .start(&bus, adapter, &self.config, objects)
                        .await
                }
                Err(_) => Err(no_adapter()),
            };
            if let Err(e) = &res {
                log::warn!("failed to register GATT application: {}", e);
            }
            Some(res)
        } else {
            None
        };

        let advertising = match &adapter {
            Ok(adapter) => {
                self.advertisement
                    .start(&bus, adapter, &self.config)
                    .await
            }
            Err(_) => Err(no_adapter()),
        };
        if let Err(e) = &advertising {
            log::warn!("failed to start advertising: {}", e);
        }

        self.adapter = adapter.as_ref().ok().cloned();
        self.state = State::Running;
        log::info!("peripheral \"{}\" is running", self.name);
        Ok(Some(StartReport {
            adapter,
            services,
            application,
            advertising,
        }))
    }

    /// Starts the peripheral and keeps it running until `shutdown` completes, then stops it.
    ///
    /// Remote devices connecting and disconnecting are logged in the meantime.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.start().await?;

        let mut events = match (&self.bus, &self.adapter) {
            (Some(bus), Some(adapter)) => match bus.connection_events(&adapter.path).await {
                Ok(events) => events,
                Err(e) => {
                    log::warn!("not watching for connections: {}", e);
                    stream::pending().boxed()
                }
            },
            _ => stream::pending().boxed(),
        };

        let mut shutdown = pin!(shutdown);
        loop {
            let event = match select(shutdown.as_mut(), events.next()).await {
                Either::Left(_) => break,
                Either::Right((event, _)) => event,
            };
            match event {
                Some(event) => log::info!("{}", event),
                None => {
                    log::debug!("connection event stream ended");
                    shutdown.as_mut().await;
                    break;
                }
            }
        }

        log::info!("shutting down peripheral \"{}\"", self.name);
        self.stop().await;
        Ok(())
    }

    /// Stops advertising and takes the application and all services off the bus.
    ///
    /// Does nothing unless the peripheral is running. Failures are logged.
    pub async fn stop(&mut self) {
        if self.state != State::Running {
            return;
        }

        self.advertisement.stop(&self.config).await;
        self.application.stop(&self.config).await;
        for service in &mut self.services {
            service.unregister().await;
        }

        self.state = State::Stopped;
        log::info!("peripheral \"{}\" stopped", self.name);
    }

    fn invalid_state(&self, what: &str) -> Error {
        Error::new(
            ErrorKind::InvalidState,
            format!(
                "cannot {} while peripheral \"{}\" is {}",
                what, self.name, self.state
            ),
        )
    }
}

fn no_adapter() -> Error {
    Error::from("no Bluetooth adapter available")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pollster::block_on;

    use super::*;
    use crate::{
        bus::MethodCall,
        device::ConnectionEvent,
        gatt::{Characteristic, CharacteristicFlags},
        memory::MemoryBus,
    };

    const U1: Uuid = Uuid::from_u16(0x180A);
    const C1: Uuid = Uuid::from_u16(0x2A00);

    fn peripheral(bus: &MemoryBus) -> (Peripheral, Characteristic) {
        let mut peripheral = Peripheral::new(
            "P",
            Arc::new(bus.clone()),
            PeripheralConfig::default(),
        );
        let characteristic = Characteristic::new(C1, CharacteristicFlags::READ);
        characteristic.set_read_handler(|| Ok(vec![0x50, 0x31]));
        let mut service = Service::new(U1, true);
        service.add_characteristic(characteristic.clone()).unwrap();
        peripheral.add_service(service).unwrap();
        (peripheral, characteristic)
    }

    #[test]
    fn lifecycle() {
        let bus = MemoryBus::new();
        let (mut peripheral, characteristic) = peripheral(&bus);
        assert_eq!(peripheral.state(), State::Connected);
        assert_eq!(peripheral.advertisement().service_uuids(), [U1]);
        assert_eq!(peripheral.advertisement().local_name(), "P");

        let report = block_on(peripheral.start()).unwrap().unwrap();
        assert!(report.is_complete(), "{:?}", report);
        assert_eq!(peripheral.state(), State::Running);
        assert_eq!(peripheral.adapter().unwrap().name, "hci0");
        assert!(bus.is_powered("/org/bluez/hci0"));
        assert_eq!(bus.applications(), ["/org/bluez/blues"]);
        assert_eq!(bus.advertisements(), ["/org/bluez/blues/advertisement0"]);

        let path = characteristic.object_path().unwrap();
        assert_eq!(bus.read_value(&path).unwrap(), [0x50, 0x31]);

        assert!(block_on(peripheral.start()).unwrap().is_none());

        block_on(peripheral.stop());
        assert_eq!(peripheral.state(), State::Stopped);
        assert_eq!(
            bus.read_value(&path).unwrap_err().kind(),
            ErrorKind::Transport
        );
        assert!(bus.object_paths().is_empty());
        assert!(bus.advertisements().is_empty());
        assert!(bus.applications().is_empty());

        let err = block_on(peripheral.start()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn registration_order() {
        let bus = MemoryBus::new();
        let (mut peripheral, _) = peripheral(&bus);
        block_on(peripheral.start()).unwrap();
        block_on(peripheral.stop());

        let names: Vec<_> = bus.manager_calls().iter().map(ManagerCall::name).collect();
        assert_eq!(
            names,
            [
                "PowerOn",
                "RegisterApplication",
                "RegisterAdvertisement",
                "UnregisterAdvertisement",
                "UnregisterApplication",
            ]
        );
    }

    #[test]
    fn add_service_after_start() {
        let bus = MemoryBus::new();
        let (mut peripheral, _) = peripheral(&bus);
        block_on(peripheral.start()).unwrap();

        let err = peripheral.add_service(Service::new(U1, false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(peripheral.services().len(), 1);

        block_on(peripheral.stop());
        let err = peripheral.add_service(Service::new(U1, false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn detached_lifecycle() {
        let bus = MemoryBus::new();
        let mut peripheral = Peripheral::detached("P", PeripheralConfig::default());
        peripheral.add_service(Service::new(U1, true)).unwrap();
        assert_eq!(
            block_on(peripheral.start()).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        block_on(peripheral.stop());
        assert_eq!(peripheral.state(), State::Created);

        peripheral.connect(Arc::new(bus.clone())).unwrap();
        assert_eq!(
            peripheral.connect(Arc::new(bus.clone())).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        block_on(peripheral.start()).unwrap().unwrap();
        assert_eq!(peripheral.state(), State::Running);
        block_on(peripheral.stop());
    }

    #[test]
    fn advertising_failure_is_tolerated() {
        let bus = MemoryBus::new();
        bus.fail_method("RegisterAdvertisement");
        let (mut peripheral, characteristic) = peripheral(&bus);

        let report = block_on(peripheral.start()).unwrap().unwrap();
        assert_eq!(
            report.advertising.unwrap_err().kind(),
            ErrorKind::ManagerRpc
        );
        assert_eq!(peripheral.state(), State::Running);
        assert!(!peripheral.advertisement().is_active());
        assert!(!bus
            .object_paths()
            .contains(&"/org/bluez/blues/advertisement0".to_string()));

        let path = characteristic.object_path().unwrap();
        assert_eq!(bus.read_value(&path).unwrap(), [0x50, 0x31]);
        block_on(peripheral.stop());
        assert!(bus.object_paths().is_empty());
    }

    #[test]
    fn missing_adapter() {
        let bus = MemoryBus::without_adapters();
        let (mut peripheral, characteristic) = peripheral(&bus);

        let report = block_on(peripheral.start()).unwrap().unwrap();
        assert!(report.adapter.is_err());
        assert!(report.advertising.is_err());
        assert!(matches!(report.application, Some(Err(_))));
        assert!(report.services[0].1.is_ok());
        assert!(!report.is_complete());
        assert_eq!(peripheral.adapter(), None);

        let path = characteristic.object_path().unwrap();
        assert_eq!(bus.read_value(&path).unwrap(), [0x50, 0x31]);
        block_on(peripheral.stop());
        assert!(bus.manager_calls().is_empty());
    }

    #[test]
    fn optional_steps_disabled() {
        let bus = MemoryBus::new();
        let config = PeripheralConfig {
            power_on: false,
            register_application: false,
            ..Default::default()
        };
        let mut peripheral = Peripheral::new("P", Arc::new(bus.clone()), config);
        let report = block_on(peripheral.start()).unwrap().unwrap();
        assert!(report.application.is_none());
        assert!(report.is_complete());
        assert!(!bus.is_powered("/org/bluez/hci0"));
        assert!(bus.applications().is_empty());
        block_on(peripheral.stop());
    }

    #[test]
    fn hanging_manager_on_stop() {
        let bus = MemoryBus::new();
        let config = PeripheralConfig {
            unregister_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let mut peripheral = Peripheral::new("P", Arc::new(bus.clone()), config);
        block_on(peripheral.start()).unwrap();

        bus.hang_method("UnregisterAdvertisement");
        bus.hang_method("UnregisterApplication");
        block_on(peripheral.stop());
        assert_eq!(peripheral.state(), State::Stopped);
        assert!(bus.object_paths().is_empty());
    }

    #[test]
    fn run_until_shutdown() {
        let bus = MemoryBus::new();
        let (mut peripheral, characteristic) = peripheral(&bus);
        bus.push_connection_event(ConnectionEvent::new(
            "/org/bluez/hci0/dev_AA_BB_CC_11_22_33",
            true,
        ));

        let client = bus.clone();
        let shutdown = async move {
            // Runs once the peripheral is up.
            let path = characteristic.object_path().unwrap();
            let reply = client.call(&path, MethodCall::ReadValue {
                options: Default::default(),
            });
            assert_eq!(reply.unwrap(), crate::bus::Reply::Bytes(vec![0x50, 0x31]));
            async_io::Timer::after(Duration::from_millis(10)).await;
        };
        block_on(peripheral.run(shutdown)).unwrap();
        assert_eq!(peripheral.state(), State::Stopped);
        assert!(bus.object_paths().is_empty());
    }
}
