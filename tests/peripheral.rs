use std::sync::Arc;

use blues_peripheral::{
    bus::PropValue,
    gatt::{Characteristic, CharacteristicFlags, Service},
    memory::MemoryBus,
    uuid::Uuid,
    ErrorKind, Peripheral, PeripheralConfig, State,
};

const U1: Uuid = Uuid::from_static("12345678-1234-5678-1234-56789abcdef0");
const C1: Uuid = Uuid::from_static("12345678-1234-5678-1234-56789abcdef1");
const C2: Uuid = Uuid::from_static("12345678-1234-5678-1234-56789abcdef2");

#[pollster::test]
async fn read_while_running() {
    let bus = MemoryBus::new();
    let mut peripheral = Peripheral::new("P", Arc::new(bus.clone()), PeripheralConfig::default());

    let c1 = Characteristic::new(C1, CharacteristicFlags::READ);
    c1.set_read_handler(|| Ok(vec![0x50, 0x31]));
    let mut service = Service::new(U1, true);
    service.add_characteristic(c1.clone()).unwrap();
    peripheral.add_service(service).unwrap();

    let report = peripheral.start().await.unwrap().unwrap();
    assert!(report.is_complete());
    assert_eq!(peripheral.state(), State::Running);

    let path = c1.object_path().unwrap();
    assert_eq!(bus.read_value(&path).unwrap(), [0x50, 0x31]);

    peripheral.stop().await;
    let err = bus.read_value(&path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[pollster::test]
async fn sensor_notifications() {
    let bus = MemoryBus::new();
    let mut peripheral = Peripheral::new(
        "sensor",
        Arc::new(bus.clone()),
        PeripheralConfig::default(),
    );

    let reading = Characteristic::new(C1, CharacteristicFlags::READ | CharacteristicFlags::NOTIFY);
    let command = Characteristic::new(C2, CharacteristicFlags::WRITE);
    let mut service = Service::new(U1, true);
    service.add_characteristic(reading.clone()).unwrap();
    service.add_characteristic(command.clone()).unwrap();
    peripheral.add_service(service).unwrap();
    peripheral
        .advertisement_mut()
        .set_manufacturer_data(0xFFFF, [0xBE, 0xEF]);

    peripheral.start().await.unwrap();

    reading.notify_value([20]).await;
    reading.notify_value([21]).await;
    let changes = bus.property_changes();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[1].value, PropValue::Bytes(vec![21]));

    let reading_path = reading.object_path().unwrap();
    assert_eq!(bus.read_value(&reading_path).unwrap(), [21]);

    let command_path = command.object_path().unwrap();
    bus.write_value(&command_path, b"reset").unwrap();
    assert_eq!(command.value(), b"reset");

    let service_path = peripheral.services()[0].object_path().unwrap().to_string();
    assert_eq!(
        bus.property(&service_path, "Characteristics").unwrap(),
        PropValue::PathList(vec![reading_path, command_path])
    );

    peripheral.stop().await;
    assert!(bus.object_paths().is_empty());

    // Values survive, only notifications stop.
    reading.notify_value([22]).await;
    assert_eq!(bus.property_changes().len(), 2);
    assert_eq!(reading.value(), [22]);
}
