use std::{process, sync::Arc};

use blues_peripheral::{
    gatt::{Characteristic, CharacteristicFlags, Descriptor, DescriptorFlags, Service},
    uuid::Uuid,
    Peripheral, PeripheralConfig, Session,
};
use tokio::signal::unix::{signal, SignalKind};

// https://www.bluetooth.com/specifications/assigned-numbers/
const DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u16(0x180A);
const DEVICE_NAME_CHARACTERISTIC: Uuid = Uuid::from_u16(0x2A00);
const USER_DESCRIPTION_DESCRIPTOR: Uuid = Uuid::from_u16(0x2901);

const DEFAULT_PERIPHERAL_NAME: &str = "Pi5-BLE-Device";
const DEVICE_NAME: &str = "Raspberry Pi 5";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::builder()
        .filter_module(env!("CARGO_CRATE_NAME"), log::LevelFilter::Debug)
        .parse_default_env()
        .init();

    let session = match Session::new().await {
        Ok(session) => session,
        Err(e) => {
            log::error!("couldn't connect to the system bus: {}", e);
            process::exit(1);
        }
    };

    let name = std::env::var("BLUES_NAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_PERIPHERAL_NAME.to_string());
    let mut peripheral = Peripheral::new(name, Arc::new(session), PeripheralConfig::from_env());

    if let Err(e) = add_device_information(&mut peripheral) {
        log::error!("couldn't set up the device information service: {}", e);
        process::exit(1);
    }

    if let Err(e) = peripheral.run(shutdown()).await {
        log::error!("{}", e);
        process::exit(1);
    }
}

fn add_device_information(peripheral: &mut Peripheral) -> blues_peripheral::Result<()> {
    let device_name = Characteristic::new(DEVICE_NAME_CHARACTERISTIC, CharacteristicFlags::READ);
    device_name.set_read_handler(|| Ok(DEVICE_NAME.as_bytes().to_vec()));

    let description = Descriptor::new(USER_DESCRIPTION_DESCRIPTOR, DescriptorFlags::READ);
    description.set_value("Device Name");
    device_name.add_descriptor(description)?;

    let mut service = Service::new(DEVICE_INFORMATION_SERVICE, true);
    service.add_characteristic(device_name)?;
    peripheral.add_service(service)
}

/// Completes on Ctrl-C or SIGTERM.
async fn shutdown() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            log::warn!("couldn't listen for SIGTERM: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("couldn't listen for Ctrl-C: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => log::info!("received Ctrl-C"),
            Err(e) => log::error!("couldn't listen for Ctrl-C: {}", e),
        },
        _ = sigterm.recv() => log::info!("received SIGTERM"),
    }
}
