//! Peripheral configuration.

use std::time::Duration;

/// Settings controlling how a [`Peripheral`][crate::Peripheral] talks to the Bluetooth manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralConfig {
    /// Name of the adapter to use (eg. `hci0`).
    ///
    /// If [`None`], the first adapter supporting LE advertising is used.
    pub adapter: Option<String>,
    /// Object path below which all GATT objects are published.
    pub path_prefix: String,
    /// Whether to power on the adapter before registering anything.
    pub power_on: bool,
    /// Whether to register the GATT application with `org.bluez.GattManager1`.
    pub register_application: bool,
    /// Upper bound on `RegisterAdvertisement` and `RegisterApplication` calls.
    pub register_timeout: Duration,
    /// Upper bound on `UnregisterAdvertisement` and `UnregisterApplication` calls.
    pub unregister_timeout: Duration,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            path_prefix: "/org/bluez/blues".into(),
            power_on: true,
            register_application: true,
            register_timeout: Duration::from_secs(10),
            unregister_timeout: Duration::from_secs(5),
        }
    }
}

impl PeripheralConfig {
    /// Builds a configuration from the `BLUES_*` environment variables, falling back to the
    /// defaults for unset ones.
    ///
    /// - `BLUES_ADAPTER`: adapter name
    /// - `BLUES_PATH_PREFIX`: object path prefix
    /// - `BLUES_NO_POWER_ON`: if set, leave the adapter's power state alone
    /// - `BLUES_NO_APPLICATION`: if set, skip `RegisterApplication`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`PeripheralConfig::from_env`], but reads variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(adapter) = lookup("BLUES_ADAPTER").filter(|s| !s.is_empty()) {
            config.adapter = Some(adapter);
        }
        if let Some(prefix) = lookup("BLUES_PATH_PREFIX").filter(|s| !s.is_empty()) {
            config.path_prefix = prefix.trim_end_matches('/').to_string();
        }
        if lookup("BLUES_NO_POWER_ON").is_some() {
            config.power_on = false;
        }
        if lookup("BLUES_NO_APPLICATION").is_some() {
            config.register_application = false;
        }
        config
    }
}
