//! Bluetooth device addresses.
//!
//! Device addresses are a link-layer mechanism that allows devices to identify and exchange data
//! with each other. The peripheral only ever sees them in log output: as the address of the local
//! adapter, and as the identity of centrals connecting to it.

use core::fmt;
use std::{fmt::Write, num::ParseIntError, str::FromStr};

/// A 6-Byte Bluetooth device address.
///
/// Device addresses can either follow the MAC address standard, or be randomly generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; 6]);

impl Address {
    /// Extracts the [`Address`] encoded in the object path BlueZ assigns to a remote device.
    ///
    /// Device paths look like `/org/bluez/hci0/dev_AA_BB_CC_11_22_33`. Returns [`None`] for
    /// anything else.
    pub fn from_device_path(path: &str) -> Option<Self> {
        let (_, last) = path.rsplit_once('/')?;
        let hex = last.strip_prefix("dev_")?;
        hex.replace('_', ":").parse().ok()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl From<[u8; 6]> for Address {
    #[inline]
    fn from(value: [u8; 6]) -> Self {
        Self(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_char(':')?;
            }

            write!(f, "{:02X}", byte)?;
        }

        Ok(())
    }
}

/// Parses a Bluetooth [`Address`] from a colon-separated hex string.
///
/// Example: `aa:ff:00:33:22:11`
impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; 6];
        for (i, s) in s.splitn(6, ':').enumerate() {
            if s.len() != 2 {
                return Err(ParseAddressError::other());
            }
            bytes[i] = u8::from_str_radix(s, 16).map_err(ParseAddressError::parse_int)?;
            if i == bytes.len() - 1 {
                return Ok(Address(bytes));
            }
        }

        Err(ParseAddressError::other())
    }
}

/// The error type returned by the [`FromStr`] implementation of [`Address`].
#[derive(Debug)]
pub struct ParseAddressError(ParseAddressErrorKind);

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ParseAddressErrorKind::ParseInt(e) => e.fmt(f),
            ParseAddressErrorKind::Other => f.write_str("invalid device address"),
        }
    }
}

impl std::error::Error for ParseAddressError {}

#[derive(Debug)]
enum ParseAddressErrorKind {
    ParseInt(ParseIntError),
    Other,
}

impl ParseAddressError {
    fn parse_int(e: ParseIntError) -> Self {
        Self(ParseAddressErrorKind::ParseInt(e))
    }

    fn other() -> Self {
        Self(ParseAddressErrorKind::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let s = "AA:BB:CC:11:22:33";
        let addr = Address::from_str(s).unwrap();
        assert_eq!(addr.to_string(), s);
    }

    #[test]
    fn invalid() {
        Address::from_str("").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:3").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:333").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:33:").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:33:44").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:33 ").unwrap_err();
        Address::from_str("za:bb:cc:11:22:33").unwrap_err();
    }

    #[test]
    fn device_path() {
        let addr = Address::from_device_path("/org/bluez/hci0/dev_AA_BB_CC_11_22_33").unwrap();
        assert_eq!(addr, Address::from([0xaa, 0xbb, 0xcc, 0x11, 0x22, 0x33]));

        assert_eq!(Address::from_device_path("/org/bluez/hci0"), None);
        assert_eq!(
            Address::from_device_path("/org/bluez/hci0/dev_AA_BB_CC_11_22_33/service0001"),
            None
        );
        assert_eq!(Address::from_device_path("dev_AA_BB_CC_11_22_33"), None);
    }
}
