// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! 48-bit Ethernet MAC address type.

use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// The multicast (group) bit of the first octet.
const GROUP_BIT: u8 = 0x01;
/// The locally-administered bit of the first octet.
const LOCAL_BIT: u8 = 0x02;

/// A 48-bit Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Returns a new MAC address from the given bytes.
    pub const fn new(value: [u8; 6]) -> Self {
        Self(value)
    }

    /// Returns the bytes of the MAC address.
    pub const fn to_bytes(self) -> [u8; 6] {
        self.0
    }

    /// Generates a random unicast address with the locally-administered bit
    /// set.
    pub fn random_local() -> Result<Self, getrandom::Error> {
        let mut bytes = [0; 6];
        getrandom::getrandom(&mut bytes)?;
        bytes[0] = (bytes[0] & !GROUP_BIT) | LOCAL_BIT;
        Ok(Self(bytes))
    }

    /// Returns true if the locally-administered bit is set.
    pub const fn is_local(&self) -> bool {
        self.0[0] & LOCAL_BIT != 0
    }

    /// Returns true if this is a group (multicast or broadcast) address.
    pub const fn is_multicast(&self) -> bool {
        self.0[0] & GROUP_BIT != 0
    }

    /// Returns the address that the remote end of a point-to-point link
    /// should use: this address with bit 0 of the last octet flipped, so the
    /// two ends never collide.
    pub const fn peer(self) -> Self {
        let mut bytes = self.0;
        bytes[5] ^= 0x01;
        Self(bytes)
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(value: [u8; 6]) -> Self {
        Self::new(value)
    }
}

impl From<MacAddress> for [u8; 6] {
    fn from(value: MacAddress) -> Self {
        value.0
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Error returned when parsing a [`MacAddress`] fails.
#[derive(Debug, Error)]
#[error("invalid mac address")]
pub struct InvalidMacAddress;

impl FromStr for MacAddress {
    type Err = InvalidMacAddress;

    fn from_str(val: &str) -> Result<Self, InvalidMacAddress> {
        if val.len() != 17 {
            return Err(InvalidMacAddress);
        }
        let sep = val.as_bytes()[2];
        if sep != b'-' && sep != b':' {
            return Err(InvalidMacAddress);
        }
        let mut mac_address = [0u8; 6];
        let mut parts = val.split(sep as char);
        for dst in &mut mac_address {
            let src = parts.next().ok_or(InvalidMacAddress)?;
            if src.len() != 2 || !src.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(InvalidMacAddress);
            }
            *dst = u8::from_str_radix(src, 16).map_err(|_| InvalidMacAddress)?;
        }
        if parts.next().is_some() {
            return Err(InvalidMacAddress);
        }
        Ok(MacAddress(mac_address))
    }
}
