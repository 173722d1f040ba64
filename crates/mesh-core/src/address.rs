//! LinkAddress: 6-byte link-layer identifier of a node on the radio.
//!
//! Displays as lowercase colon-separated hex (`aa:bb:cc:dd:ee:ff`).

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Number of bytes in a link-layer address.
pub const ADDRESS_LEN: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid link address format: expected 6 hex octets")]
    InvalidFormat,
    #[error("Invalid hex octet: {0:?}")]
    InvalidOctet(String),
}

/// A link-layer (MAC-style) address of a node in the mesh.
///
/// Parses from the colon form, the dash form, or 12 bare hex digits:
/// ```
/// use mesh_core::LinkAddress;
///
/// let a: LinkAddress = "24:0a:c4:12:34:56".parse().unwrap();
/// let b: LinkAddress = "240ac4123456".parse().unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.to_string(), "24:0a:c4:12:34:56");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkAddress([u8; ADDRESS_LEN]);

/// Reserved address that makes the transport deliver to every node in range.
pub const BROADCAST: LinkAddress = LinkAddress([0xff; ADDRESS_LEN]);

impl LinkAddress {
    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a random locally-administered unicast address.
    pub fn generate() -> Self {
        use rand::Rng;
        let mut bytes: [u8; ADDRESS_LEN] = rand::rng().random();
        // Clear the group bit, set the locally-administered bit.
        bytes[0] = (bytes[0] & 0xfc) | 0x02;
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == BROADCAST
    }
}

impl Display for LinkAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for LinkAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<&str> = if s.contains(':') {
            s.split(':').collect()
        } else if s.contains('-') {
            s.split('-').collect()
        } else if s.len() == ADDRESS_LEN * 2 && s.is_ascii() {
            (0..ADDRESS_LEN).map(|i| &s[i * 2..i * 2 + 2]).collect()
        } else {
            return Err(AddressError::InvalidFormat);
        };

        if octets.len() != ADDRESS_LEN {
            return Err(AddressError::InvalidFormat);
        }

        let mut bytes = [0u8; ADDRESS_LEN];
        for (slot, octet) in bytes.iter_mut().zip(octets) {
            if octet.len() != 2 {
                return Err(AddressError::InvalidFormat);
            }
            if !octet.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(AddressError::InvalidOctet(octet.to_string()));
            }
            *slot = u8::from_str_radix(octet, 16)
                .map_err(|_| AddressError::InvalidOctet(octet.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl From<[u8; ADDRESS_LEN]> for LinkAddress {
    fn from(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<LinkAddress> for [u8; ADDRESS_LEN] {
    fn from(address: LinkAddress) -> Self {
        address.0
    }
}

impl TryFrom<&[u8]> for LinkAddress {
    type Error = AddressError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; ADDRESS_LEN] = bytes.try_into().map_err(|_| AddressError::InvalidFormat)?;
        Ok(Self(bytes))
    }
}

// Serialize as the display string so logs, events and JSON agree
impl serde::Serialize for LinkAddress {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for LinkAddress {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
