use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use super::PciConfigError;

/// `domain:bus:slot.function`, e.g. `0000:03:00.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

fn hex_field<T>(
    field: &str,
    digits: usize,
    parse: fn(&str, u32) -> Result<T, ParseIntError>,
) -> Option<T> {
    if field.len() != digits || !field.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    parse(field, 16).ok()
}

impl PciAddress {
    /// Parse `DDDD:BB:SS.F`: four hex digits of domain, two each of bus and slot,
    /// and one octal digit of function. Hex digits may be either case.
    pub fn parse(raw: &str) -> Result<Self, PciConfigError> {
        let invalid = || PciConfigError::InvalidAddress {
            address: raw.to_string(),
        };

        let (domain, rest) = raw.split_once(':').ok_or_else(invalid)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(invalid)?;
        let (slot, function) = rest.split_once('.').ok_or_else(invalid)?;

        let function = match function.as_bytes() {
            [digit @ b'0'..=b'7'] => digit - b'0',
            _ => return Err(invalid()),
        };

        Ok(Self {
            domain: hex_field(domain, 4, u16::from_str_radix).ok_or_else(invalid)?,
            bus: hex_field(bus, 2, u8::from_str_radix).ok_or_else(invalid)?,
            slot: hex_field(slot, 2, u8::from_str_radix).ok_or_else(invalid)?,
            function,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = PciConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PciAddress {
    type Error = PciConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PciAddress> for String {
    fn from(address: PciAddress) -> Self {
        address.to_string()
    }
}
