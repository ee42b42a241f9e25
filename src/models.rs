use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Longest display name kept for a sensor or scan entry, in bytes.
pub const MAX_NAME_LEN: usize = 31;

const ADDR_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// 48-bit Bluetooth device address.
///
/// Stored as an integer with the first transmitted byte in the most
/// significant position, so `A4:C1:38:00:11:22` is `0xA4C1_3800_1122`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BdAddr(u64);

impl BdAddr {
    /// Build an address from its integer form, discarding bits above 48.
    pub const fn new(value: u64) -> Self {
        BdAddr(value & ADDR_MASK)
    }

    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        let mut padded = [0u8; 8];
        padded[2..].copy_from_slice(&bytes);
        BdAddr(u64::from_be_bytes(padded))
    }

    pub fn to_bytes(self) -> [u8; 6] {
        let full = self.0.to_be_bytes();
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&full[2..]);
        bytes
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Twelve lowercase hex digits without separators, as used in report ids.
    pub fn to_hex(self) -> String {
        format!("{:012x}", self.0)
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for BdAddr {
    type Err = Error;

    /// Accepts `A4:C1:38:00:11:22`, `a4-c1-38-00-11-22` or `a4c138001122`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Config(format!("invalid sensor address '{}'", s)));
        }
        u64::from_str_radix(&digits, 16)
            .map(BdAddr::new)
            .map_err(|e| Error::Config(format!("invalid sensor address '{}': {}", s, e)))
    }
}

/// Cut a display name down to [`MAX_NAME_LEN`] bytes on a char boundary.
pub fn bounded_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// A configured sensor: hardware address plus display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorIdentity {
    pub address: BdAddr,
    pub name: String,
}

impl SensorIdentity {
    pub fn new(address: BdAddr, name: &str) -> Self {
        SensorIdentity {
            address,
            name: bounded_name(name),
        }
    }
}

/// Last known values of one sensor. Each field is independently absent,
/// which is distinct from a legitimate zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reading {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
}

impl Reading {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.humidity.is_none()
    }
}

/// One device seen during a discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub address: BdAddr,
    pub name: Option<String>,
}
