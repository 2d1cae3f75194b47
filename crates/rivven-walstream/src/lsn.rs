//! Log sequence numbers
//!
//! A stream position is a 64-bit byte offset into the server's write-ahead
//! log. PostgreSQL prints it as `X/Y`, the upper and lower 32 bits in hex.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::WalStreamError;

/// Position in the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(u64);

impl Lsn {
    /// `InvalidXLogRecPtr`: "no position". Also the value sent for the
    /// unused apply position in standby status updates.
    pub const INVALID: Lsn = Lsn(0);

    /// Create an LSN from its raw value
    pub const fn new(value: u64) -> Self {
        Lsn(value)
    }

    /// Raw 64-bit value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check for the invalid (zero) position
    pub const fn is_invalid(self) -> bool {
        self.0 == 0
    }

    fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    fn low(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.high(), self.low())
    }
}

impl FromStr for Lsn {
    type Err = WalStreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (high, low) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| WalStreamError::config(format!("could not parse position \"{s}\"")))?;
        let high = u32::from_str_radix(high, 16)
            .map_err(|_| WalStreamError::config(format!("could not parse position \"{s}\"")))?;
        let low = u32::from_str_radix(low, 16)
            .map_err(|_| WalStreamError::config(format!("could not parse position \"{s}\"")))?;
        Ok(Lsn((u64::from(high) << 32) | u64::from(low)))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
