//! Time-to-live values
//!
//! A TTL is stored in two bytes: a count and a unit. The text form is
//! `<count><unit>` where unit is one of `m h d w M y`; a bare number means
//! minutes and the empty string means "no TTL".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

/// Serialized length of a TTL
pub const TTL_BYTES_LENGTH: usize = 2;

/// Unit of a TTL count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum TtlUnit {
    #[default]
    Empty = 0,
    Minute = 1,
    Hour = 2,
    Day = 3,
    Week = 4,
    Month = 5,
    Year = 6,
}

impl TtlUnit {
    fn from_byte(b: u8) -> Self {
        match b {
            1 => TtlUnit::Minute,
            2 => TtlUnit::Hour,
            3 => TtlUnit::Day,
            4 => TtlUnit::Week,
            5 => TtlUnit::Month,
            6 => TtlUnit::Year,
            _ => TtlUnit::Empty,
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            'm' => Some(TtlUnit::Minute),
            'h' => Some(TtlUnit::Hour),
            'd' => Some(TtlUnit::Day),
            'w' => Some(TtlUnit::Week),
            'M' => Some(TtlUnit::Month),
            'y' => Some(TtlUnit::Year),
            _ => None,
        }
    }

    fn as_char(self) -> Option<char> {
        match self {
            TtlUnit::Empty => None,
            TtlUnit::Minute => Some('m'),
            TtlUnit::Hour => Some('h'),
            TtlUnit::Day => Some('d'),
            TtlUnit::Week => Some('w'),
            TtlUnit::Month => Some('M'),
            TtlUnit::Year => Some('y'),
        }
    }

    /// Minutes in one unit
    fn minutes(self) -> u32 {
        match self {
            TtlUnit::Empty => 0,
            TtlUnit::Minute => 1,
            TtlUnit::Hour => 60,
            TtlUnit::Day => 60 * 24,
            TtlUnit::Week => 60 * 24 * 7,
            TtlUnit::Month => 60 * 24 * 31,
            TtlUnit::Year => 60 * 24 * 365,
        }
    }
}

/// Time-to-live of a needle or a whole volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Ttl {
    pub count: u8,
    pub unit: TtlUnit,
}

impl Ttl {
    /// The absent TTL
    pub const EMPTY: Ttl = Ttl {
        count: 0,
        unit: TtlUnit::Empty,
    };

    pub fn new(count: u8, unit: TtlUnit) -> Self {
        Self { count, unit }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0 || self.unit == TtlUnit::Empty
    }

    /// Decode from the two persisted bytes `[count, unit]`
    pub fn from_bytes(bytes: [u8; TTL_BYTES_LENGTH]) -> Self {
        Self {
            count: bytes[0],
            unit: TtlUnit::from_byte(bytes[1]),
        }
    }

    pub fn to_bytes(&self) -> [u8; TTL_BYTES_LENGTH] {
        [self.count, self.unit as u8]
    }

    /// Packed form used in heartbeats: `count << 8 | unit`
    pub fn as_u32(&self) -> u32 {
        if self.count == 0 {
            return 0;
        }
        (u32::from(self.count) << 8) | u32::from(self.unit as u8)
    }

    pub fn from_u32(value: u32) -> Self {
        if value == 0 {
            return Self::EMPTY;
        }
        Self {
            count: (value >> 8) as u8,
            unit: TtlUnit::from_byte(value as u8),
        }
    }

    /// Total length in minutes (0 when empty)
    pub fn minutes(&self) -> u32 {
        u32::from(self.count) * self.unit.minutes()
    }
}

impl FromStr for Ttl {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::EMPTY);
        }

        // A trailing digit means the whole string is a minute count
        let last = s.chars().last().unwrap_or('0');
        let (count_str, unit) = if last.is_ascii_digit() {
            (s, TtlUnit::Minute)
        } else {
            let unit = TtlUnit::from_char(last)
                .ok_or_else(|| StorageError::InvalidTtl(format!("unknown unit in {:?}", s)))?;
            (&s[..s.len() - last.len_utf8()], unit)
        };

        let count: u8 = count_str
            .parse()
            .map_err(|e| StorageError::InvalidTtl(format!("{:?}: {}", s, e)))?;

        Ok(Self { count, unit })
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit.as_char() {
            Some(c) if self.count > 0 => write!(f, "{}{}", self.count, c),
            _ => Ok(()),
        }
    }
}
