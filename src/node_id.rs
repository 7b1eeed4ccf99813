/*! 48-bit globally-unique node identifier.

Rendered canonically as six dot-separated, zero-padded, upper-case hex
bytes, e.g. `"02.01.57.00.04.9C"`. A `NodeID` is immutable once built and
is the only way the stack refers to a node: the CAN link layer is the
one place aliases and NodeIDs are ever mixed, and it translates between
the two in both directions.
*/
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A 48-bit OpenLCB node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeID(u64);

const MASK_48: u64 = 0x0000_FFFF_FFFF_FFFF;

impl NodeID {
    /// Build a `NodeID` from its 48-bit integer value.
    ///
    /// Bits above bit 47 are rejected with [`Error::InvalidNodeID`].
    pub fn new(value: u64) -> Result<Self, Error> {
        if value & !MASK_48 != 0 {
            return Err(Error::InvalidNodeID(format!(
                "{value:#x} does not fit in 48 bits"
            )));
        }
        Ok(Self(value))
    }

    /// Build a `NodeID` from six bytes, most-significant first.
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        let mut v: u64 = 0;
        for b in bytes {
            v = (v << 8) | b as u64;
        }
        Self(v)
    }

    /// Parse the canonical dotted-hex form, e.g. `"02.01.57.00.04.9C"`.
    ///
    /// Case-insensitive on the hex digits; rejects anything other than
    /// exactly six one-or-two-digit hex groups.
    pub fn from_dotted(s: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 6 {
            return Err(Error::InvalidNodeID(format!(
                "expected 6 dot-separated groups, got {}",
                parts.len()
            )));
        }
        let mut bytes = [0u8; 6];
        for (i, p) in parts.iter().enumerate() {
            if p.is_empty() || p.len() > 2 {
                return Err(Error::InvalidNodeID(format!("bad hex group {p:?}")));
            }
            bytes[i] = u8::from_str_radix(p, 16)
                .map_err(|_| Error::InvalidNodeID(format!("bad hex group {p:?}")))?;
        }
        Ok(Self::from_bytes(bytes))
    }

    /// The raw 48-bit value.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// The six bytes, most-significant first.
    pub fn to_bytes(&self) -> [u8; 6] {
        let v = self.0;
        [
            (v >> 40) as u8,
            (v >> 32) as u8,
            (v >> 24) as u8,
            (v >> 16) as u8,
            (v >> 8) as u8,
            v as u8,
        ]
    }
}

impl fmt::Display for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02X}.{:02X}.{:02X}.{:02X}.{:02X}.{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for NodeID {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        Self::from_dotted(s)
    }
}

impl TryFrom<u64> for NodeID {
    type Error = Error;
    fn try_from(value: u64) -> Result<Self, Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_dotted() {
        let id = NodeID::from_dotted("02.01.57.00.04.9C").unwrap();
        assert_eq!(id.to_string(), "02.01.57.00.04.9C");
        assert_eq!(id.raw(), 0x0201_5700_049C);
    }

    #[test]
    fn lower_case_accepted() {
        let id = NodeID::from_dotted("02.01.57.00.04.9c").unwrap();
        assert_eq!(id.to_string(), "02.01.57.00.04.9C");
    }

    #[test]
    fn rejects_wrong_group_count() {
        assert!(NodeID::from_dotted("02.01.57.00.04").is_err());
        assert!(NodeID::from_dotted("02.01.57.00.04.9C.00").is_err());
    }

    #[test]
    fn rejects_non_hex() {
        assert!(NodeID::from_dotted("ZZ.01.57.00.04.9C").is_err());
    }

    #[test]
    fn rejects_overflowing_integer() {
        assert!(NodeID::new(1u64 << 48).is_err());
        assert!(NodeID::new((1u64 << 48) - 1).is_ok());
    }

    #[test]
    fn from_bytes_matches_dotted() {
        let id = NodeID::from_bytes([0x05, 0x01, 0x01, 0x01, 0x03, 0x01]);
        assert_eq!(id.to_string(), "05.01.01.01.03.01");
    }
}
