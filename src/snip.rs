/*! Simple Node Information Protocol accumulator.

A [`Snip`] is a fixed 253-byte buffer: a version byte, four
null-terminated identity strings, a second version byte, and two more
null-terminated strings, per spec.md §3/§6:

```text
[0x04][mfg\0][model\0][hwVer\0][swVer\0][0x02][userName\0][userDesc\0]
```

It can be built in one shot with [`Snip::write`] (this node describing
itself) or accumulated byte-by-byte with [`Snip::add_data`] (this node
reading a peer's SNIP off the wire, typically via the memory service).
Either way the six strings are re-derived from the buffer on every
read; nothing is cached.
*/
use log::warn;

use crate::memory::{array_to_string, string_to_array};

/// Total SNIP buffer size.
pub const LEN: usize = 253;

/// `(offset, field length including its trailing NUL)` for the six
/// strings, in order: mfg, model, hwVersion, swVersion, userName,
/// userDescription.
const FIELDS: [(usize, usize); 6] = [(1, 41), (42, 41), (83, 21), (104, 21), (126, 63), (189, 64)];

const VERSION1_OFFSET: usize = 0;
const VERSION2_OFFSET: usize = 125;
const VERSION1: u8 = 4;
const VERSION2: u8 = 2;

/// A 253-byte SNIP buffer.
pub struct Snip {
    buf: [u8; LEN],
    cursor: usize,
}

impl Snip {
    /// An empty accumulator, ready for [`Snip::add_data`]. Used when
    /// this node is reading a peer's SNIP off the wire, where the
    /// version bytes arrive as part of the stream rather than being
    /// set locally.
    pub fn new() -> Self {
        Self {
            buf: [0; LEN],
            cursor: 0,
        }
    }

    /// Build a complete SNIP in one shot, the way a node describes
    /// itself. Each string is truncated at the byte boundary after
    /// UTF-8 encoding if it doesn't fit its field.
    pub fn write(mfg: &str, model: &str, hw_version: &str, sw_version: &str, user_name: &str, user_desc: &str) -> Self {
        let mut s = Self::new();
        s.buf[VERSION1_OFFSET] = VERSION1;
        s.buf[VERSION2_OFFSET] = VERSION2;
        s.write_field(0, mfg);
        s.write_field(1, model);
        s.write_field(2, hw_version);
        s.write_field(3, sw_version);
        s.write_field(4, user_name);
        s.write_field(5, user_desc);
        s.cursor = LEN;
        s
    }

    fn write_field(&mut self, n: usize, s: &str) {
        let (offset, field_len) = FIELDS[n];
        let content_max = field_len - 1;
        let encoded = string_to_array(s, content_max.min(s.len()));
        if s.as_bytes().len() > content_max {
            warn!("snip: field {n} truncated to {content_max} bytes");
        }
        self.buf[offset..offset + encoded.len()].copy_from_slice(&encoded);
        // Remaining bytes in the field, including the terminator, stay
        // zero from initialization.
    }

    /// Append bytes to the write cursor, as when streaming a SNIP read
    /// in off the wire. Bytes past the fixed 253-byte region are
    /// logged and dropped.
    pub fn add_data(&mut self, bytes: &[u8]) {
        let avail = LEN.saturating_sub(self.cursor);
        if avail == 0 {
            if !bytes.is_empty() {
                warn!("snip: add_data called on a full buffer, dropping {} bytes", bytes.len());
            }
            return;
        }
        let n = bytes.len().min(avail);
        self.buf[self.cursor..self.cursor + n].copy_from_slice(&bytes[..n]);
        self.cursor += n;
        if n < bytes.len() {
            warn!("snip: add_data overflowed the buffer, dropping {} bytes", bytes.len() - n);
        }
    }

    /// The *n*-th string (0-indexed: mfg, model, hwVersion, swVersion,
    /// userName, userDescription), scanning for its terminator.
    pub fn get_string_n(&self, n: usize) -> String {
        let (offset, field_len) = FIELDS[n];
        array_to_string(&self.buf[offset..offset + field_len], field_len)
    }

    /// Manufacturer name.
    pub fn mfg_name(&self) -> String {
        self.get_string_n(0)
    }

    /// Model name.
    pub fn model_name(&self) -> String {
        self.get_string_n(1)
    }

    /// Hardware version string.
    pub fn hw_version(&self) -> String {
        self.get_string_n(2)
    }

    /// Software version string.
    pub fn sw_version(&self) -> String {
        self.get_string_n(3)
    }

    /// User-assigned node name.
    pub fn user_name(&self) -> String {
        self.get_string_n(4)
    }

    /// User-assigned node description.
    pub fn user_description(&self) -> String {
        self.get_string_n(5)
    }

    /// The raw 253-byte buffer.
    pub fn buffer(&self) -> &[u8; LEN] {
        &self.buf
    }
}

impl Default for Snip {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// spec.md §8 S5.
    #[test]
    fn round_trip_s5() {
        let snip = Snip::write("Дмитрий", "model", "hw1", "sw1", "user", "desc");
        assert_eq!(snip.get_string_n(0), "Дмитрий");
        assert_eq!(snip.buffer().len(), LEN);
        assert_eq!(snip.buffer()[0], 4);
        assert_eq!(snip.buffer()[125], 2);
    }

    #[test]
    fn named_accessors_match_positional() {
        let snip = Snip::write("mfg", "model", "hw", "sw", "user", "desc");
        assert_eq!(snip.mfg_name(), snip.get_string_n(0));
        assert_eq!(snip.model_name(), snip.get_string_n(1));
        assert_eq!(snip.hw_version(), snip.get_string_n(2));
        assert_eq!(snip.sw_version(), snip.get_string_n(3));
        assert_eq!(snip.user_name(), snip.get_string_n(4));
        assert_eq!(snip.user_description(), snip.get_string_n(5));
        assert_eq!(snip.user_name(), "user");
        assert_eq!(snip.user_description(), "desc");
    }

    #[test]
    fn add_data_streaming_matches_write() {
        let direct = Snip::write("mfg", "model", "1.0", "2.0", "me", "my node");
        let mut streamed = Snip::new();
        for chunk in direct.buffer().chunks(7) {
            streamed.add_data(chunk);
        }
        assert_eq!(streamed.buffer(), direct.buffer());
        assert_eq!(streamed.mfg_name(), "mfg");
    }

    #[test]
    fn add_data_past_end_is_dropped_not_fatal() {
        let mut snip = Snip::new();
        snip.add_data(&[0; LEN]);
        snip.add_data(&[0xFF; 10]);
        assert_eq!(snip.buffer().len(), LEN);
    }

    #[test]
    fn oversized_field_is_truncated() {
        let long = "x".repeat(100);
        let snip = Snip::write(&long, "", "", "", "", "");
        assert_eq!(snip.mfg_name().len(), 40);
    }

    #[test]
    fn empty_fields_round_trip_as_empty_strings() {
        let snip = Snip::write("", "", "", "", "", "");
        for n in 0..6 {
            assert_eq!(snip.get_string_n(n), "");
        }
    }
}
