/*! GridConnect ASCII <-> binary CAN frame codec.

Wire shape (spec.md §4.1/§6):

```text
:X1910ABCN0102030405060708;
```

`:` start, `X`/`S` (extended/standard addressing), hex header, `N`,
even-count hex data (0-16 chars), `;`, and (on the wire) a trailing
newline. Decoding tolerates interleaved whitespace and lower-case hex;
anything else is a [`Error::MalformedFrame`].

[`GridConnectDecoder`] is the streaming half: `receive_string` appends
into an internal accumulator and splits complete frames off of it,
leaving a partial trailing frame buffered for the next call — the same
accumulate-then-split shape as the teacher's `hdlc_deframer.rs`, but
framed by ASCII `:`/`;` delimiters instead of HDLC bit-stuffing.
*/
use crate::error::Error;
use crate::frame::CanFrame;

/// Longest legal single ASCII frame: `:X` + 8 header hex + `N` + 16 data
/// hex + `;` = 28 bytes. Used to size the decoder's bounded buffer.
const MAX_FRAME_CHARS: usize = 28;

/// The decoder's accumulator is dropped and [`Error::FramingLost`] is
/// reported once it exceeds this many bytes without completing a frame.
const MAX_BUFFER: usize = MAX_FRAME_CHARS * 4;

/// Encode one frame as GridConnect ASCII, including the trailing
/// newline that appears on the wire.
pub fn send(frame: &CanFrame) -> Vec<u8> {
    let mut out = String::with_capacity(MAX_FRAME_CHARS + 1);
    out.push(':');
    out.push('X');
    out.push_str(&format!("{:08X}", frame.header));
    out.push('N');
    for b in &frame.data {
        out.push_str(&format!("{b:02X}"));
    }
    out.push(';');
    out.push('\n');
    out.into_bytes()
}

/// Decode a single GridConnect ASCII frame (without the trailing
/// newline, which the caller may or may not have stripped).
pub fn decode_one(s: &str) -> Result<CanFrame, Error> {
    let s = s.trim();
    let rest = s
        .strip_prefix(':')
        .ok_or_else(|| Error::MalformedFrame(format!("missing ':' in {s:?}")))?;
    let mut chars = rest.chars();
    let marker = chars
        .next()
        .ok_or_else(|| Error::MalformedFrame("empty frame after ':'".into()))?;
    if !matches!(marker, 'X' | 'x' | 'S' | 's') {
        return Err(Error::MalformedFrame(format!(
            "unknown frame marker {marker:?}"
        )));
    }
    let rest: String = chars.collect();
    let (header_hex, rest) = rest
        .split_once('N')
        .or_else(|| rest.split_once('n'))
        .ok_or_else(|| Error::MalformedFrame(format!("missing 'N' in {s:?}")))?;
    let data_hex = rest
        .strip_suffix(';')
        .ok_or_else(|| Error::MalformedFrame(format!("missing ';' in {s:?}")))?;
    if data_hex.len() % 2 != 0 {
        return Err(Error::MalformedFrame(format!(
            "odd number of data hex digits in {s:?}"
        )));
    }
    let header = u32::from_str_radix(header_hex, 16)
        .map_err(|_| Error::MalformedFrame(format!("bad header hex {header_hex:?}")))?;
    let mut data = Vec::with_capacity(data_hex.len() / 2);
    for chunk in data_hex.as_bytes().chunks(2) {
        let byte_str = std::str::from_utf8(chunk).unwrap();
        let byte = u8::from_str_radix(byte_str, 16)
            .map_err(|_| Error::MalformedFrame(format!("bad data hex {byte_str:?}")))?;
        data.push(byte);
    }
    CanFrame::new(header, data)
}

/// Streaming GridConnect decoder.
///
/// Feed it arbitrary chunks of bytes as they arrive from the transport;
/// it returns the frames that completed during that call, in order.
pub struct GridConnectDecoder {
    buf: String,
}

impl GridConnectDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self { buf: String::new() }
    }

    /// Feed a chunk of bytes, returning any frames it completed.
    ///
    /// Partial trailing data is kept for the next call. If the
    /// accumulator grows past the bounded size without ever completing a
    /// frame, it is dropped and [`Error::FramingLost`] is returned; the
    /// decoder is left empty and can keep being used.
    pub fn receive_string(&mut self, chunk: &[u8]) -> Result<Vec<CanFrame>, Error> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.find(';') {
            let candidate: String = self.buf.drain(..=pos).collect();
            match decode_one(&candidate) {
                Ok(f) => frames.push(f),
                Err(e) => {
                    log::warn!("gridconnect: dropping malformed frame {candidate:?}: {e}");
                }
            }
        }
        if self.buf.len() > MAX_BUFFER {
            log::warn!(
                "gridconnect: receive buffer exceeded {MAX_BUFFER} bytes without a complete frame, dropping"
            );
            self.buf.clear();
            return Err(Error::FramingLost);
        }
        Ok(frames)
    }
}

impl Default for GridConnectDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{MTI, build_header};

    #[test]
    fn encode_basic() {
        let frame = CanFrame::new(build_header(0, MTI::Datagram.value(), 0xABC), vec![1, 2]).unwrap();
        let ascii = String::from_utf8(send(&frame)).unwrap();
        assert_has_expected_shape(&ascii, &frame);
    }

    fn assert_has_expected_shape(ascii: &str, frame: &CanFrame) {
        assert!(ascii.starts_with(":X"));
        assert!(ascii.ends_with(";\n"));
        let back = decode_one(ascii.trim()).unwrap();
        assert_eq!(&back, frame);
    }

    #[test]
    fn encode_decode_identity() {
        let frame = CanFrame::new(0x1234_5678 & 0x1FFF_FFFF, vec![0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        let ascii = send(&frame);
        let s = String::from_utf8(ascii).unwrap();
        let back = decode_one(s.trim()).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn decode_lower_case_and_whitespace() {
        let frame = decode_one("  :x00001000n0a0b;  ").unwrap();
        assert_eq!(frame.header, 0x0000_1000);
        assert_eq!(frame.data, vec![0x0A, 0x0B]);
    }

    #[test]
    fn decode_rejects_odd_data_digits() {
        assert!(decode_one(":X00001000N0A0;").is_err());
    }

    #[test]
    fn decode_rejects_missing_colon() {
        assert!(decode_one("X00001000N0A0B;").is_err());
    }

    #[test]
    fn decode_rejects_missing_semicolon() {
        assert!(decode_one(":X00001000N0A0B").is_err());
    }

    #[test]
    fn streaming_split_frames() {
        let mut dec = GridConnectDecoder::new();
        let frames = dec
            .receive_string(b":X00001000N0A0B;:X00001001N0C0D;")
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, vec![0x0A, 0x0B]);
        assert_eq!(frames[1].data, vec![0x0C, 0x0D]);
    }

    #[test]
    fn streaming_partial_frame_buffered() {
        let mut dec = GridConnectDecoder::new();
        assert!(dec.receive_string(b":X00001000N0A").unwrap().is_empty());
        let frames = dec.receive_string(b"0B;").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, vec![0x0A, 0x0B]);
    }

    #[test]
    fn streaming_malformed_frame_is_dropped_not_fatal() {
        let mut dec = GridConnectDecoder::new();
        let frames = dec
            .receive_string(b":GARBAGE;:X00001000N0A0B;")
            .unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn streaming_overflow_reports_framing_lost() {
        let mut dec = GridConnectDecoder::new();
        let junk = vec![b'A'; MAX_BUFFER + 1];
        let err = dec.receive_string(&junk).unwrap_err();
        assert!(matches!(err, Error::FramingLost));
        // Decoder recovers and can be used again.
        let frames = dec.receive_string(b":X00001000N0A0B;").unwrap();
        assert_eq!(frames.len(), 1);
    }
}
