//! Wire protocol framing: raw receiver bytes in, (hex, timestamp) frames out.
//!
//! Three formats:
//! - AVR-style ASCII hex lines (`*8D...;` one per line)
//! - Beast-style binary sync framing (0x1A escape-less variant)
//! - JSON lines with a `hex` field
//!
//! The framer owns a byte buffer that persists across `feed` calls, so a
//! message split by a read boundary reassembles on the next call. Length and
//! hex-digit validation are the classifier's job; the framer only delimits.

use bytes::{Buf, BytesMut};
use serde::Deserialize;

use crate::types::hex_encode;

/// Beast sync byte.
const SYNC: u8 = 0x1A;

/// Beast fixed header after the type byte: 6-byte MLAT counter + 1 signal byte.
const BEAST_HEADER: usize = 7;

/// Cap on buffered bytes awaiting a delimiter. Past this the head of the
/// buffer is garbage with no frame boundary in sight; drop it.
const MAX_BUFFER: usize = 64 * 1024;

/// Wire format spoken by a receiver front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    AvrLines,
    Beast,
    JsonLines,
}

/// A delimited frame: hex payload plus the timestamp it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct WireFrame {
    pub hex: String,
    pub timestamp: f64,
}

/// JSON-line payload shape. Unknown keys are ignored.
#[derive(Deserialize)]
struct JsonLine {
    hex: String,
    timestamp: Option<f64>,
}

/// Incremental frame delimiter for one receiver stream.
pub struct Framer {
    format: WireFormat,
    buf: BytesMut,
    /// Bytes discarded hunting for a sync/delimiter, plus undecodable lines.
    discarded: u64,
}

impl Framer {
    pub fn new(format: WireFormat) -> Self {
        Framer {
            format,
            buf: BytesMut::with_capacity(4096),
            discarded: 0,
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Bytes currently buffered awaiting a frame boundary.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes/lines discarded as unframeable since construction.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Append `data` and return every complete frame now available, stamped
    /// with `now` unless the wire format carries its own timestamp. Trailing
    /// partial bytes are retained for the next call.
    pub fn feed(&mut self, data: &[u8], now: f64) -> Vec<WireFrame> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        match self.format {
            WireFormat::AvrLines => self.split_lines(now, &mut frames, Self::frame_avr),
            WireFormat::JsonLines => self.split_lines(now, &mut frames, Self::frame_json),
            WireFormat::Beast => self.split_beast(now, &mut frames),
        }
        if self.buf.len() > MAX_BUFFER {
            self.discarded += self.buf.len() as u64;
            self.buf.clear();
        }
        frames
    }

    // -- line-oriented formats ----------------------------------------------

    fn split_lines(
        &mut self,
        now: f64,
        out: &mut Vec<WireFrame>,
        parse: fn(&mut Self, &[u8], f64) -> Option<WireFrame>,
    ) {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let line = trim_line(&line);
            if line.is_empty() {
                continue;
            }
            if let Some(frame) = parse(self, line, now) {
                out.push(frame);
            }
        }
    }

    fn frame_avr(&mut self, line: &[u8], now: f64) -> Option<WireFrame> {
        let mut payload = line;
        if payload.first() == Some(&b'*') {
            payload = &payload[1..];
        }
        if payload.last() == Some(&b';') {
            payload = &payload[..payload.len() - 1];
        }
        if payload.is_empty() {
            return None;
        }
        Some(WireFrame {
            hex: String::from_utf8_lossy(payload).into_owned(),
            timestamp: now,
        })
    }

    fn frame_json(&mut self, line: &[u8], now: f64) -> Option<WireFrame> {
        match serde_json::from_slice::<JsonLine>(line) {
            Ok(obj) => Some(WireFrame {
                hex: obj.hex,
                timestamp: obj.timestamp.unwrap_or(now),
            }),
            Err(_) => {
                self.discarded += 1;
                None
            }
        }
    }

    // -- binary sync framing ------------------------------------------------

    fn split_beast(&mut self, now: f64, out: &mut Vec<WireFrame>) {
        loop {
            // Hunt for the sync byte, dropping anything before it.
            match self.buf.iter().position(|&b| b == SYNC) {
                Some(0) => {}
                Some(pos) => {
                    self.discarded += pos as u64;
                    self.buf.advance(pos);
                }
                None => {
                    self.discarded += self.buf.len() as u64;
                    self.buf.clear();
                    return;
                }
            }

            if self.buf.len() < 2 {
                return; // sync seen, type byte not yet arrived
            }

            let payload_len = match self.buf[1] {
                0x32 => 7,
                0x33 => 14,
                // Unrecognized type: step one byte past the sync and
                // resynchronize instead of discarding the buffer.
                _ => {
                    self.discarded += 1;
                    self.buf.advance(1);
                    continue;
                }
            };

            let total = 2 + BEAST_HEADER + payload_len;
            if self.buf.len() < total {
                return; // partial message, wait for more bytes
            }

            let msg = self.buf.split_to(total);
            out.push(WireFrame {
                hex: hex_encode(&msg[2 + BEAST_HEADER..]),
                timestamp: now,
            });
        }
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut s = line;
    while s.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
        s = &s[..s.len() - 1];
    }
    s
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const HEX28: &str = "8D4840D6202CC371C32CE0576098";
    const HEX14: &str = "2000171806A983";

    fn beast_msg(type_byte: u8, payload: &[u8]) -> Vec<u8> {
        let mut msg = vec![SYNC, type_byte];
        msg.extend_from_slice(&[0u8; 6]); // MLAT counter
        msg.push(0x80); // signal byte
        msg.extend_from_slice(payload);
        msg
    }

    #[test]
    fn test_avr_basic() {
        let mut framer = Framer::new(WireFormat::AvrLines);
        let frames = framer.feed(format!("*{HEX28};\n").as_bytes(), 10.0);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].hex, HEX28);
        assert_eq!(frames[0].timestamp, 10.0);
    }

    #[test]
    fn test_avr_bare_and_crlf() {
        let mut framer = Framer::new(WireFormat::AvrLines);
        let frames = framer.feed(format!("{HEX14}\r\n\r\n{HEX28}\n").as_bytes(), 1.0);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].hex, HEX14);
        assert_eq!(frames[1].hex, HEX28);
    }

    #[test]
    fn test_avr_split_mid_line() {
        let mut framer = Framer::new(WireFormat::AvrLines);
        let line = format!("*{HEX28};\n");
        let (a, b) = line.as_bytes().split_at(9);

        assert!(framer.feed(a, 1.0).is_empty());
        assert!(framer.pending() > 0);

        let frames = framer.feed(b, 2.0);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].hex, HEX28);
    }

    #[test]
    fn test_avr_partial_retained_not_duplicated() {
        // Any split point yields the same frames as one-shot delivery.
        let stream = format!("*{HEX28};\n*{HEX14};\n");
        let expected: Vec<String> = {
            let mut f = Framer::new(WireFormat::AvrLines);
            f.feed(stream.as_bytes(), 0.0)
                .into_iter()
                .map(|w| w.hex)
                .collect()
        };
        assert_eq!(expected.len(), 2);

        for split in 1..stream.len() {
            let mut f = Framer::new(WireFormat::AvrLines);
            let (a, b) = stream.as_bytes().split_at(split);
            let mut got: Vec<String> =
                f.feed(a, 0.0).into_iter().map(|w| w.hex).collect();
            got.extend(f.feed(b, 0.0).into_iter().map(|w| w.hex));
            assert_eq!(got, expected, "split at {split}");
        }
    }

    #[test]
    fn test_beast_long_frame() {
        let payload = crate::types::hex_decode(HEX28).unwrap();
        let mut framer = Framer::new(WireFormat::Beast);
        let frames = framer.feed(&beast_msg(0x33, &payload), 5.0);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].hex, HEX28);
    }

    #[test]
    fn test_beast_short_frame() {
        let payload = crate::types::hex_decode(HEX14).unwrap();
        let mut framer = Framer::new(WireFormat::Beast);
        let frames = framer.feed(&beast_msg(0x32, &payload), 5.0);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].hex, HEX14);
    }

    #[test]
    fn test_beast_split_every_boundary() {
        let payload = crate::types::hex_decode(HEX28).unwrap();
        let msg = beast_msg(0x33, &payload);
        for split in 1..msg.len() {
            let mut framer = Framer::new(WireFormat::Beast);
            let (a, b) = msg.split_at(split);
            let mut frames = framer.feed(a, 0.0);
            frames.extend(framer.feed(b, 0.0));
            assert_eq!(frames.len(), 1, "split at {split}");
            assert_eq!(frames[0].hex, HEX28);
        }
    }

    #[test]
    fn test_beast_garbage_before_sync() {
        let payload = crate::types::hex_decode(HEX14).unwrap();
        let mut data = vec![0x00, 0xFF, 0x12];
        data.extend_from_slice(&beast_msg(0x32, &payload));

        let mut framer = Framer::new(WireFormat::Beast);
        let frames = framer.feed(&data, 0.0);
        assert_eq!(frames.len(), 1);
        assert_eq!(framer.discarded(), 3);
    }

    #[test]
    fn test_beast_unknown_type_resyncs_one_byte() {
        let payload = crate::types::hex_decode(HEX14).unwrap();
        // 0x1A followed by an unknown type byte, then a real message. The
        // framer must advance a single byte and recover the real message.
        let mut data = vec![SYNC, 0x99];
        data.extend_from_slice(&beast_msg(0x32, &payload));

        let mut framer = Framer::new(WireFormat::Beast);
        let frames = framer.feed(&data, 0.0);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].hex, HEX14);
    }

    #[test]
    fn test_beast_two_messages_one_feed() {
        let long = crate::types::hex_decode(HEX28).unwrap();
        let short = crate::types::hex_decode(HEX14).unwrap();
        let mut data = beast_msg(0x33, &long);
        data.extend_from_slice(&beast_msg(0x32, &short));

        let mut framer = Framer::new(WireFormat::Beast);
        let frames = framer.feed(&data, 0.0);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].hex, HEX28);
        assert_eq!(frames[1].hex, HEX14);
    }

    #[test]
    fn test_json_line() {
        let mut framer = Framer::new(WireFormat::JsonLines);
        let frames = framer.feed(
            format!("{{\"hex\":\"{HEX28}\",\"timestamp\":123.5}}\n").as_bytes(),
            999.0,
        );
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].hex, HEX28);
        assert_eq!(frames[0].timestamp, 123.5);
    }

    #[test]
    fn test_json_line_arrival_timestamp_default() {
        let mut framer = Framer::new(WireFormat::JsonLines);
        let frames = framer.feed(format!("{{\"hex\":\"{HEX14}\"}}\n").as_bytes(), 42.0);
        assert_eq!(frames[0].timestamp, 42.0);
    }

    #[test]
    fn test_json_malformed_line_dropped() {
        let mut framer = Framer::new(WireFormat::JsonLines);
        let data = format!("not json\n{{\"hex\":\"{HEX14}\"}}\n{{\"other\":1}}\n");
        let frames = framer.feed(data.as_bytes(), 0.0);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].hex, HEX14);
        assert_eq!(framer.discarded(), 2);
    }

    #[test]
    fn test_json_split_mid_object() {
        let mut framer = Framer::new(WireFormat::JsonLines);
        let line = format!("{{\"hex\":\"{HEX28}\"}}\n");
        let (a, b) = line.as_bytes().split_at(12);
        assert!(framer.feed(a, 0.0).is_empty());
        let frames = framer.feed(b, 0.0);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_runaway_buffer_dropped() {
        let mut framer = Framer::new(WireFormat::AvrLines);
        // No newline ever arrives; the buffer must not grow without bound.
        let chunk = [b'A'; 16 * 1024];
        for _ in 0..8 {
            framer.feed(&chunk, 0.0);
        }
        assert!(framer.pending() <= MAX_BUFFER);
    }
}
