//! Shared types, error enum, and decoded message types for skysift-core.

use serde::Serialize;
use thiserror::Error;

/// All errors produced by skysift-core.
#[derive(Debug, Error)]
pub enum SkysiftError {
    #[error("invalid frame length: {0} hex chars")]
    BadLength(usize),
    #[error("non-hex character in frame")]
    BadHex,
    #[error("checksum validation failed")]
    ChecksumFailed,
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SkysiftError>;

// ---------------------------------------------------------------------------
// ICAO address helpers
// ---------------------------------------------------------------------------

/// 3-byte ICAO address. Stored as raw bytes to avoid per-message String
/// allocation on the hot path.
pub type Icao = [u8; 3];

/// Format ICAO address as 6-char uppercase hex string.
pub fn icao_to_string(icao: &Icao) -> String {
    format!("{:02X}{:02X}{:02X}", icao[0], icao[1], icao[2])
}

/// Parse a 6-char hex string into an ICAO address.
pub fn icao_from_hex(hex: &str) -> Option<Icao> {
    if hex.len() != 6 {
        return None;
    }
    let val = u32::from_str_radix(hex, 16).ok()?;
    Some([(val >> 16) as u8, (val >> 8) as u8, val as u8])
}

// ---------------------------------------------------------------------------
// Hex utilities
// ---------------------------------------------------------------------------

/// Decode a hex string into bytes. Case-insensitive, must be even length.
pub fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    let hex = hex.trim();
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for pair in hex.as_bytes().chunks(2) {
        let hi = hex_digit(pair[0])?;
        let lo = hex_digit(pair[1])?;
        bytes.push((hi << 4) | lo);
    }
    Some(bytes)
}

/// Encode bytes as uppercase hex string.
pub fn hex_encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for &b in data {
        s.push(HEX_CHARS[(b >> 4) as usize] as char);
        s.push(HEX_CHARS[(b & 0x0F) as usize] as char);
    }
    s
}

const HEX_CHARS: &[u8; 16] = b"0123456789ABCDEF";

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// True if every character is a hex digit.
pub fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|c| hex_digit(c).is_some())
}

// ---------------------------------------------------------------------------
// Raw frames
// ---------------------------------------------------------------------------

/// Identifier of the receiver a frame arrived from (registry slot index).
pub type SourceId = usize;

/// A framed but not yet validated message: hex payload plus arrival metadata.
/// Ephemeral — consumed immediately by the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub hex: String,
    /// Unix timestamp (seconds) at arrival, or as carried by the wire format.
    pub timestamp: f64,
    pub source: SourceId,
}

// ---------------------------------------------------------------------------
// Message categories
// ---------------------------------------------------------------------------

/// Semantic category assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgCategory {
    Identification,
    SurfacePosition,
    AirbornePosition,
    Velocity,
    Surveillance,
    Unknown,
}

impl std::fmt::Display for MsgCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MsgCategory::Identification => write!(f, "identification"),
            MsgCategory::SurfacePosition => write!(f, "surface_position"),
            MsgCategory::AirbornePosition => write!(f, "airborne_position"),
            MsgCategory::Velocity => write!(f, "velocity"),
            MsgCategory::Surveillance => write!(f, "surveillance"),
            MsgCategory::Unknown => write!(f, "unknown"),
        }
    }
}

// ---------------------------------------------------------------------------
// Decoded messages
// ---------------------------------------------------------------------------

/// Raw 17-bit CPR coordinates plus parity, as carried by a position message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CprFields {
    pub lat: u32,
    pub lon: u32,
    pub odd: bool,
}

/// Category-specific fields. Each variant carries only the fields valid for
/// its category; a field that failed to extract is simply absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    Identification {
        callsign: Option<String>,
    },
    SurfacePosition {
        cpr: Option<CprFields>,
        altitude_ft: Option<i32>,
    },
    AirbornePosition {
        cpr: Option<CprFields>,
        altitude_ft: Option<i32>,
    },
    Velocity {
        ground_speed_kts: Option<f64>,
        track_deg: Option<f64>,
        vertical_rate_fpm: Option<i32>,
        ias_kts: Option<f64>,
        tas_kts: Option<f64>,
    },
    Surveillance {
        altitude_ft: Option<i32>,
    },
    Unknown,
}

impl MessageKind {
    pub fn category(&self) -> MsgCategory {
        match self {
            MessageKind::Identification { .. } => MsgCategory::Identification,
            MessageKind::SurfacePosition { .. } => MsgCategory::SurfacePosition,
            MessageKind::AirbornePosition { .. } => MsgCategory::AirbornePosition,
            MessageKind::Velocity { .. } => MsgCategory::Velocity,
            MessageKind::Surveillance { .. } => MsgCategory::Surveillance,
            MessageKind::Unknown => MsgCategory::Unknown,
        }
    }

    /// CPR fields for the position categories, `None` otherwise.
    pub fn cpr(&self) -> Option<&CprFields> {
        match self {
            MessageKind::SurfacePosition { cpr, .. }
            | MessageKind::AirbornePosition { cpr, .. } => cpr.as_ref(),
            _ => None,
        }
    }
}

/// A validated, classified, field-decoded message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedMessage {
    pub icao: Icao,
    pub timestamp: f64,
    /// CRC verdict from the external decode capability.
    pub crc_ok: bool,
    pub kind: MessageKind,
}

impl DecodedMessage {
    pub fn category(&self) -> MsgCategory {
        self.kind.category()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icao_roundtrip() {
        let icao = icao_from_hex("4840D6").unwrap();
        assert_eq!(icao, [0x48, 0x40, 0xD6]);
        assert_eq!(icao_to_string(&icao), "4840D6");
    }

    #[test]
    fn test_icao_from_hex_rejects() {
        assert!(icao_from_hex("4840D").is_none());
        assert!(icao_from_hex("ZZZZZZ").is_none());
    }

    #[test]
    fn test_hex_decode() {
        assert_eq!(hex_decode("4840d6"), Some(vec![0x48, 0x40, 0xD6]));
        assert_eq!(hex_decode("484"), None); // odd length
        assert_eq!(hex_decode("48ZZ"), None); // invalid chars
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x48, 0x40, 0xD6]), "4840D6");
    }

    #[test]
    fn test_is_hex() {
        assert!(is_hex("8D4840D6"));
        assert!(!is_hex("8D4840G6"));
        assert!(!is_hex(""));
    }

    #[test]
    fn test_kind_category() {
        let kind = MessageKind::Identification {
            callsign: Some("KLM1023".into()),
        };
        assert_eq!(kind.category(), MsgCategory::Identification);
        assert_eq!(MessageKind::Unknown.category(), MsgCategory::Unknown);
    }

    #[test]
    fn test_kind_cpr_accessor() {
        let cpr = CprFields {
            lat: 93000,
            lon: 51372,
            odd: false,
        };
        let kind = MessageKind::AirbornePosition {
            cpr: Some(cpr),
            altitude_ft: Some(38000),
        };
        assert_eq!(kind.cpr(), Some(&cpr));
        assert_eq!(MessageKind::Unknown.cpr(), None);
    }

    #[test]
    fn test_category_display() {
        assert_eq!(MsgCategory::SurfacePosition.to_string(), "surface_position");
    }
}
