//! Validate, classify, and field-decode framed messages.
//!
//! Pipeline per frame:
//! 1. `validate` — 14/28 hex chars, hex digits only, codec checksum
//! 2. category from downlink format (and type code for DF17/18)
//! 3. extract only the fields relevant to that category
//!
//! Field extraction failures are per-field: a message comes back with
//! whatever fields succeeded. Only a frame with no decodable fields at all
//! is an error.

use std::sync::Arc;

use crate::codec::{downlink_format, ModesCodec};
use crate::types::{
    is_hex, DecodedMessage, MessageKind, MsgCategory, RawFrame, Result, SkysiftError,
};

/// Downlink formats classified as surveillance replies (altitude-bearing).
const DF_SURVEILLANCE: &[u8] = &[4, 5, 20, 21];

/// Which validation check a frame failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCheck {
    Length,
    Hex,
    Checksum,
}

pub struct Classifier {
    codec: Arc<dyn ModesCodec>,
}

impl Classifier {
    pub fn new(codec: Arc<dyn ModesCodec>) -> Self {
        Classifier { codec }
    }

    /// Validate a frame's shape and checksum. Returns the raw message bytes,
    /// or the first check that failed.
    pub fn validate(&self, hex: &str) -> std::result::Result<Vec<u8>, FrameCheck> {
        let hex = hex.trim();
        if hex.len() != 14 && hex.len() != 28 {
            return Err(FrameCheck::Length);
        }
        if !is_hex(hex) {
            return Err(FrameCheck::Hex);
        }
        // Both checks above passed, so this cannot fail.
        let raw = crate::types::hex_decode(hex).ok_or(FrameCheck::Hex)?;
        if !self.codec.checksum_ok(&raw) {
            return Err(FrameCheck::Checksum);
        }
        Ok(raw)
    }

    /// Category from downlink format and (for DF17/18) type code.
    pub fn classify(df: u8, type_code: Option<u8>) -> MsgCategory {
        if df == 17 || df == 18 {
            return match type_code {
                Some(1..=4) => MsgCategory::Identification,
                Some(5..=8) => MsgCategory::SurfacePosition,
                Some(9..=18) | Some(20..=22) => MsgCategory::AirbornePosition,
                Some(19) => MsgCategory::Velocity,
                _ => MsgCategory::Unknown,
            };
        }
        if DF_SURVEILLANCE.contains(&df) {
            return MsgCategory::Surveillance;
        }
        MsgCategory::Unknown
    }

    /// Decode a validated frame into a categorized message. The caller maps
    /// [`FrameCheck`] failures onto its own counters via [`Self::validate`];
    /// this method folds them into the error taxonomy.
    pub fn decode(&self, frame: &RawFrame) -> Result<DecodedMessage> {
        let raw = self.validate(&frame.hex).map_err(|check| match check {
            FrameCheck::Length => SkysiftError::BadLength(frame.hex.trim().len()),
            FrameCheck::Hex => SkysiftError::BadHex,
            FrameCheck::Checksum => SkysiftError::ChecksumFailed,
        })?;

        let icao = self
            .codec
            .icao(&raw)
            .ok_or_else(|| SkysiftError::Decode("no ICAO address".into()))?;

        let df = downlink_format(&raw);
        let category = Self::classify(df, self.codec.type_code(&raw));
        let kind = self.extract(category, &raw)?;

        Ok(DecodedMessage {
            icao,
            timestamp: frame.timestamp,
            crc_ok: true,
            kind,
        })
    }

    /// Pull the category-relevant fields. Missing fields are absent, not
    /// fatal; a category whose every field is absent is a dead frame.
    fn extract(&self, category: MsgCategory, raw: &[u8]) -> Result<MessageKind> {
        let kind = match category {
            MsgCategory::Identification => MessageKind::Identification {
                callsign: self
                    .codec
                    .callsign(raw)
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty()),
            },
            MsgCategory::SurfacePosition => MessageKind::SurfacePosition {
                cpr: self.codec.cpr(raw),
                altitude_ft: self.codec.altitude_ft(raw),
            },
            MsgCategory::AirbornePosition => MessageKind::AirbornePosition {
                cpr: self.codec.cpr(raw),
                altitude_ft: self.codec.altitude_ft(raw),
            },
            MsgCategory::Velocity => {
                let v = self.codec.velocity(raw).unwrap_or_default();
                MessageKind::Velocity {
                    ground_speed_kts: v.ground_speed_kts,
                    track_deg: v.track_deg,
                    vertical_rate_fpm: v.vertical_rate_fpm,
                    ias_kts: v.ias_kts,
                    tas_kts: v.tas_kts,
                }
            }
            MsgCategory::Surveillance => MessageKind::Surveillance {
                altitude_ft: self.codec.altitude_ft(raw),
            },
            MsgCategory::Unknown => MessageKind::Unknown,
        };

        if category != MsgCategory::Unknown && kind_is_empty(&kind) {
            return Err(SkysiftError::Decode(format!(
                "no decodable fields in {category} message"
            )));
        }
        Ok(kind)
    }
}

fn kind_is_empty(kind: &MessageKind) -> bool {
    match kind {
        MessageKind::Identification { callsign } => callsign.is_none(),
        MessageKind::SurfacePosition { cpr, altitude_ft }
        | MessageKind::AirbornePosition { cpr, altitude_ft } => {
            cpr.is_none() && altitude_ft.is_none()
        }
        MessageKind::Velocity {
            ground_speed_kts,
            track_deg,
            vertical_rate_fpm,
            ias_kts,
            tas_kts,
        } => {
            ground_speed_kts.is_none()
                && track_deg.is_none()
                && vertical_rate_fpm.is_none()
                && ias_kts.is_none()
                && tas_kts.is_none()
        }
        MessageKind::Surveillance { altitude_ft } => altitude_ft.is_none(),
        MessageKind::Unknown => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
