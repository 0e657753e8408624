//! CPR position resolution policy: per-aircraft even/odd frame caching,
//! global-then-local resolution, staleness windows, bounds checking.
//!
//! The CPR arithmetic itself (zone tables, pair decode, local decode) is the
//! external codec's. This module decides *when* each decode is attempted and
//! whether the answer is fit to surface.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::codec::ModesCodec;
use crate::types::{CprFields, Icao};

/// Staleness windows and the optional reference anchor for local decode.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CprConfig {
    /// Max age difference of an airborne even/odd pair (seconds).
    pub airborne_global_s: f64,
    /// Max age difference of a surface even/odd pair (seconds).
    pub surface_global_s: f64,
    /// Max age of the newest airborne frame for local decode (seconds).
    pub airborne_local_s: f64,
    /// Max age of the newest surface frame for local decode (seconds).
    pub surface_local_s: f64,
    /// Receiver location. Without it, local decode is skipped entirely.
    pub reference: Option<(f64, f64)>,
}

impl Default for CprConfig {
    fn default() -> Self {
        CprConfig {
            airborne_global_s: 10.0,
            surface_global_s: 5.0,
            airborne_local_s: 60.0,
            surface_local_s: 30.0,
            reference: None,
        }
    }
}

/// One cached CPR half-frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CprSlot {
    pub lat: u32,
    pub lon: u32,
    pub timestamp: f64,
}

/// Even/odd slot pair for one aircraft. Never more than these two entries.
#[derive(Debug, Clone, Copy, Default)]
struct SlotPair {
    even: Option<CprSlot>,
    odd: Option<CprSlot>,
}

/// A resolved geographic position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPosition {
    pub lat: f64,
    pub lon: f64,
    /// True when resolved from an even/odd pair, false for local decode.
    pub global: bool,
}

pub struct CprResolver {
    codec: Arc<dyn ModesCodec>,
    config: CprConfig,
    cache: HashMap<Icao, SlotPair>,
}

impl CprResolver {
    pub fn new(codec: Arc<dyn ModesCodec>, config: CprConfig) -> Self {
        CprResolver {
            codec,
            config,
            cache: HashMap::new(),
        }
    }

    /// Record a position-bearing frame and attempt resolution.
    ///
    /// The matching-parity slot is overwritten unconditionally (newest wins).
    /// Resolution order: global pair decode when both slots are fresh enough,
    /// else local decode against the configured reference, else nothing.
    /// Out-of-bounds answers are discarded, never surfaced.
    pub fn update(
        &mut self,
        icao: Icao,
        cpr: &CprFields,
        surface: bool,
        timestamp: f64,
    ) -> Option<ResolvedPosition> {
        let pair = self.cache.entry(icao).or_default();
        let slot = CprSlot {
            lat: cpr.lat,
            lon: cpr.lon,
            timestamp,
        };
        if cpr.odd {
            pair.odd = Some(slot);
        } else {
            pair.even = Some(slot);
        }
        let pair = *pair;

        let global_window = if surface {
            self.config.surface_global_s
        } else {
            self.config.airborne_global_s
        };

        if let (Some(even), Some(odd)) = (pair.even, pair.odd) {
            if (even.timestamp - odd.timestamp).abs() <= global_window {
                let newest_is_odd = odd.timestamp >= even.timestamp;
                if let Some((lat, lon)) = self.codec.cpr_global(
                    (even.lat, even.lon),
                    (odd.lat, odd.lon),
                    newest_is_odd,
                    surface,
                ) {
                    if in_bounds(lat, lon) {
                        return Some(ResolvedPosition {
                            lat,
                            lon,
                            global: true,
                        });
                    }
                }
            }
        }

        self.resolve_local(&pair, surface, timestamp)
    }

    fn resolve_local(
        &self,
        pair: &SlotPair,
        surface: bool,
        now: f64,
    ) -> Option<ResolvedPosition> {
        let (ref_lat, ref_lon) = self.config.reference?;

        let local_window = if surface {
            self.config.surface_local_s
        } else {
            self.config.airborne_local_s
        };

        // Anchor on the newest frame of either parity.
        let (slot, odd) = match (pair.even, pair.odd) {
            (Some(e), Some(o)) => {
                if o.timestamp >= e.timestamp {
                    (o, true)
                } else {
                    (e, false)
                }
            }
            (Some(e), None) => (e, false),
            (None, Some(o)) => (o, true),
            (None, None) => return None,
        };

        if now - slot.timestamp > local_window {
            return None;
        }

        let (lat, lon) = self
            .codec
            .cpr_local(slot.lat, slot.lon, odd, surface, ref_lat, ref_lon)?;
        if !in_bounds(lat, lon) {
            return None;
        }
        Some(ResolvedPosition {
            lat,
            lon,
            global: false,
        })
    }

    /// Drop the cache entry for an aircraft (on expiry/eviction).
    pub fn remove(&mut self, icao: &Icao) {
        self.cache.remove(icao);
    }

    /// Drop slots too old to ever resolve again; drop emptied entries.
    pub fn prune(&mut self, now: f64) {
        let max_age = self
            .config
            .airborne_local_s
            .max(self.config.surface_local_s);
        self.cache.retain(|_, pair| {
            if let Some(s) = pair.even {
                if now - s.timestamp > max_age {
                    pair.even = None;
                }
            }
            if let Some(s) = pair.odd {
                if now - s.timestamp > max_age {
                    pair.odd = None;
                }
            }
            pair.even.is_some() || pair.odd.is_some()
        });
    }

    /// Number of aircraft with at least one cached half-frame.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

fn in_bounds(lat: f64, lon: f64) -> bool {
    (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
