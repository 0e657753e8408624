//! Live aircraft state: one record per ICAO, merged from decoded messages.
//!
//! The map lives behind this store's API — create/merge/expire/evict — and
//! nothing outside mutates entries directly. Conflict checking runs before
//! every merge and flags implausible jumps, but the policy is prefer-newest:
//! a flagged update is still applied, the flag is recorded for observability.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::{DecodedMessage, Icao, MessageKind, MsgCategory};

/// Capacity, expiry, and plausibility settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Hard cap on tracked aircraft; crossing it triggers batch eviction.
    pub max_aircraft: usize,
    /// Eviction drains down to this fraction of `max_aircraft`.
    pub evict_target: f64,
    /// Expiry timeout for aircraft last seen on the surface (seconds).
    pub surface_expiry_s: f64,
    /// Expiry timeout for airborne aircraft (seconds).
    pub airborne_expiry_s: f64,
    /// Expiry timeout when no position category has been seen (seconds).
    pub default_expiry_s: f64,
    /// Implied ground speed above this flags a position conflict (knots).
    pub max_speed_kts: f64,
    /// Implied altitude rate above this flags a conflict (ft/min).
    pub max_altitude_rate_fpm: f64,
    /// Below this elapsed time the rate checks are skipped (seconds).
    pub min_conflict_elapsed_s: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            max_aircraft: 500,
            evict_target: 0.7,
            surface_expiry_s: 30.0,
            airborne_expiry_s: 120.0,
            default_expiry_s: 60.0,
            max_speed_kts: 1200.0,
            max_altitude_rate_fpm: 12000.0,
            min_conflict_elapsed_s: 1.0,
        }
    }
}

/// A resolved position attached to an aircraft.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    pub timestamp: f64,
}

/// A plausibility flag raised by `conflict_check`. Not an error: the update
/// that raised it is applied anyway.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conflict {
    ImplausibleSpeed { implied_kts: f64 },
    ImplausibleClimb { implied_fpm: f64 },
    CallsignChange { previous: String, new: String },
}

/// Mutable state for a single tracked aircraft.
#[derive(Debug, Clone, Serialize)]
pub struct AircraftState {
    pub icao: Icao,
    pub first_seen: f64,
    pub last_seen: f64,

    pub callsign: Option<String>,
    pub position: Option<Position>,
    pub altitude_ft: Option<i32>,

    pub ground_speed_kts: Option<f64>,
    pub track_deg: Option<f64>,
    pub vertical_rate_fpm: Option<i32>,
    pub ias_kts: Option<f64>,
    pub tas_kts: Option<f64>,

    pub message_count: u64,
    /// Every category that has contributed at least one message.
    pub categories: BTreeSet<MsgCategory>,
    /// Position category of the most recent position-bearing message;
    /// selects the expiry timeout.
    pub last_position_category: Option<MsgCategory>,
    pub conflict_count: u64,
    /// Set by the watchlist collaborator, never written by the store.
    pub watchlisted: bool,
}

impl AircraftState {
    fn new(icao: Icao, now: f64) -> Self {
        AircraftState {
            icao,
            first_seen: now,
            last_seen: now,
            callsign: None,
            position: None,
            altitude_ft: None,
            ground_speed_kts: None,
            track_deg: None,
            vertical_rate_fpm: None,
            ias_kts: None,
            tas_kts: None,
            message_count: 0,
            categories: BTreeSet::new(),
            last_position_category: None,
            conflict_count: 0,
            watchlisted: false,
        }
    }

    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }

    pub fn age(&self, now: f64) -> f64 {
        now - self.last_seen
    }

    /// Fold a decoded message in. Only fields present in the message are
    /// overwritten; `last_seen` never regresses; `message_count` only grows.
    pub fn merge(&mut self, msg: &DecodedMessage, position: Option<(f64, f64)>, now: f64) {
        match &msg.kind {
            MessageKind::Identification { callsign } => {
                if let Some(cs) = callsign {
                    self.callsign = Some(cs.clone());
                }
            }
            MessageKind::SurfacePosition { altitude_ft, .. }
            | MessageKind::AirbornePosition { altitude_ft, .. } => {
                if let Some(alt) = altitude_ft {
                    self.altitude_ft = Some(*alt);
                }
                self.last_position_category = Some(msg.category());
            }
            MessageKind::Velocity {
                ground_speed_kts,
                track_deg,
                vertical_rate_fpm,
                ias_kts,
                tas_kts,
            } => {
                if let Some(v) = ground_speed_kts {
                    self.ground_speed_kts = Some(*v);
                }
                if let Some(v) = track_deg {
                    self.track_deg = Some(*v);
                }
                if let Some(v) = vertical_rate_fpm {
                    self.vertical_rate_fpm = Some(*v);
                }
                if let Some(v) = ias_kts {
                    self.ias_kts = Some(*v);
                }
                if let Some(v) = tas_kts {
                    self.tas_kts = Some(*v);
                }
            }
            MessageKind::Surveillance { altitude_ft } => {
                if let Some(alt) = altitude_ft {
                    self.altitude_ft = Some(*alt);
                }
            }
            MessageKind::Unknown => {}
        }

        if let Some((lat, lon)) = position {
            self.position = Some(Position {
                lat,
                lon,
                timestamp: now,
            });
        }

        self.last_seen = self.last_seen.max(now);
        self.message_count += 1;
        self.categories.insert(msg.category());
    }
}

/// Outcome of applying one message.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub created: bool,
    pub conflicts: Vec<Conflict>,
}

/// Monotonic event counters, reset on the reporting interval.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreCounters {
    pub created: u64,
    pub conflicts: u64,
    pub expired: u64,
    pub evicted: u64,
}

pub struct AircraftStore {
    config: StoreConfig,
    aircraft: HashMap<Icao, AircraftState>,
    counters: StoreCounters,
}

impl AircraftStore {
    pub fn new(config: StoreConfig) -> Self {
        AircraftStore {
            config,
            aircraft: HashMap::new(),
            counters: StoreCounters::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.aircraft.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aircraft.is_empty()
    }

    pub fn get(&self, icao: &Icao) -> Option<&AircraftState> {
        self.aircraft.get(icao)
    }

    /// Existing state, or a fresh record with first_seen = last_seen = now.
    pub fn get_or_create(&mut self, icao: Icao, now: f64) -> &mut AircraftState {
        self.aircraft.entry(icao).or_insert_with(|| {
            AircraftState::new(icao, now)
        })
    }

    /// Conflict-check then merge one decoded message. The conflicts, if any,
    /// are recorded on the state and in the counters; the update is applied
    /// regardless (prefer-newest).
    pub fn apply(
        &mut self,
        msg: &DecodedMessage,
        position: Option<(f64, f64)>,
        now: f64,
    ) -> ApplyOutcome {
        let conflicts = match self.aircraft.get(&msg.icao) {
            Some(state) => self.conflict_check(state, msg, position, now),
            None => Vec::new(),
        };
        let created = !self.aircraft.contains_key(&msg.icao);
        if created {
            self.counters.created += 1;
        }
        self.counters.conflicts += conflicts.len() as u64;

        let state = self.get_or_create(msg.icao, now);
        state.merge(msg, position, now);
        state.conflict_count += conflicts.len() as u64;

        ApplyOutcome { created, conflicts }
    }

    /// Plausibility checks against the existing state. Never blocks the
    /// update; the caller decides what to do with the flags.
    pub fn conflict_check(
        &self,
        state: &AircraftState,
        msg: &DecodedMessage,
        position: Option<(f64, f64)>,
        now: f64,
    ) -> Vec<Conflict> {
        let mut conflicts = Vec::new();
        let elapsed = now - state.last_seen;

        if elapsed >= self.config.min_conflict_elapsed_s {
            if let (Some(prev), Some((lat, lon))) = (state.position, position) {
                let dist_nm = haversine_nm(prev.lat, prev.lon, lat, lon);
                let implied_kts = dist_nm / (elapsed / 3600.0);
                if implied_kts > self.config.max_speed_kts {
                    conflicts.push(Conflict::ImplausibleSpeed { implied_kts });
                }
            }

            if let (Some(prev_alt), Some(new_alt)) = (state.altitude_ft, msg_altitude(msg)) {
                let implied_fpm = ((new_alt - prev_alt).abs() as f64) / (elapsed / 60.0);
                if implied_fpm > self.config.max_altitude_rate_fpm {
                    conflicts.push(Conflict::ImplausibleClimb { implied_fpm });
                }
            }
        }

        if let MessageKind::Identification {
            callsign: Some(new),
        } = &msg.kind
        {
            if let Some(prev) = state.callsign.as_deref() {
                if !prev.is_empty() && prev != new {
                    conflicts.push(Conflict::CallsignChange {
                        previous: prev.to_string(),
                        new: new.clone(),
                    });
                }
            }
        }

        conflicts
    }

    /// Remove aircraft silent longer than their category timeout. Returns
    /// the removed ICAOs so the caller can clear CPR cache entries.
    pub fn expire(&mut self, now: f64) -> Vec<Icao> {
        let config = &self.config;
        let expired: Vec<Icao> = self
            .aircraft
            .iter()
            .filter(|(_, state)| state.age(now) > expiry_timeout(config, state))
            .map(|(icao, _)| *icao)
            .collect();
        for icao in &expired {
            self.aircraft.remove(icao);
        }
        self.counters.expired += expired.len() as u64;
        expired
    }

    /// When over capacity, drop the oldest-last_seen entries in one batch
    /// until at or below the target threshold. Batch removal avoids
    /// re-evicting on every subsequent insert.
    pub fn evict_for_capacity(&mut self) -> Vec<Icao> {
        if self.aircraft.len() <= self.config.max_aircraft {
            return Vec::new();
        }
        let target =
            (self.config.max_aircraft as f64 * self.config.evict_target).floor() as usize;
        let excess = self.aircraft.len() - target;

        let mut by_age: Vec<(f64, Icao)> = self
            .aircraft
            .values()
            .map(|s| (s.last_seen, s.icao))
            .collect();
        by_age.sort_by(|a, b| a.0.total_cmp(&b.0));

        let evicted: Vec<Icao> = by_age.into_iter().take(excess).map(|(_, i)| i).collect();
        for icao in &evicted {
            self.aircraft.remove(icao);
        }
        self.counters.evicted += evicted.len() as u64;
        evicted
    }

    /// All live aircraft, most recently seen first.
    pub fn snapshot(&self) -> Vec<AircraftState> {
        let mut all: Vec<AircraftState> = self.aircraft.values().cloned().collect();
        all.sort_by(|a, b| b.last_seen.total_cmp(&a.last_seen));
        all
    }

    /// Watchlist collaborator hook. Returns false for an unknown ICAO.
    pub fn set_watchlisted(&mut self, icao: &Icao, flagged: bool) -> bool {
        match self.aircraft.get_mut(icao) {
            Some(state) => {
                state.watchlisted = flagged;
                true
            }
            None => false,
        }
    }

    pub fn counters(&self) -> StoreCounters {
        self.counters
    }

    /// Reporting-interval reset. Aircraft state is untouched.
    pub fn reset_counters(&mut self) {
        self.counters = StoreCounters::default();
    }
}

fn expiry_timeout(config: &StoreConfig, state: &AircraftState) -> f64 {
    match state.last_position_category {
        Some(MsgCategory::SurfacePosition) => config.surface_expiry_s,
        Some(MsgCategory::AirbornePosition) => config.airborne_expiry_s,
        _ => config.default_expiry_s,
    }
}

fn msg_altitude(msg: &DecodedMessage) -> Option<i32> {
    match &msg.kind {
        MessageKind::SurfacePosition { altitude_ft, .. }
        | MessageKind::AirbornePosition { altitude_ft, .. }
        | MessageKind::Surveillance { altitude_ft } => *altitude_ft,
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Haversine
// ---------------------------------------------------------------------------

const EARTH_RADIUS_NM: f64 = 3440.065;

/// Great-circle distance in nautical miles.
pub fn haversine_nm(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * a.sqrt().asin() * EARTH_RADIUS_NM
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn icao(n: u32) -> Icao {
        [(n >> 16) as u8, (n >> 8) as u8, n as u8]
    }

    fn ident(n: u32, callsign: &str, ts: f64) -> DecodedMessage {
        DecodedMessage {
            icao: icao(n),
            timestamp: ts,
            crc_ok: true,
            kind: MessageKind::Identification {
                callsign: Some(callsign.to_string()),
            },
        }
    }

    fn airborne(n: u32, alt: Option<i32>, ts: f64) -> DecodedMessage {
        DecodedMessage {
            icao: icao(n),
            timestamp: ts,
            crc_ok: true,
            kind: MessageKind::AirbornePosition {
                cpr: None,
                altitude_ft: alt,
            },
        }
    }

    fn surface(n: u32, ts: f64) -> DecodedMessage {
        DecodedMessage {
            icao: icao(n),
            timestamp: ts,
            crc_ok: true,
            kind: MessageKind::SurfacePosition {
                cpr: None,
                altitude_ft: None,
            },
        }
    }

    fn store() -> AircraftStore {
        AircraftStore::new(StoreConfig::default())
    }

    #[test]
    fn test_create_on_first_message() {
        let mut s = store();
        let outcome = s.apply(&ident(0x4840D6, "KLM1023", 1.0), None, 1.0);
        assert!(outcome.created);
        assert!(outcome.conflicts.is_empty());

        let state = s.get(&icao(0x4840D6)).unwrap();
        assert_eq!(state.first_seen, 1.0);
        assert_eq!(state.last_seen, 1.0);
        assert_eq!(state.message_count, 1);
        assert_eq!(state.callsign.as_deref(), Some("KLM1023"));
        assert_eq!(s.counters().created, 1);
    }

    #[test]
    fn test_one_state_per_icao() {
        let mut s = store();
        s.apply(&ident(0x111111, "A", 1.0), None, 1.0);
        s.apply(&airborne(0x111111, Some(10000), 2.0), None, 2.0);
        s.apply(&ident(0x222222, "B", 3.0), None, 3.0);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_merge_overwrites_only_present_fields() {
        let mut s = store();
        s.apply(&ident(0x111111, "TEST123", 1.0), None, 1.0);
        s.apply(&airborne(0x111111, Some(35000), 2.0), Some((52.0, 4.0)), 2.0);

        let state = s.get(&icao(0x111111)).unwrap();
        // Callsign from the first message survives the position merge.
        assert_eq!(state.callsign.as_deref(), Some("TEST123"));
        assert_eq!(state.altitude_ft, Some(35000));
        assert!(state.has_position());

        // A position message with no altitude leaves altitude alone.
        s.apply(&airborne(0x111111, None, 3.0), Some((52.1, 4.1)), 3.0);
        let state = s.get(&icao(0x111111)).unwrap();
        assert_eq!(state.altitude_ft, Some(35000));
        assert_eq!(state.position.unwrap().lat, 52.1);
    }

    #[test]
    fn test_merge_never_regresses() {
        let mut s = store();
        s.apply(&airborne(0x111111, Some(10000), 10.0), None, 10.0);
        // A message stamped in the past still counts but cannot move
        // last_seen backwards.
        s.apply(&airborne(0x111111, Some(10000), 5.0), None, 5.0);

        let state = s.get(&icao(0x111111)).unwrap();
        assert_eq!(state.last_seen, 10.0);
        assert_eq!(state.message_count, 2);
    }

    #[test]
    fn test_categories_recorded() {
        let mut s = store();
        s.apply(&ident(0x111111, "X", 1.0), None, 1.0);
        s.apply(&airborne(0x111111, Some(1000), 2.0), None, 2.0);

        let state = s.get(&icao(0x111111)).unwrap();
        assert!(state.categories.contains(&MsgCategory::Identification));
        assert!(state.categories.contains(&MsgCategory::AirbornePosition));
        assert_eq!(state.categories.len(), 2);
    }

    #[test]
    fn test_conflict_position_jump() {
        let mut s = store();
        s.apply(&airborne(0x111111, None, 0.0), Some((52.0, 4.0)), 0.0);
        // ~300 nm in 60 s is 18000 kt — flagged, but still applied.
        let outcome = s.apply(&airborne(0x111111, None, 60.0), Some((52.0, 12.2)), 60.0);

        assert!(matches!(
            outcome.conflicts[..],
            [Conflict::ImplausibleSpeed { .. }]
        ));
        let state = s.get(&icao(0x111111)).unwrap();
        assert_eq!(state.position.unwrap().lon, 12.2);
        assert_eq!(state.conflict_count, 1);
        assert_eq!(s.counters().conflicts, 1);
    }

    #[test]
    fn test_conflict_altitude_rate() {
        let mut s = store();
        s.apply(&airborne(0x111111, Some(1000), 0.0), None, 0.0);
        // 30000 ft in 60 s is 30000 ft/min.
        let outcome = s.apply(&airborne(0x111111, Some(31000), 60.0), None, 60.0);
        assert!(matches!(
            outcome.conflicts[..],
            [Conflict::ImplausibleClimb { .. }]
        ));
        // Prefer-newest: applied anyway.
        assert_eq!(s.get(&icao(0x111111)).unwrap().altitude_ft, Some(31000));
    }

    #[test]
    fn test_conflict_skipped_below_min_elapsed() {
        let mut s = store();
        s.apply(&airborne(0x111111, Some(1000), 0.0), Some((52.0, 4.0)), 0.0);
        // Same jump but only 0.5 s elapsed: rate checks are skipped.
        let outcome = s.apply(
            &airborne(0x111111, Some(31000), 0.5),
            Some((52.0, 12.2)),
            0.5,
        );
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn test_conflict_callsign_change() {
        let mut s = store();
        s.apply(&ident(0x111111, "KLM1023", 1.0), None, 1.0);
        let outcome = s.apply(&ident(0x111111, "BAW55", 2.0), None, 2.0);

        assert_eq!(
            outcome.conflicts,
            vec![Conflict::CallsignChange {
                previous: "KLM1023".into(),
                new: "BAW55".into(),
            }]
        );
        // Prefer-newest.
        assert_eq!(
            s.get(&icao(0x111111)).unwrap().callsign.as_deref(),
            Some("BAW55")
        );
    }

    #[test]
    fn test_same_callsign_no_conflict() {
        let mut s = store();
        s.apply(&ident(0x111111, "KLM1023", 1.0), None, 1.0);
        let outcome = s.apply(&ident(0x111111, "KLM1023", 2.0), None, 2.0);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn test_expire_category_timeouts() {
        let mut s = store();
        s.apply(&surface(0x111111, 0.0), None, 0.0);
        s.apply(&airborne(0x222222, None, 0.0), None, 0.0);
        s.apply(&ident(0x333333, "X", 0.0), None, 0.0);

        // t=40: only the surface aircraft (30 s timeout) is gone.
        let removed = s.expire(40.0);
        assert_eq!(removed, vec![icao(0x111111)]);

        // t=70: the no-position aircraft (60 s default) goes too.
        let removed = s.expire(70.0);
        assert_eq!(removed, vec![icao(0x333333)]);

        // t=121: the airborne one (120 s) finally expires.
        let removed = s.expire(121.0);
        assert_eq!(removed, vec![icao(0x222222)]);
        assert!(s.is_empty());
        assert_eq!(s.counters().expired, 3);
    }

    #[test]
    fn test_expire_survives_recent_update() {
        let mut s = store();
        s.apply(&ident(0x111111, "X", 0.0), None, 0.0);
        s.apply(&ident(0x111111, "X", 59.0), None, 59.0);
        // One second after the last update: well inside every timeout.
        assert!(s.expire(60.0).is_empty());
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_evict_oldest_batch() {
        let mut s = AircraftStore::new(StoreConfig {
            max_aircraft: 100,
            evict_target: 0.7,
            ..StoreConfig::default()
        });
        for n in 0..110u32 {
            let ts = n as f64;
            s.apply(&ident(n + 1, "X", ts), None, ts);
        }
        assert_eq!(s.len(), 110);

        let evicted = s.evict_for_capacity();
        assert_eq!(s.len(), 70);
        assert_eq!(evicted.len(), 40);

        // The oldest-last_seen entries are the ones that went.
        for n in 0..40u32 {
            assert!(s.get(&icao(n + 1)).is_none(), "aircraft {n} should be gone");
        }
        for n in 40..110u32 {
            assert!(s.get(&icao(n + 1)).is_some(), "aircraft {n} should remain");
        }
        assert_eq!(s.counters().evicted, 40);
    }

    #[test]
    fn test_evict_noop_under_capacity() {
        let mut s = store();
        s.apply(&ident(0x111111, "X", 1.0), None, 1.0);
        assert!(s.evict_for_capacity().is_empty());
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_snapshot_sorted_recent_first() {
        let mut s = store();
        s.apply(&ident(0x111111, "A", 1.0), None, 1.0);
        s.apply(&ident(0x222222, "B", 5.0), None, 5.0);
        s.apply(&ident(0x333333, "C", 3.0), None, 3.0);

        let snap = s.snapshot();
        let order: Vec<f64> = snap.iter().map(|a| a.last_seen).collect();
        assert_eq!(order, vec![5.0, 3.0, 1.0]);
    }

    #[test]
    fn test_watchlist_flag() {
        let mut s = store();
        s.apply(&ident(0x111111, "A", 1.0), None, 1.0);
        assert!(s.set_watchlisted(&icao(0x111111), true));
        assert!(s.get(&icao(0x111111)).unwrap().watchlisted);
        assert!(!s.set_watchlisted(&icao(0x999999), true));

        // Merges leave the flag alone.
        s.apply(&airborne(0x111111, Some(1000), 2.0), None, 2.0);
        assert!(s.get(&icao(0x111111)).unwrap().watchlisted);
    }

    #[test]
    fn test_counter_reset() {
        let mut s = store();
        s.apply(&ident(0x111111, "A", 1.0), None, 1.0);
        assert_eq!(s.counters().created, 1);
        s.reset_counters();
        assert_eq!(s.counters().created, 0);
        // State untouched by the reset.
        assert_eq!(s.get(&icao(0x111111)).unwrap().message_count, 1);
    }

    #[test]
    fn test_haversine_known_distance() {
        // Asheville to Charlotte is roughly 80 nm.
        let d = haversine_nm(35.4362, -82.5418, 35.2140, -80.9431);
        assert!((d - 80.0).abs() < 5.0, "got {d}");
    }
}
