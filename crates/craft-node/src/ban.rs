//! Strike counting and time-boxed peer bans.
//!
//! Every rejected message counts as one strike against the remote address
//! that sent it. The third strike bans that address for 48 hours. Ban expiry
//! is evaluated lazily: entries stay in the list and [`BanList::is_banned`]
//! compares against the current time on every check.

use std::collections::HashMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::peer::PeerAddr;

/// Strikes that trigger a ban.
pub const STRIKE_THRESHOLD: u32 = 3;

/// Length of a ban in seconds (48 hours).
pub const BAN_WINDOW_SECS: i64 = 48 * 60 * 60;

/// Outcome of recording a strike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrikeOutcome {
    /// The strike was counted; holds the running total.
    Counted(u32),
    /// The threshold was reached; the caller must ban the address.
    Ban,
    /// The address is already banned, nothing was counted.
    AlreadyBanned,
}

/// Addresses with a live strike counter before stale ones are evicted.
pub const MAX_TRACKED_ADDRESSES: usize = 4096;

/// Idle time after which a counter may be evicted under pressure.
pub const STRIKE_IDLE_SECS: i64 = 60 * 60;

#[derive(Debug, Clone, Copy)]
struct StrikeEntry {
    count: u32,
    last_strike: DateTime<Utc>,
}

/// Volatile per-address invalid-message counters.
///
/// The map is bounded by [`MAX_TRACKED_ADDRESSES`]. When a new address
/// arrives at capacity, counters idle for [`STRIKE_IDLE_SECS`] are dropped,
/// and if none are, the least recently struck one goes.
#[derive(Debug)]
pub struct StrikeTracker {
    counts: HashMap<PeerAddr, StrikeEntry>,
    capacity: usize,
}

impl Default for StrikeTracker {
    fn default() -> Self {
        Self::with_capacity(MAX_TRACKED_ADDRESSES)
    }
}

impl StrikeTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty tracker holding at most `capacity` counters.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            counts: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Counts one strike at `now`. At the threshold the counter is cleared
    /// and [`StrikeOutcome::Ban`] is returned.
    pub fn record(&mut self, peer: &PeerAddr, now: DateTime<Utc>) -> StrikeOutcome {
        if !self.counts.contains_key(peer) && self.counts.len() >= self.capacity {
            self.evict(now);
        }
        let entry = self.counts.entry(peer.clone()).or_insert(StrikeEntry {
            count: 0,
            last_strike: now,
        });
        entry.count = entry.count.saturating_add(1);
        entry.last_strike = now;
        let count = entry.count;
        if count >= STRIKE_THRESHOLD {
            self.counts.remove(peer);
            StrikeOutcome::Ban
        } else {
            StrikeOutcome::Counted(count)
        }
    }

    /// Current strike count for an address.
    #[must_use]
    pub fn count(&self, peer: &PeerAddr) -> u32 {
        self.counts.get(peer).map_or(0, |entry| entry.count)
    }

    /// Number of addresses with a live counter.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Returns true if no address has a live counter.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(STRIKE_IDLE_SECS);
        let before = self.counts.len();
        self.counts.retain(|_, entry| entry.last_strike > cutoff);
        if self.counts.len() < before {
            debug!(evicted = before - self.counts.len(), "dropped idle strike counters");
            return;
        }
        let oldest = self
            .counts
            .iter()
            .min_by_key(|(_, entry)| entry.last_strike)
            .map(|(peer, _)| peer.clone());
        if let Some(peer) = oldest {
            self.counts.remove(&peer);
            debug!(peer = %peer, "strike tracker full, dropped oldest counter");
        }
    }
}

/// Banned peers and their expiry times.
#[derive(Debug, Clone, Default)]
pub struct BanList {
    bans: HashMap<PeerAddr, DateTime<Utc>>,
}

impl BanList {
    /// Creates an empty ban list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bans `peer` for the ban window starting at `now`. Returns the expiry.
    pub fn ban(&mut self, peer: PeerAddr, now: DateTime<Utc>) -> DateTime<Utc> {
        let expires_at = now + Duration::seconds(BAN_WINDOW_SECS);
        self.bans.insert(peer, expires_at);
        expires_at
    }

    /// Returns true if `peer` has a ban that has not expired at `now`.
    #[must_use]
    pub fn is_banned(&self, peer: &PeerAddr, now: DateTime<Utc>) -> bool {
        self.bans.get(peer).is_some_and(|expires_at| now < *expires_at)
    }

    /// Expiry recorded for `peer`, expired or not.
    #[must_use]
    pub fn expiry(&self, peer: &PeerAddr) -> Option<DateTime<Utc>> {
        self.bans.get(peer).copied()
    }

    /// Bans still in force at `now`.
    #[must_use]
    pub fn active(&self, now: DateTime<Utc>) -> Vec<(PeerAddr, DateTime<Utc>)> {
        let mut active: Vec<_> = self
            .bans
            .iter()
            .filter(|(_, expires_at)| now < **expires_at)
            .map(|(peer, expires_at)| (peer.clone(), *expires_at))
            .collect();
        active.sort();
        active
    }

    /// Number of recorded entries, including expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bans.len()
    }

    /// Returns true if nothing was ever banned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }

    /// Persisted form: `{"host,port": expiry_epoch_seconds}`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .bans
            .iter()
            .map(|(peer, expires_at)| (peer.ban_key(), Value::from(expires_at.timestamp())))
            .collect();
        Value::Object(map)
    }

    /// Loads the persisted form. Malformed entries are skipped.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        let mut list = Self::new();
        let Some(map) = value.as_object() else {
            warn!("ban list is not a JSON object, starting empty");
            return list;
        };
        for (key, expiry) in map {
            let peer = match PeerAddr::from_ban_key(key) {
                Ok(peer) => peer,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping malformed ban entry");
                    continue;
                }
            };
            // Fractional epoch seconds are accepted and truncated.
            let Some(expires_at) = expiry
                .as_f64()
                .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
            else {
                warn!(peer = %peer, "skipping ban entry without a valid expiry");
                continue;
            };
            list.bans.insert(peer, expires_at);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn peer(port: u16) -> PeerAddr {
        PeerAddr::new("127.0.0.1", port)
    }

    #[test]
    fn third_strike_bans_and_clears() {
        let mut strikes = StrikeTracker::new();
        let p = peer(1);
        let now = Utc::now();

        assert_eq!(strikes.record(&p, now), StrikeOutcome::Counted(1));
        assert_eq!(strikes.record(&p, now), StrikeOutcome::Counted(2));
        assert_eq!(strikes.record(&p, now), StrikeOutcome::Ban);
        assert_eq!(strikes.count(&p), 0);
        assert!(strikes.is_empty());
    }

    #[test]
    fn strikes_are_per_address() {
        let mut strikes = StrikeTracker::new();
        let now = Utc::now();
        strikes.record(&peer(1), now);
        strikes.record(&peer(1), now);
        assert_eq!(strikes.record(&peer(2), now), StrikeOutcome::Counted(1));
        assert_eq!(strikes.count(&peer(1)), 2);
    }

    #[test]
    fn full_tracker_drops_idle_counters_first() {
        let mut strikes = StrikeTracker::with_capacity(3);
        let start = Utc::now();
        strikes.record(&peer(1), start);
        strikes.record(&peer(2), start + Duration::hours(2));
        strikes.record(&peer(3), start + Duration::hours(2));

        let now = start + Duration::minutes(150);
        strikes.record(&peer(4), now);

        assert_eq!(strikes.len(), 3);
        assert_eq!(strikes.count(&peer(1)), 0);
        assert_eq!(strikes.count(&peer(2)), 1);
        assert_eq!(strikes.count(&peer(4)), 1);
    }

    #[test]
    fn full_tracker_without_idle_counters_drops_least_recent() {
        let mut strikes = StrikeTracker::with_capacity(2);
        let now = Utc::now();
        strikes.record(&peer(1), now);
        strikes.record(&peer(2), now + Duration::seconds(1));
        strikes.record(&peer(2), now + Duration::seconds(2));

        strikes.record(&peer(3), now + Duration::seconds(3));

        assert_eq!(strikes.len(), 2);
        assert_eq!(strikes.count(&peer(1)), 0);
        assert_eq!(strikes.count(&peer(2)), 2);
    }

    #[test]
    fn spoofed_sources_stay_bounded() {
        let mut strikes = StrikeTracker::with_capacity(16);
        let now = Utc::now();
        for port in 0..1000 {
            strikes.record(&peer(port), now);
        }
        assert_eq!(strikes.len(), 16);
    }

    #[test]
    fn ban_lasts_48_hours() {
        let mut bans = BanList::new();
        let now = Utc::now();
        let expires_at = bans.ban(peer(1), now);

        assert_eq!(expires_at - now, Duration::hours(48));
        assert!(bans.is_banned(&peer(1), now));
        assert!(bans.is_banned(&peer(1), now + Duration::hours(47)));
        assert!(!bans.is_banned(&peer(1), now + Duration::hours(49)));
        assert!(!bans.is_banned(&peer(2), now));
    }

    #[test]
    fn expired_entries_stay_recorded() {
        let mut bans = BanList::new();
        let now = Utc::now();
        bans.ban(peer(1), now);

        let later = now + Duration::hours(72);
        assert!(bans.active(later).is_empty());
        assert_eq!(bans.len(), 1);
        assert!(bans.expiry(&peer(1)).is_some());
    }

    #[test]
    fn persisted_form_uses_host_comma_port() {
        let mut bans = BanList::new();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        bans.ban(peer(5000), now);

        let json = bans.to_json();
        assert_eq!(json, json!({"127.0.0.1,5000": 1_700_000_000 + BAN_WINDOW_SECS}));

        let loaded = BanList::from_json(&json);
        assert!(loaded.is_banned(&peer(5000), now));
    }

    #[test]
    fn load_accepts_float_expiry_and_skips_garbage() {
        let json = json!({
            "127.0.0.1,5000": 4_102_444_800.5,
            "bad-key": 1,
            "127.0.0.1,5001": "soon",
        });
        let loaded = BanList::from_json(&json);
        assert_eq!(loaded.len(), 1);
        assert!(loaded.is_banned(&peer(5000), Utc::now()));
    }
}
