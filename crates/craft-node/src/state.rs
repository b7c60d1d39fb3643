//! Mutable node state guarded by a single lock.
//!
//! The message store, the peer directory, the ban list and the strike
//! counters change together (a ban removes a peer and persists both lists),
//! so they live in one struct behind one mutex. Methods here never perform
//! network IO; callers decide under the lock and send after releasing it.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ban::{BanList, StrikeOutcome, StrikeTracker};
use crate::codec::Digest;
use crate::peer::{InsertOutcome, PeerAddr, PeerDirectory};
use crate::store::MessageStore;

/// Counters describing what a node has done since it started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    /// Datagrams read from the socket.
    pub datagrams_received: u64,
    /// Datagrams dropped because their digest was already stored.
    pub duplicates_dropped: u64,
    /// Datagrams dropped because the sender is banned.
    pub banned_dropped: u64,
    /// Messages stored, received or created locally.
    pub messages_accepted: u64,
    /// Inbound messages refused by the pipeline.
    pub rejections: u64,
    /// Strikes recorded.
    pub strikes: u64,
    /// Bans issued.
    pub bans: u64,
    /// Messages sent in answer to sync requests.
    pub sync_messages_served: u64,
    /// Peers evicted to make room for new ones.
    pub peers_evicted: u64,
    /// Peers dropped after a failed send.
    pub peers_dropped: u64,
}

/// Why [`NodeState::connect`] did not add a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectSkip {
    /// The peer is this node.
    IsSelf,
    /// The peer is already in the directory.
    Known,
    /// The peer is banned.
    Banned,
}

/// Store, peers, bans and strike counters.
#[derive(Debug)]
pub struct NodeState {
    pub(crate) store: MessageStore,
    pub(crate) peers: PeerDirectory,
    pub(crate) bans: BanList,
    pub(crate) strikes: StrikeTracker,
    pub(crate) waiting_local: HashSet<PeerAddr>,
    pub(crate) quarantined: HashSet<Digest>,
    pub(crate) stats: NodeStats,
    local: PeerAddr,
}

impl NodeState {
    /// Builds state around an opened store, restoring persisted peers and
    /// bans.
    pub fn restore(store: MessageStore, local: PeerAddr, max_peers: usize) -> Self {
        let bans = store.load_bans();
        let now = Utc::now();
        let persisted = store
            .load_peers()
            .into_iter()
            .filter(|p| *p != local && !bans.is_banned(p, now))
            .collect();
        let peers = PeerDirectory::restore(max_peers, persisted);
        if !peers.is_empty() || !bans.is_empty() {
            info!(peers = peers.len(), bans = bans.len(), "restored persisted peer state");
        }
        Self {
            store,
            peers,
            bans,
            strikes: StrikeTracker::new(),
            waiting_local: HashSet::new(),
            quarantined: HashSet::new(),
            stats: NodeStats::default(),
            local,
        }
    }

    /// Returns true if a datagram with this digest was already handled,
    /// either stored or quarantined after a consumer fault.
    pub fn has_seen(&self, digest: &Digest) -> bool {
        self.store.has(digest) || self.quarantined.contains(digest)
    }

    /// Marks a digest that some shared objects absorbed before another one
    /// faulted. It is never stored, but later copies are dropped as
    /// duplicates so no object absorbs it twice.
    pub fn quarantine(&mut self, digest: Digest) {
        self.quarantined.insert(digest);
    }

    /// This node's announced address.
    pub fn local(&self) -> &PeerAddr {
        &self.local
    }

    /// Adds `peer` to the directory, evicting the oldest peer when full, and
    /// records the new list in the store.
    pub fn connect(&mut self, peer: PeerAddr, now: DateTime<Utc>) -> Result<InsertOutcome, ConnectSkip> {
        if peer == self.local {
            return Err(ConnectSkip::IsSelf);
        }
        if self.bans.is_banned(&peer, now) {
            return Err(ConnectSkip::Banned);
        }
        let outcome = self.peers.insert(peer.clone());
        match &outcome {
            InsertOutcome::AlreadyKnown => return Err(ConnectSkip::Known),
            InsertOutcome::Replaced(evicted) => {
                self.stats.peers_evicted += 1;
                info!(peer = %peer, evicted = %evicted, "peer directory full, evicted oldest");
            }
            InsertOutcome::Added => info!(peer = %peer, "connected to peer"),
        }
        self.persist_peers();
        Ok(outcome)
    }

    /// Removes a peer after a failed send. Returns true if it was present.
    pub fn drop_peer(&mut self, peer: &PeerAddr) -> bool {
        if !self.peers.remove(peer) {
            return false;
        }
        self.stats.peers_dropped += 1;
        self.persist_peers();
        true
    }

    /// Counts one strike against `addr`, banning it at the threshold.
    pub fn strike(&mut self, addr: &PeerAddr, now: DateTime<Utc>) -> StrikeOutcome {
        if self.bans.is_banned(addr, now) {
            return StrikeOutcome::AlreadyBanned;
        }
        self.stats.strikes += 1;
        let outcome = self.strikes.record(addr, now);
        match outcome {
            StrikeOutcome::Ban => self.ban(addr.clone(), now),
            StrikeOutcome::Counted(count) => debug!(peer = %addr, count, "strike recorded"),
            StrikeOutcome::AlreadyBanned => {}
        }
        outcome
    }

    /// Bans `peer` for the ban window and removes it from the directory.
    pub fn ban(&mut self, peer: PeerAddr, now: DateTime<Utc>) {
        let expires_at = self.bans.ban(peer.clone(), now);
        self.stats.bans += 1;
        self.waiting_local.remove(&peer);
        let removed = self.peers.remove(&peer);
        info!(peer = %peer, expires_at = %expires_at, removed, "peer banned");
        self.persist_bans();
        if removed {
            self.persist_peers();
        }
    }

    /// Returns true if `peer` is banned at `now`.
    pub fn is_banned(&self, peer: &PeerAddr, now: DateTime<Utc>) -> bool {
        self.bans.is_banned(peer, now)
    }

    fn persist_peers(&mut self) {
        let peers = self.peers.to_vec();
        if let Err(e) = self.store.save_peers(&peers) {
            warn!(error = %e, "failed to persist peer list");
        }
    }

    fn persist_bans(&mut self) {
        if let Err(e) = self.store.save_bans(&self.bans) {
            warn!(error = %e, "failed to persist ban list");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileBackend;
    use chrono::Duration;

    fn peer(port: u16) -> PeerAddr {
        PeerAddr::new("127.0.0.1", port)
    }

    fn state(max_peers: usize) -> NodeState {
        NodeState::restore(MessageStore::in_memory(), peer(9999), max_peers)
    }

    #[test]
    fn connect_skips_self_known_and_banned() {
        let mut s = state(5);
        let now = Utc::now();

        assert_eq!(s.connect(peer(9999), now), Err(ConnectSkip::IsSelf));
        assert_eq!(s.connect(peer(1), now), Ok(InsertOutcome::Added));
        assert_eq!(s.connect(peer(1), now), Err(ConnectSkip::Known));

        s.ban(peer(2), now);
        assert_eq!(s.connect(peer(2), now), Err(ConnectSkip::Banned));
        assert_eq!(s.peers.len(), 1);
    }

    #[test]
    fn connect_at_capacity_evicts_one() {
        let mut s = state(2);
        let now = Utc::now();
        s.connect(peer(1), now).unwrap();
        s.connect(peer(2), now).unwrap();

        assert_eq!(s.connect(peer(3), now), Ok(InsertOutcome::Replaced(peer(1))));
        assert_eq!(s.peers.to_vec(), vec![peer(2), peer(3)]);
        assert_eq!(s.stats.peers_evicted, 1);
    }

    #[test]
    fn third_strike_bans_and_removes_peer() {
        let mut s = state(5);
        let now = Utc::now();
        s.connect(peer(1), now).unwrap();

        assert_eq!(s.strike(&peer(1), now), StrikeOutcome::Counted(1));
        assert_eq!(s.strike(&peer(1), now), StrikeOutcome::Counted(2));
        assert!(!s.is_banned(&peer(1), now));
        assert_eq!(s.strike(&peer(1), now), StrikeOutcome::Ban);

        assert!(s.is_banned(&peer(1), now));
        assert!(!s.peers.contains(&peer(1)));
        assert_eq!(s.strike(&peer(1), now), StrikeOutcome::AlreadyBanned);
        assert_eq!(s.stats.strikes, 3);
        assert_eq!(s.stats.bans, 1);
    }

    #[test]
    fn ban_expires_lazily() {
        let mut s = state(5);
        let now = Utc::now();
        s.ban(peer(1), now);

        let later = now + Duration::hours(49);
        assert!(!s.is_banned(&peer(1), later));
        assert!(s.connect(peer(1), later).is_ok());
    }

    #[test]
    fn drop_peer_reports_presence() {
        let mut s = state(5);
        s.connect(peer(1), Utc::now()).unwrap();
        assert!(s.drop_peer(&peer(1)));
        assert!(!s.drop_peer(&peer(1)));
        assert_eq!(s.stats.peers_dropped, 1);
    }

    #[test]
    fn durable_state_reloads_peers_and_bans() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node_9999.json");
        let now = Utc::now();

        {
            let store = MessageStore::new(Box::new(FileBackend::open(&path).unwrap()));
            let mut s = NodeState::restore(store, peer(9999), 5);
            s.connect(peer(1), now).unwrap();
            s.connect(peer(2), now).unwrap();
            s.ban(peer(2), now);
            s.store.flush().unwrap();
        }

        let store = MessageStore::new(Box::new(FileBackend::open(&path).unwrap()));
        let s = NodeState::restore(store, peer(9999), 5);
        assert_eq!(s.peers.to_vec(), vec![peer(1)]);
        assert!(s.is_banned(&peer(2), now));
    }

    #[test]
    fn quarantined_digest_counts_as_seen() {
        let mut s = state(5);
        let digest = Digest::of(b"faulted");
        assert!(!s.has_seen(&digest));

        s.quarantine(digest.clone());
        assert!(s.has_seen(&digest));
        assert!(s.store.is_empty());
    }
}
