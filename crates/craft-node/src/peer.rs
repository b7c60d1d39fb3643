//! Peer addresses and the bounded peer directory.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::NodeError;

/// A remote node, identified by `(host, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr {
    host: String,
    port: u16,
}

impl PeerAddr {
    /// Creates a peer address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host part.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Key used for this peer in the persisted ban list (`"host,port"`).
    #[must_use]
    pub fn ban_key(&self) -> String {
        format!("{},{}", self.host, self.port)
    }

    /// Parses a `"host,port"` ban list key.
    pub fn from_ban_key(key: &str) -> Result<Self, NodeError> {
        let (host, port) = key
            .rsplit_once(',')
            .ok_or_else(|| NodeError::InvalidPeerAddress(key.to_string()))?;
        Self::from_parts(host, port, key)
    }

    fn from_parts(host: &str, port: &str, original: &str) -> Result<Self, NodeError> {
        if host.is_empty() {
            return Err(NodeError::InvalidPeerAddress(original.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| NodeError::InvalidPeerAddress(original.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| NodeError::InvalidPeerAddress(s.to_string()))?;
        Self::from_parts(host, port, s)
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Result of [`PeerDirectory::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The peer was added without displacing anyone.
    Added,
    /// The peer was added and the oldest peer was evicted to make room.
    Replaced(PeerAddr),
    /// The peer was already present.
    AlreadyKnown,
}

impl InsertOutcome {
    /// Returns true if the directory changed.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        !matches!(self, Self::AlreadyKnown)
    }
}

/// Ordered, bounded set of known peers.
///
/// Insertion order is eviction order: when full, the oldest peer makes room
/// for the newcomer.
#[derive(Debug, Clone)]
pub struct PeerDirectory {
    peers: VecDeque<PeerAddr>,
    max_peers: usize,
}

impl PeerDirectory {
    /// Creates an empty directory holding at most `max_peers` peers.
    #[must_use]
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: VecDeque::with_capacity(max_peers),
            max_peers: max_peers.max(1),
        }
    }

    /// Restores a directory from a persisted list, keeping the newest entries
    /// if the list exceeds the capacity.
    #[must_use]
    pub fn restore(max_peers: usize, peers: Vec<PeerAddr>) -> Self {
        let mut directory = Self::new(max_peers);
        for peer in peers {
            directory.insert(peer);
        }
        directory
    }

    /// Adds a peer, evicting the oldest one if the directory is full.
    pub fn insert(&mut self, peer: PeerAddr) -> InsertOutcome {
        if self.contains(&peer) {
            return InsertOutcome::AlreadyKnown;
        }
        let evicted = if self.peers.len() >= self.max_peers {
            self.peers.pop_front()
        } else {
            None
        };
        self.peers.push_back(peer);
        evicted.map_or(InsertOutcome::Added, InsertOutcome::Replaced)
    }

    /// Removes a peer. Returns true if it was present.
    pub fn remove(&mut self, peer: &PeerAddr) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p != peer);
        self.peers.len() != before
    }

    /// Returns true if the peer is known.
    #[must_use]
    pub fn contains(&self, peer: &PeerAddr) -> bool {
        self.peers.contains(peer)
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true if no peers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Maximum number of peers.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.max_peers
    }

    /// Snapshot of the peers, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<PeerAddr> {
        self.peers.iter().cloned().collect()
    }

    /// Iterates over peers, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &PeerAddr> {
        self.peers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer(port: u16) -> PeerAddr {
        PeerAddr::new("127.0.0.1", port)
    }

    #[test]
    fn parse_and_display() {
        let addr: PeerAddr = "localhost:21000".parse().unwrap();
        assert_eq!(addr.host(), "localhost");
        assert_eq!(addr.port(), 21000);
        assert_eq!(addr.to_string(), "localhost:21000");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("localhost".parse::<PeerAddr>().is_err());
        assert!(":80".parse::<PeerAddr>().is_err());
        assert!("host:99999".parse::<PeerAddr>().is_err());
    }

    #[test]
    fn ban_key_round_trip() {
        let addr = peer(5001);
        assert_eq!(addr.ban_key(), "127.0.0.1,5001");
        assert_eq!(PeerAddr::from_ban_key("127.0.0.1,5001").unwrap(), addr);
        assert!(PeerAddr::from_ban_key("127.0.0.1:5001").is_err());
    }

    #[test]
    fn from_socket_addr() {
        let sock: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        assert_eq!(PeerAddr::from(sock), peer(6000));
    }

    #[test]
    fn insert_ignores_known_peer() {
        let mut dir = PeerDirectory::new(3);
        assert_eq!(dir.insert(peer(1)), InsertOutcome::Added);
        assert_eq!(dir.insert(peer(1)), InsertOutcome::AlreadyKnown);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn full_directory_evicts_oldest_exactly_once() {
        let mut dir = PeerDirectory::new(2);
        dir.insert(peer(1));
        dir.insert(peer(2));

        assert_eq!(dir.insert(peer(3)), InsertOutcome::Replaced(peer(1)));
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.to_vec(), vec![peer(2), peer(3)]);
    }

    #[test]
    fn remove_reports_presence() {
        let mut dir = PeerDirectory::new(2);
        dir.insert(peer(1));
        assert!(dir.remove(&peer(1)));
        assert!(!dir.remove(&peer(1)));
        assert!(dir.is_empty());
    }

    #[test]
    fn restore_keeps_newest() {
        let dir = PeerDirectory::restore(2, vec![peer(1), peer(2), peer(3)]);
        assert_eq!(dir.to_vec(), vec![peer(2), peer(3)]);
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity(cap in 1usize..8, ports in proptest::collection::vec(1u16..50, 0..40)) {
            let mut dir = PeerDirectory::new(cap);
            for p in ports {
                dir.insert(peer(p));
                prop_assert!(dir.len() <= cap);
            }
        }

        #[test]
        fn display_parses_back(host in "[a-z][a-z0-9.]{0,20}", port in any::<u16>()) {
            let addr = PeerAddr::new(host, port);
            prop_assert_eq!(addr.to_string().parse::<PeerAddr>().unwrap(), addr);
        }
    }
}
