//! Message store: digest → serialized message, plus peer/ban persistence.
//!
//! The store is a thin layer over a swappable [`StoreBackend`]. Two reserved
//! keys hold the peer list and the ban list; they never show up in
//! [`MessageStore::keys`] and are never gossiped.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::ban::BanList;
use crate::codec::Digest;
use crate::error::{NodeError, NodeResult};
use crate::peer::PeerAddr;

/// Reserved key holding the persisted peer list.
pub const PEERS_KEY: &str = "PEERS";
/// Reserved key holding the persisted ban list.
pub const BANNED_PEERS_KEY: &str = "BANNED_PEERS";

/// A map-like key/value backend.
pub trait StoreBackend: Send {
    /// Reads a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Writes a value, replacing any previous one.
    fn put(&mut self, key: &str, value: String);

    /// Returns true if `key` is present.
    fn contains(&self, key: &str) -> bool;

    /// All keys, in no particular order.
    fn keys(&self) -> Vec<String>;

    /// Captures unwritten changes as a [`Snapshot`], or `None` when there is
    /// nothing to write. Taking a snapshot marks the backend clean.
    fn snapshot(&mut self) -> NodeResult<Option<Snapshot>> {
        Ok(None)
    }

    /// Marks the backend dirty again after a snapshot failed to write.
    fn mark_dirty(&mut self) {}

    /// Makes every previous write durable before returning.
    fn flush(&mut self) -> NodeResult<()> {
        if let Some(snapshot) = self.snapshot()? {
            if let Err(e) = snapshot.write() {
                self.mark_dirty();
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Serialized store contents waiting to be written.
///
/// [`Snapshot::write`] does blocking file IO; async callers run it on the
/// blocking pool.
#[derive(Debug)]
pub struct Snapshot {
    path: PathBuf,
    bytes: Vec<u8>,
    entries: usize,
}

impl Snapshot {
    /// Writes a sibling temp file, syncs it, then renames it over the store
    /// file, so a crash leaves either the old or the new snapshot.
    pub fn write(self) -> NodeResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&self.bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), entries = self.entries, "store flushed");
        Ok(())
    }
}

/// Volatile in-memory backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: HashMap<String, String>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryBackend {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Durable backend kept in memory and snapshotted to a JSON file on flush.
///
/// Every snapshot serializes the whole map, so a flush costs time linear in
/// the store size.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    entries: HashMap<String, String>,
    dirty: bool,
}

impl FileBackend {
    /// Opens the store at `path`, loading an existing snapshot if present.
    pub fn open(path: impl Into<PathBuf>) -> NodeResult<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let data = fs::read_to_string(&path)?;
            serde_json::from_str::<HashMap<String, String>>(&data).map_err(|e| {
                NodeError::Store(format!("corrupt store file {}: {e}", path.display()))
            })?
        } else {
            HashMap::new()
        };
        info!(path = %path.display(), entries = entries.len(), "opened durable store");
        Ok(Self {
            path,
            entries,
            dirty: false,
        })
    }

    /// Deletes the store file at `path` if it exists.
    pub fn reset(path: &Path) -> NodeResult<()> {
        if path.exists() {
            fs::remove_file(path)?;
            info!(path = %path.display(), "removed existing store");
        }
        Ok(())
    }

    /// Location of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StoreBackend for FileBackend {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
        self.dirty = true;
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn snapshot(&mut self) -> NodeResult<Option<Snapshot>> {
        if !self.dirty {
            return Ok(None);
        }
        let bytes = serde_json::to_vec(&self.entries)?;
        self.dirty = false;
        Ok(Some(Snapshot {
            path: self.path.clone(),
            bytes,
            entries: self.entries.len(),
        }))
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// Digest-keyed message log on top of a backend.
pub struct MessageStore {
    backend: Box<dyn StoreBackend>,
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore").finish_non_exhaustive()
    }
}

impl MessageStore {
    /// Wraps a backend.
    #[must_use]
    pub fn new(backend: Box<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// A volatile store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::new()))
    }

    /// Returns true if a message with this digest is stored.
    #[must_use]
    pub fn has(&self, digest: &Digest) -> bool {
        self.backend.contains(digest.as_str())
    }

    /// Serialized message for `digest`.
    #[must_use]
    pub fn get(&self, digest: &Digest) -> Option<String> {
        self.backend.get(digest.as_str())
    }

    /// Stores a serialized message.
    pub fn put(&mut self, digest: &Digest, json: String) {
        self.backend.put(digest.as_str(), json);
    }

    /// Digests of every stored message, excluding the reserved keys.
    #[must_use]
    pub fn keys(&self) -> Vec<Digest> {
        self.backend
            .keys()
            .into_iter()
            .filter(|k| k != PEERS_KEY && k != BANNED_PEERS_KEY)
            .filter_map(|k| Digest::parse(&k).ok())
            .collect()
    }

    /// Every stored message as serialized JSON.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.keys().iter().filter_map(|d| self.get(d)).collect()
    }

    /// Number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    /// Returns true if no messages are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes previous writes durable.
    pub fn flush(&mut self) -> NodeResult<()> {
        self.backend.flush()
    }

    /// Captures unwritten changes; see [`StoreBackend::snapshot`].
    pub fn snapshot(&mut self) -> NodeResult<Option<Snapshot>> {
        self.backend.snapshot()
    }

    /// Marks the store dirty after a snapshot failed to write.
    pub fn mark_dirty(&mut self) {
        self.backend.mark_dirty();
    }

    /// Loads the persisted peer list (`[[host, port], ...]`).
    #[must_use]
    pub fn load_peers(&self) -> Vec<PeerAddr> {
        let Some(raw) = self.backend.get(PEERS_KEY) else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<(String, u16)>>(&raw) {
            Ok(pairs) => pairs
                .into_iter()
                .map(|(host, port)| PeerAddr::new(host, port))
                .collect(),
            Err(e) => {
                warn!(error = %e, "corrupt persisted peer list, starting empty");
                Vec::new()
            }
        }
    }

    /// Records the peer list. Durable after the next flush.
    pub fn save_peers(&mut self, peers: &[PeerAddr]) -> NodeResult<()> {
        let pairs: Vec<(&str, u16)> = peers.iter().map(|p| (p.host(), p.port())).collect();
        self.backend.put(PEERS_KEY, serde_json::to_string(&pairs)?);
        Ok(())
    }

    /// Loads the persisted ban list.
    #[must_use]
    pub fn load_bans(&self) -> BanList {
        let Some(raw) = self.backend.get(BANNED_PEERS_KEY) else {
            return BanList::new();
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => BanList::from_json(&value),
            Err(e) => {
                warn!(error = %e, "corrupt persisted ban list, starting empty");
                BanList::new()
            }
        }
    }

    /// Records the ban list. Durable after the next flush.
    pub fn save_bans(&mut self, bans: &BanList) -> NodeResult<()> {
        self.backend
            .put(BANNED_PEERS_KEY, serde_json::to_string(&bans.to_json())?);
        Ok(())
    }
}
