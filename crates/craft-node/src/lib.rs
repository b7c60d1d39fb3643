//! # craft-node
//!
//! Peer-to-peer gossip substrate over UDP.
//!
//! Nodes exchange opaque, content-addressed JSON messages, deduplicate them
//! by digest, and periodically flood everything they know to their peers.
//! Consumers plug in [`SharedObject`]s that validate and absorb messages, and
//! merkelized objects can catch up incrementally by digest instead of waiting
//! for full re-gossip.
//!
//! ## Core Types
//!
//! - [`CraftNode`]: the node engine (transport, pipeline, background loops)
//! - [`NodeConfig`]: bind, capacity, storage and timing settings
//! - [`SharedMessage`]: a message, `{"data": <json>}` on the wire
//! - [`SharedObject`]: the pluggable consumer contract
//! - [`AcceptancePolicy`] / [`MessageSchema`]: optional schema gating
//! - [`PeerDirectory`] / [`BanList`]: bounded peers and time-boxed bans

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod acceptance;
pub mod ban;
pub mod codec;
pub mod config;
mod discovery;
pub mod error;
mod gossip;
pub mod message;
pub mod node;
pub mod peer;
pub mod schema;
pub mod shared_object;
pub mod state;
pub mod store;
mod sync;
pub mod transport;

pub use acceptance::AcceptancePolicy;
pub use ban::{
    BAN_WINDOW_SECS, BanList, MAX_TRACKED_ADDRESSES, STRIKE_THRESHOLD, StrikeOutcome, StrikeTracker,
};
pub use codec::{Digest, MAX_DATAGRAM_SIZE};
pub use config::NodeConfig;
pub use error::{NodeError, NodeResult, Rejection};
pub use message::{ControlMessage, SharedMessage};
pub use node::CraftNode;
pub use peer::{InsertOutcome, PeerAddr, PeerDirectory};
pub use schema::{AcceptedType, FieldType, MessageSchema, ObjectSchema, Primitive};
pub use shared_object::{SharedObject, SharedObjectHandle, SharedObjects, handle};
pub use state::NodeStats;
pub use store::{FileBackend, MemoryBackend, MessageStore, StoreBackend};
