//! Gossip message types.
//!
//! A [`SharedMessage`] wraps an arbitrary JSON value. On the wire it is the
//! object `{"data": <value>}`. A handful of reserved single-key objects under
//! `data` drive peer discovery and shared-object synchronization; they are
//! modelled by [`ControlMessage`].

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{NodeResult, Rejection};
use crate::peer::PeerAddr;

/// Announces the sender so the receiver connects back.
pub const PEER_DISCOVERY: &str = "PEER_DISCOVERY";
/// Asks the receiver for its current peer list.
pub const REQUEST_LOCAL_PEERS: &str = "REQUEST_LOCAL_PEERS";
/// Carries a peer list in answer to [`REQUEST_LOCAL_PEERS`].
pub const LOCAL_PEERS: &str = "LOCAL_PEERS";
/// Asks holders of a merkelized object for everything after a digest.
pub const REQUEST_SHARED_OBJECT_UPDATE: &str = "REQUEST_SHARED_OBJECT_UPDATE";

/// A message exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedMessage {
    /// Arbitrary JSON payload.
    pub data: Value,
}

impl SharedMessage {
    /// Creates a message wrapping `data`.
    #[must_use]
    pub fn new(data: impl Into<Value>) -> Self {
        Self { data: data.into() }
    }

    /// Serializes to the wire JSON form.
    ///
    /// Object keys come out sorted, so equal payloads always serialize to the
    /// same bytes.
    pub fn to_json(&self) -> NodeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses the wire JSON form.
    pub fn from_json(json: &str) -> NodeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Returns true when `data` is a JSON object.
    #[must_use]
    pub fn is_object(&self) -> bool {
        self.data.is_object()
    }
}

/// Reserved in-band protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// `{"PEER_DISCOVERY": "host:port"}`
    PeerDiscovery(PeerAddr),
    /// `{"REQUEST_LOCAL_PEERS": "host:port"}`
    RequestLocalPeers(PeerAddr),
    /// `{"LOCAL_PEERS": ["host:port", ...]}`
    LocalPeers(Vec<PeerAddr>),
    /// `{"REQUEST_SHARED_OBJECT_UPDATE": {"class_name": .., "digest": ..}}`
    RequestSharedObjectUpdate {
        /// Class identifier of the requested object.
        class_name: String,
        /// Last digest the requester holds.
        digest: String,
    },
}

impl ControlMessage {
    /// Extracts a control message from a message payload.
    ///
    /// Returns `Ok(None)` for ordinary payloads. When several reserved keys
    /// are present the first in protocol order wins.
    pub fn parse(data: &Value) -> Result<Option<Self>, Rejection> {
        let Some(map) = data.as_object() else {
            return Ok(None);
        };

        if let Some(value) = map.get(PEER_DISCOVERY) {
            return parse_addr(value, PEER_DISCOVERY).map(|a| Some(Self::PeerDiscovery(a)));
        }
        if let Some(value) = map.get(REQUEST_LOCAL_PEERS) {
            return parse_addr(value, REQUEST_LOCAL_PEERS)
                .map(|a| Some(Self::RequestLocalPeers(a)));
        }
        if let Some(value) = map.get(LOCAL_PEERS) {
            let items = value.as_array().ok_or_else(|| {
                Rejection::MalformedControl(format!("{LOCAL_PEERS} must be a list"))
            })?;
            let peers = items
                .iter()
                .map(|item| parse_addr(item, LOCAL_PEERS))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Some(Self::LocalPeers(peers)));
        }
        if let Some(value) = map.get(REQUEST_SHARED_OBJECT_UPDATE) {
            let field = |name: &str| {
                value
                    .get(name)
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        Rejection::MalformedControl(format!(
                            "{REQUEST_SHARED_OBJECT_UPDATE} missing {name}"
                        ))
                    })
            };
            return Ok(Some(Self::RequestSharedObjectUpdate {
                class_name: field("class_name")?,
                digest: field("digest")?,
            }));
        }

        Ok(None)
    }

    /// Builds the wire message for this control message.
    #[must_use]
    pub fn to_message(&self) -> SharedMessage {
        let data = match self {
            Self::PeerDiscovery(addr) => json!({ PEER_DISCOVERY: addr.to_string() }),
            Self::RequestLocalPeers(addr) => json!({ REQUEST_LOCAL_PEERS: addr.to_string() }),
            Self::LocalPeers(peers) => {
                let list: Vec<String> = peers.iter().map(ToString::to_string).collect();
                json!({ LOCAL_PEERS: list })
            }
            Self::RequestSharedObjectUpdate { class_name, digest } => json!({
                REQUEST_SHARED_OBJECT_UPDATE: {
                    "class_name": class_name,
                    "digest": digest,
                }
            }),
        };
        SharedMessage { data }
    }
}

fn parse_addr(value: &Value, field: &str) -> Result<PeerAddr, Rejection> {
    value
        .as_str()
        .and_then(|s| s.parse::<PeerAddr>().ok())
        .ok_or_else(|| Rejection::MalformedControl(format!("{field} needs \"host:port\"")))
}
