//! Peer discovery: connect/announce and local peer list exchange.

use chrono::Utc;
use tracing::{debug, warn};

use crate::codec;
use crate::error::NodeResult;
use crate::message::ControlMessage;
use crate::node::NodeInner;
use crate::peer::PeerAddr;

impl NodeInner {
    /// Adds `peer` and optionally announces ourselves to it. Returns true if
    /// the directory changed.
    pub(crate) async fn connect(&self, peer: PeerAddr, announce: bool) -> bool {
        let outcome = self.state.lock().connect(peer.clone(), Utc::now());
        match outcome {
            Ok(_) => {
                self.persist().await;
                if announce {
                    let hello = ControlMessage::PeerDiscovery(self.local().clone());
                    self.send_control(&hello, &peer).await;
                }
                true
            }
            Err(skip) => {
                debug!(peer = %peer, reason = ?skip, "connect skipped");
                false
            }
        }
    }

    /// Records that we await `peer`'s list and asks for it.
    pub(crate) async fn request_local_peers(&self, peer: PeerAddr) -> NodeResult<()> {
        if peer == *self.local() {
            return Ok(());
        }
        self.state.lock().waiting_local.insert(peer.clone());
        let request = ControlMessage::RequestLocalPeers(self.local().clone());
        let encoded = codec::encode(&request.to_message())?;
        self.transport.send(&encoded.bytes, &peer).await?;
        debug!(peer = %peer, "requested local peers");
        Ok(())
    }

    /// Answers a local peer request with our current peer list.
    pub(crate) async fn send_local_peers(&self, requester: &PeerAddr) {
        let peers = self.state.lock().peers.to_vec();
        debug!(peer = %requester, count = peers.len(), "sending local peers");
        self.send_control(&ControlMessage::LocalPeers(peers), requester)
            .await;
    }

    /// Connects to every listed peer, but only if we asked `from` for them.
    pub(crate) async fn handle_local_peers(&self, peers: Vec<PeerAddr>, from: &PeerAddr) {
        let expected = self.state.lock().waiting_local.remove(from);
        if !expected {
            debug!(peer = %from, "ignoring unsolicited local peer list");
            return;
        }
        for peer in peers {
            self.connect(peer, false).await;
        }
    }

    async fn send_control(&self, control: &ControlMessage, peer: &PeerAddr) {
        let result = match codec::encode(&control.to_message()) {
            Ok(encoded) => self.transport.send(&encoded.bytes, peer).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(peer = %peer, error = %e, "failed to send control message");
        }
    }
}
