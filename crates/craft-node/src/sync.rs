//! Merkle sync: digest-based catch-up for merkelized shared objects.
//!
//! Each interval a node broadcasts the head digest of every merkelized
//! object. A peer holding an object of the same class that knows the digest
//! answers, to the sender only, with every message after it. Requests are
//! answered on arrival and never stored, so every poll gets an answer.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::codec;
use crate::message::ControlMessage;
use crate::node::NodeInner;
use crate::peer::PeerAddr;

impl NodeInner {
    pub(crate) async fn sync_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.gossip_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.request_updates().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!(node = %self.local(), "sync loop stopped");
    }

    async fn request_updates(&self) {
        for (class_name, digest) in self.objects().merkelized_heads() {
            let request = ControlMessage::RequestSharedObjectUpdate {
                class_name: class_name.clone(),
                digest,
            };
            match codec::encode(&request.to_message()) {
                Ok(encoded) => {
                    self.broadcast(&encoded.bytes).await;
                }
                Err(e) => warn!(class_name = %class_name, error = %e, "failed to encode sync request"),
            }
        }
    }

    /// Unicasts every message after `digest` to `requester`.
    pub(crate) async fn serve_update(&self, class_name: &str, digest: &str, requester: &PeerAddr) {
        let messages = self.objects().updates_after(class_name, digest);
        if messages.is_empty() {
            return;
        }
        let mut served = 0u64;
        for message in &messages {
            let sent = match codec::encode(message) {
                Ok(encoded) => self.transport.send(&encoded.bytes, requester).await,
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => served += 1,
                Err(e) => warn!(peer = %requester, error = %e, "failed to send sync message"),
            }
        }
        self.state.lock().stats.sync_messages_served += served;
        debug!(peer = %requester, class_name, served, "served sync request");
    }
}
