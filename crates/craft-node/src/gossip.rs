//! Gossip dissemination.
//!
//! Every interval the whole message store is re-broadcast to every peer. A
//! peer whose send fails is dropped from the directory.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::codec::{self, MAX_DATAGRAM_SIZE};
use crate::node::NodeInner;

impl NodeInner {
    pub(crate) async fn gossip_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.gossip_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.gossip_round().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!(node = %self.local(), "gossip loop stopped");
    }

    async fn gossip_round(&self) {
        let messages = self.state.lock().store.messages();
        if messages.is_empty() {
            return;
        }
        trace!(count = messages.len(), "gossip round");
        for json in messages {
            match codec::encode_json(json) {
                Ok(encoded) => {
                    self.broadcast(&encoded.bytes).await;
                }
                Err(e) => warn!(error = %e, "failed to encode stored message"),
            }
        }
    }

    /// Sends `bytes` to every current peer. Returns the number of successful
    /// sends.
    pub(crate) async fn broadcast(&self, bytes: &[u8]) -> usize {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            warn!(size = bytes.len(), "skipping broadcast of oversized payload");
            return 0;
        }
        let peers = self.state.lock().peers.to_vec();
        let mut delivered = 0;
        let mut failed = Vec::new();
        for peer in peers {
            match self.transport.send(bytes, &peer).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "send failed, dropping peer");
                    failed.push(peer);
                }
            }
        }
        if !failed.is_empty() {
            {
                let mut state = self.state.lock();
                for peer in &failed {
                    state.drop_peer(peer);
                }
            }
            self.persist().await;
        }
        delivered
    }
}
