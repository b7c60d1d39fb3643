//! Multi-node test support for craft-node.
//!
//! Holds the reference shared objects used by the tests under `tests/` and a
//! few helpers for running nodes on loopback.

#![forbid(unsafe_code)]

use std::time::Duration;

use craft_node::{CraftNode, NodeConfig, SharedMessage, SharedObject};
use sha2::{Digest as _, Sha256};

/// Gossip interval used by test nodes.
pub const TEST_INTERVAL: Duration = Duration::from_millis(100);

/// A loopback config on an OS-assigned port with a short gossip interval.
#[must_use]
pub fn test_config() -> NodeConfig {
    NodeConfig::new()
        .with_port(0)
        .with_gossip_interval(TEST_INTERVAL)
}

/// Binds and starts a node.
pub async fn spawn_node(config: NodeConfig) -> CraftNode {
    let node = CraftNode::bind(config).await.expect("bind test node");
    node.start().expect("start test node");
    node
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Sums every integer message it sees.
#[derive(Debug, Default)]
pub struct SharedNumber {
    total: i64,
    count: usize,
}

impl SharedNumber {
    /// Running total.
    #[must_use]
    pub const fn total(&self) -> i64 {
        self.total
    }

    /// Number of integers absorbed.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }
}

impl SharedObject for SharedNumber {
    fn is_valid(&self, _message: &SharedMessage) -> bool {
        true
    }

    fn add_message(&mut self, message: &SharedMessage) {
        if let Some(n) = message.data.as_i64() {
            self.total += n;
            self.count += 1;
        }
    }
}

/// SHA-256 hex of `input`.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// A hash chain starting at `sha256("genesis")` where each link is the
/// SHA-256 of the previous one. Links travel as string messages.
#[derive(Debug, Clone)]
pub struct HashChain {
    chain: Vec<String>,
}

impl Default for HashChain {
    fn default() -> Self {
        Self {
            chain: vec![sha256_hex("genesis")],
        }
    }
}

impl HashChain {
    /// A chain holding only the genesis link.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The links, genesis first.
    #[must_use]
    pub fn links(&self) -> &[String] {
        &self.chain
    }

    /// Number of links including genesis.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Always false; the genesis link is never removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// The link that would follow the current head.
    #[must_use]
    pub fn next_link(&self) -> String {
        self.chain
            .last()
            .map_or_else(|| sha256_hex("genesis"), |head| sha256_hex(head))
    }
}

impl SharedObject for HashChain {
    fn class_name(&self) -> &str {
        "HashChain"
    }

    // Non-string payloads belong to other objects and pass through.
    fn is_valid(&self, message: &SharedMessage) -> bool {
        match message.data.as_str() {
            Some(link) => self.chain.iter().any(|l| l == link) || link == self.next_link(),
            None => true,
        }
    }

    fn add_message(&mut self, message: &SharedMessage) {
        if let Some(link) = message.data.as_str() {
            if link == self.next_link() {
                self.chain.push(link.to_string());
            }
        }
    }

    fn is_merkelized(&self) -> bool {
        true
    }

    fn get_latest_digest(&self) -> Option<String> {
        self.chain.last().cloned()
    }

    fn is_valid_digest(&self, digest: &str) -> bool {
        self.chain.iter().any(|l| l == digest)
    }

    fn gossip_object(&self, digest: &str) -> Vec<SharedMessage> {
        let Some(index) = self.chain.iter().position(|l| l == digest) else {
            return Vec::new();
        };
        self.chain[index + 1..]
            .iter()
            .map(|link| SharedMessage::new(link.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extend(chain: &mut HashChain, n: usize) {
        for _ in 0..n {
            let link = SharedMessage::new(chain.next_link());
            assert!(chain.is_valid(&link));
            chain.add_message(&link);
        }
    }

    #[test]
    fn chain_links_hash_previous() {
        let mut chain = HashChain::new();
        extend(&mut chain, 3);
        assert_eq!(chain.len(), 4);
        for pair in chain.links().windows(2) {
            assert_eq!(pair[1], sha256_hex(&pair[0]));
        }
    }

    #[test]
    fn out_of_order_link_is_invalid() {
        let mut ahead = HashChain::new();
        extend(&mut ahead, 2);
        let behind = HashChain::new();
        let skipped = SharedMessage::new(ahead.links()[2].clone());
        assert!(!behind.is_valid(&skipped));
    }

    #[test]
    fn gossip_object_returns_strict_suffix() {
        let mut chain = HashChain::new();
        extend(&mut chain, 3);
        let links = chain.links().to_vec();

        let suffix = chain.gossip_object(&links[1]);
        assert_eq!(
            suffix,
            vec![SharedMessage::new(links[2].clone()), SharedMessage::new(links[3].clone())]
        );
        assert!(chain.gossip_object(&links[3]).is_empty());
        assert!(chain.gossip_object("unknown").is_empty());
    }

    #[test]
    fn non_string_payloads_pass_through() {
        let chain = HashChain::new();
        assert!(chain.is_valid(&SharedMessage::new(serde_json::json!({"x": 1}))));
    }

    #[test]
    fn shared_number_sums_integers_only() {
        let mut number = SharedNumber::default();
        number.add_message(&SharedMessage::new(2));
        number.add_message(&SharedMessage::new("x"));
        number.add_message(&SharedMessage::new(5));
        assert_eq!(number.total(), 7);
        assert_eq!(number.count(), 2);
    }
}
