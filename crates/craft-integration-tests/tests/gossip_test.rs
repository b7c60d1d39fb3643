//! End-to-end propagation tests over loopback UDP.

use std::sync::Arc;
use std::time::Duration;

use craft_integration_tests::{SharedNumber, TEST_INTERVAL, spawn_node, test_config, wait_until};
use craft_node::{CraftNode, NodeError, PeerAddr, SharedMessage, SharedObject, handle};
use parking_lot::Mutex;
use serde_json::json;

fn register_number(node: &CraftNode) -> Arc<Mutex<SharedNumber>> {
    let number = Arc::new(Mutex::new(SharedNumber::default()));
    node.add_shared_object(number.clone());
    number
}

async fn connected_pair() -> (CraftNode, CraftNode) {
    let a = spawn_node(test_config()).await;
    let b = spawn_node(test_config()).await;
    a.connect_to_peer(b.local_addr(), true).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || b.peers().contains(&a.local_addr())).await,
        "announce should make b connect back"
    );
    (a, b)
}

#[tokio::test]
async fn message_reaches_peer_within_gossip_interval() {
    let (a, b) = connected_pair().await;

    let (digest, _) = a.create_shared_message(json!({"x": 1})).await.unwrap();

    assert!(wait_until(TEST_INTERVAL * 3, || b.has_message(&digest)).await);
    assert_eq!(
        b.get_message(&digest),
        Some(SharedMessage::new(json!({"x": 1})))
    );

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn messages_flood_along_a_line() {
    let a = spawn_node(test_config()).await;
    let b = spawn_node(test_config()).await;
    let c = spawn_node(test_config()).await;
    a.connect_to_peer(b.local_addr(), true).await.unwrap();
    b.connect_to_peer(c.local_addr(), true).await.unwrap();

    let (digest, _) = a.create_shared_message("hello").await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || c.has_message(&digest)).await);

    for node in [&a, &b, &c] {
        node.stop().await;
    }
}

#[tokio::test]
async fn shared_objects_absorb_remote_messages() {
    let (a, b) = connected_pair().await;
    let a_number = register_number(&a);
    let b_number = register_number(&b);

    for n in [1, 2, 3] {
        a.create_shared_message(n).await.unwrap();
    }

    assert!(wait_until(Duration::from_secs(3), || b_number.lock().total() == 6).await);
    assert_eq!(a_number.lock().total(), 6);
    assert_eq!(b_number.lock().count(), 3);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn gossip_is_idempotent() {
    let (a, b) = connected_pair().await;
    let (digest, _) = a.create_shared_message("once").await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || b.has_message(&digest)).await);

    // Several gossip rounds re-send the same bytes.
    tokio::time::sleep(TEST_INTERVAL * 5).await;

    let stored = b
        .message_digests()
        .into_iter()
        .filter(|d| b.get_message(d) == Some(SharedMessage::new("once")))
        .count();
    assert_eq!(stored, 1);
    assert!(b.stats().duplicates_dropped > 0);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn refused_local_message_is_an_error() {
    struct EvenOnly;

    impl SharedObject for EvenOnly {
        fn is_valid(&self, message: &SharedMessage) -> bool {
            message.data.as_i64().is_none_or(|n| n % 2 == 0)
        }

        fn add_message(&mut self, _message: &SharedMessage) {}
    }

    let node = spawn_node(test_config()).await;
    node.add_shared_object(handle(EvenOnly));

    assert!(node.create_shared_message(2).await.is_ok());
    let err = node.create_shared_message(3).await.unwrap_err();
    assert!(matches!(
        err,
        NodeError::SharedObjectRejected { ref class_name } if class_name == "EvenOnly"
    ));
    assert_eq!(node.message_count(), 1);

    node.stop().await;
}

#[tokio::test]
async fn failed_send_drops_peer() {
    let node = spawn_node(test_config()).await;
    // An IPv6 destination cannot be reached from an IPv4 socket.
    node.connect_to_peer(PeerAddr::new("::1", 9), false)
        .await
        .unwrap();
    assert_eq!(node.peers().len(), 1);

    node.create_shared_message("ping").await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || node.peers().is_empty()).await);
    assert_eq!(node.stats().peers_dropped, 1);

    node.stop().await;
}
