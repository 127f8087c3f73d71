//! Tracker-facing node operations.

use peerfs_blockstore::hash_file_contents;
use peerfs_node::commands::{self, Command};
use peerfs_protocol::Status;

use crate::harness::{content, TestNetwork};

#[tokio::test]
async fn test_status_roundtrip_between_nodes() {
    let net = TestNetwork::new();
    let mut node1 = net.node(1024).await;
    let mut node2 = net.node(1024).await;

    assert_eq!(node1.node.update_status(42).await.unwrap(), Status::Success);
    assert_eq!(
        node2.node.check_status(&node1.identity).await.unwrap(),
        (Status::Success, 42)
    );
    assert_eq!(
        node2.node.check_status("nobody").await.unwrap(),
        (Status::NotFound, 0)
    );
}

#[tokio::test]
async fn test_locate_hash_with_name() {
    let net = TestNetwork::new();
    let mut seed = net.node(1024).await;
    let mut asker = net.node(1024).await;

    let data = content(3000);
    seed.put_file("report.pdf", &data);
    let hash = hash_file_contents("report.pdf", &data[..]).unwrap();
    seed.node.update().await.unwrap();

    let located = asker.node.locate_hash_with_name("report.pdf").await.unwrap();
    assert_eq!(located.len(), 1);
    assert_eq!(located[0].hash, hash);
    assert_eq!(located[0].hosts, vec![seed.identity.clone()]);
    assert_eq!(located[0].status, Status::Success);
    assert_eq!(located[0].peers[0].divisions[0].block_numbers(), vec![1, 2, 3]);

    assert!(asker.node.locate_hash_with_name("absent").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_leave_removes_holdings() {
    let net = TestNetwork::new();
    let mut seed = net.node(1024).await;
    let mut asker = net.node(1024).await;

    let data = content(100);
    seed.put_file("tiny.txt", &data);
    let hash = hash_file_contents("tiny.txt", &data[..]).unwrap();
    seed.node.update().await.unwrap();
    assert_eq!(asker.node.locate_hash(&hash).await.unwrap().peers.len(), 1);

    let outcome = commands::execute(&mut seed.node, Command::Leave).await.unwrap();
    assert!(outcome.quit);
    assert_eq!(outcome.output["status"], "Success");

    // The tracker purges after acknowledging; poll until it has.
    let mut located = asker.node.locate_hash(&hash).await.unwrap();
    for _ in 0..20 {
        if located.peers.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        located = asker.node.locate_hash(&hash).await.unwrap();
    }
    assert_eq!(located.status, Status::NotFound);
    assert!(located.peers.is_empty());
}

#[tokio::test]
async fn test_help_command_output() {
    let net = TestNetwork::new();
    let mut node = net.node(1024).await;
    let command = commands::parse("h").unwrap().unwrap();
    let outcome = commands::execute(&mut node.node, command).await.unwrap();
    assert!(!outcome.quit);
    assert!(outcome.output.as_str().unwrap().contains("join blocks"));
}
