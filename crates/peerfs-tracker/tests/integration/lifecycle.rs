//! Session lifecycle: leave, abrupt disconnect, rejected input, status.

use peerfs_protocol::{FullDivision, FullFile, Request, Response, Status};
use peerfs_tracker::SessionEnd;

use crate::harness::TestTracker;

fn one_file(hash: &str) -> Request {
    Request::UpdateFullFiles(vec![FullFile {
        hash: hash.into(),
        name: "notes.txt".into(),
        divisions: vec![FullDivision {
            division_size: 512,
            last_block_size: 512,
            block_count: 3,
        }],
    }])
}

fn peer_count(response: Response) -> usize {
    match response {
        Response::LocateHash { peers, .. } => peers.len(),
        other => panic!("unexpected response {other:?}"),
    }
}

/// An abrupt close purges the node: other nodes see zero entries for it.
#[tokio::test]
async fn test_disconnect_cleanup() {
    let tracker = TestTracker::new();
    let mut node1 = tracker.connect("node1");
    let mut node2 = tracker.connect("node2");

    node1.request(one_file("abc")).await;
    assert_eq!(
        peer_count(node2.request(Request::LocateHash { hash: "abc".into() }).await),
        1
    );

    assert_eq!(node1.disconnect().await, SessionEnd::Disconnected);

    match node2.request(Request::LocateHash { hash: "abc".into() }).await {
        Response::LocateHash { status, peers, .. } => {
            assert_eq!(status, Status::NotFound);
            assert!(peers.is_empty());
        }
        other => panic!("unexpected response {other:?}"),
    }
    assert_eq!(tracker.inventory.get_status("node1").unwrap(), None);
}

#[tokio::test]
async fn test_leave_is_acknowledged_and_purges() {
    let tracker = TestTracker::new();
    let mut node1 = tracker.connect("node1");
    let mut node2 = tracker.connect("node2");

    node1.request(one_file("abc")).await;
    assert_eq!(
        node1.request(Request::Leave).await,
        Response::Status { status: Status::Success, counter: 2 }
    );
    assert_eq!(node1.finished().await, SessionEnd::Left);

    assert_eq!(
        peer_count(node2.request(Request::LocateHash { hash: "abc".into() }).await),
        0
    );
}

/// Shared blocks survive while any holder remains.
#[tokio::test]
async fn test_disconnect_keeps_other_holders() {
    let tracker = TestTracker::new();
    let mut a = tracker.connect("a");
    let mut b = tracker.connect("b");
    let mut asker = tracker.connect("asker");

    a.request(one_file("abc")).await;
    b.request(one_file("abc")).await;
    a.disconnect().await;

    match asker.request(Request::LocateHash { hash: "abc".into() }).await {
        Response::LocateHash { peers, .. } => {
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].host, "b");
            assert!(peers[0].divisions[0].is_full());
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_action_closes_connection() {
    let tracker = TestTracker::new();
    let mut node = tracker.connect("node1");

    node.request(Request::UpdateStatus { status: 1 }).await;
    node.send_raw(&[0x2a]).await;
    assert_eq!(
        node.next_response().await,
        Some(Response::Status { status: Status::InvalidAction, counter: 2 })
    );
    assert_eq!(node.next_response().await, None);
}

#[tokio::test]
async fn test_malformed_request_rejected() {
    let tracker = TestTracker::new();
    let mut node = tracker.connect("node1");

    // UPDATE_PARTIAL whose block set carries the inverted run (9, 2)
    let mut bytes = vec![0x01, 0x00, 0x01];
    bytes.extend_from_slice(&[0x00, 0x01, b'h']);
    bytes.extend_from_slice(&[0x01, b'n', 0x01]);
    bytes.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
    bytes.extend_from_slice(&[0x01, 0x00, 0x09, 0x00, 0x02, 0x00, 0x00]);
    node.send_raw(&bytes).await;

    assert_eq!(
        node.next_response().await,
        Some(Response::Status { status: Status::InvalidRequest, counter: 1 })
    );
    assert_eq!(node.finished().await, SessionEnd::Rejected(Status::InvalidRequest));
}

#[tokio::test]
async fn test_status_visible_to_peers() {
    let tracker = TestTracker::new();
    let mut node1 = tracker.connect("node1");
    let mut node2 = tracker.connect("node2");

    node1.request(Request::UpdateStatus { status: 9 }).await;
    assert_eq!(
        node2.request(Request::CheckStatus { host: "node1".into() }).await,
        Response::CheckStatus { status: Status::Success, node_status: 9, counter: 1 }
    );
    assert_eq!(
        node2.request(Request::CheckStatus { host: "node3".into() }).await,
        Response::CheckStatus { status: Status::NotFound, node_status: 0, counter: 2 }
    );
}
