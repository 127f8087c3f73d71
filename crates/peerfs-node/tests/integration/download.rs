//! Block downloads between nodes over localhost UDP.

use peerfs_blockstore::hash_file_contents;
use peerfs_protocol::Status;

use crate::harness::{content, TestNetwork};

/// node1 shares report.pdf as 5 blocks of 256; node2 downloads and joins it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_get_whole_file_from_one_peer() {
    let net = TestNetwork::new();
    let mut node1 = net.node(256).await;
    let mut node2 = net.node(256).await;

    let data = content(1124);
    node1.put_file("report.pdf", &data);
    let hash = hash_file_contents("report.pdf", &data[..]).unwrap();

    let update = node1.node.update().await.unwrap();
    assert_eq!(update.full_status, Some(Status::Success));
    assert_eq!(update.divided, vec![("report.pdf".to_string(), 5)]);

    let report = node2.node.get(&hash, Some("report.pdf")).await.unwrap();
    assert_eq!(report.division_size, 256);
    assert_eq!(report.block_count, Some(5));
    assert_eq!(report.assignments.len(), 1);
    assert!(report.assignments[0].whole_file);
    assert!(report.missing.is_empty(), "missing blocks: {:?}", report.missing);
    assert!(report.complete);

    let joined = node2.node.join("report.pdf", Some(256)).unwrap();
    assert_eq!(joined, hash);
    assert_eq!(node2.read_file("report.pdf"), data);

    node1.shutdown().await;
    node2.shutdown().await;
}

/// Two seeders split the blocks; the remainder goes to the first.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_get_splits_across_seeders() {
    let net = TestNetwork::new();
    let mut seed_a = net.node(512).await;
    let mut seed_b = net.node(512).await;
    let mut leech = net.node(512).await;

    let data = content(512 * 4 + 37);
    seed_a.put_file("video.bin", &data);
    seed_b.put_file("video.bin", &data);
    let hash = hash_file_contents("video.bin", &data[..]).unwrap();
    seed_a.node.update().await.unwrap();
    seed_b.node.update().await.unwrap();

    let report = leech.node.get(&hash, Some("video.bin")).await.unwrap();
    assert_eq!(report.block_count, Some(5));
    let mut sizes: Vec<usize> = report.assignments.iter().map(|a| a.blocks.len()).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![2, 3]);
    assert!(report.assignments.iter().all(|a| !a.whole_file));
    assert!(report.complete, "missing blocks: {:?}", report.missing);

    assert_eq!(leech.node.join("video.bin", None).unwrap(), hash);
    assert_eq!(leech.read_file("video.bin"), data);

    seed_a.shutdown().await;
    seed_b.shutdown().await;
    leech.shutdown().await;
}

/// A node that downloaded blocks reports them, and becomes a source itself.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_downloaded_blocks_are_reported() {
    let net = TestNetwork::new();
    let mut seed = net.node(256).await;
    let mut middle = net.node(256).await;
    let mut asker = net.node(256).await;

    let data = content(700);
    seed.put_file("notes.txt", &data);
    let hash = hash_file_contents("notes.txt", &data[..]).unwrap();
    seed.node.update().await.unwrap();

    let report = middle.node.get(&hash, Some("notes.txt")).await.unwrap();
    assert!(report.complete);

    // Blocks only, no whole file: the remembered hash makes them reportable.
    let update = middle.node.update().await.unwrap();
    assert!(update.skipped.is_empty());
    assert_eq!(update.full_status, Some(Status::Success));

    let located = asker.node.locate_hash(&hash).await.unwrap();
    assert_eq!(located.status, Status::Success);
    let mut hosts: Vec<&str> = located.peers.iter().map(|p| p.host.as_str()).collect();
    hosts.sort_unstable();
    let mut expected = vec![seed.identity.as_str(), middle.identity.as_str()];
    expected.sort_unstable();
    assert_eq!(hosts, expected);
    assert!(located.peers.iter().all(|p| p.divisions[0].is_full()));

    seed.shutdown().await;
    middle.shutdown().await;
    asker.shutdown().await;
}

#[tokio::test]
async fn test_get_unknown_hash_fails() {
    let net = TestNetwork::new();
    let mut node = net.node(256).await;
    let err = node.node.get("feedface", Some("x.bin")).await.unwrap_err();
    assert!(err.to_string().contains("cannot locate"));

    // Without a name and no local record of the hash
    assert!(node.node.get("feedface", None).await.is_err());
    node.shutdown().await;
}
