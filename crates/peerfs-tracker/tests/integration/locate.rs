//! Locate queries across several nodes.

use peerfs_protocol::{
    BlockSet, DivisionHolding, FullDivision, FullFile, Holding, NameMatch, PartialDivision,
    PartialFile, Request, Response, Status,
};

use crate::harness::TestTracker;

const REPORT_HASH: &str = "5d41402abc4b2a76b9719d911017c592ae4f2a8c3b2f0a7c1f4e0d9c8b7a6f5e";

fn report_full() -> Request {
    Request::UpdateFullFiles(vec![FullFile {
        hash: REPORT_HASH.into(),
        name: "report.pdf".into(),
        divisions: vec![FullDivision {
            division_size: 256,
            last_block_size: 100,
            block_count: 5,
        }],
    }])
}

/// node1 reports report.pdf as 5 blocks of 256; node2 locates it by hash.
#[tokio::test]
async fn test_report_located_by_other_node() {
    let tracker = TestTracker::new();
    let mut node1 = tracker.connect("node1");
    let mut node2 = tracker.connect("node2");

    assert_eq!(
        node1.request(report_full()).await,
        Response::Status { status: Status::Success, counter: 1 }
    );

    let response = node2
        .request(Request::LocateHash { hash: REPORT_HASH.into() })
        .await;
    match response {
        Response::LocateHash { status, peers, counter } => {
            assert_eq!(status, Status::Success);
            assert_eq!(counter, 1);
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].host, "node1");
            assert_eq!(
                peers[0].divisions,
                vec![DivisionHolding {
                    division_size: 256,
                    last_block_size: 100,
                    holding: Holding::Full { block_count: 5 },
                }]
            );
        }
        other => panic!("unexpected response {other:?}"),
    }

    // node1 never sees itself
    match node1
        .request(Request::LocateHash { hash: REPORT_HASH.into() })
        .await
    {
        Response::LocateHash { status, peers, .. } => {
            assert_eq!(status, Status::NotFound);
            assert!(peers.is_empty());
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[tokio::test]
async fn test_partial_holder_reported_as_block_set() {
    let tracker = TestTracker::new();
    let mut seeder = tracker.connect("seeder");
    let mut leecher = tracker.connect("leecher");
    let mut asker = tracker.connect("asker");

    seeder.request(report_full()).await;
    let partial = Request::UpdatePartial(vec![PartialFile {
        hash: REPORT_HASH.into(),
        name: "report.pdf".into(),
        divisions: vec![PartialDivision {
            division_size: 256,
            last_block_size: 0,
            blocks: BlockSet::from_numbers([1, 2, 4]),
        }],
    }]);
    assert_eq!(leecher.request(partial).await.status(), Status::Success);

    match asker
        .request(Request::LocateHash { hash: REPORT_HASH.into() })
        .await
    {
        Response::LocateHash { peers, .. } => {
            assert_eq!(peers.len(), 2);
            let leecher = peers.iter().find(|p| p.host == "leecher").unwrap();
            assert_eq!(leecher.divisions[0].block_numbers(), vec![1, 2, 4]);
            assert!(!leecher.divisions[0].is_full());
            let seeder = peers.iter().find(|p| p.host == "seeder").unwrap();
            assert!(seeder.divisions[0].is_full());
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[tokio::test]
async fn test_locate_name_groups_hosts_per_hash() {
    let tracker = TestTracker::new();
    let mut a = tracker.connect("a");
    let mut b = tracker.connect("b");
    let mut asker = tracker.connect("asker");

    a.request(report_full()).await;
    b.request(report_full()).await;
    // Same name, different content
    b.request(Request::UpdateFullFiles(vec![FullFile {
        hash: "ffff".into(),
        name: "report.pdf".into(),
        divisions: vec![FullDivision {
            division_size: 1024,
            last_block_size: 12,
            block_count: 1,
        }],
    }]))
    .await;

    match asker
        .request(Request::LocateName { name: "report.pdf".into() })
        .await
    {
        Response::LocateName { status, mut matches, .. } => {
            assert_eq!(status, Status::Success);
            matches.sort_by(|x, y| x.hash.cmp(&y.hash));
            assert_eq!(
                matches,
                vec![
                    NameMatch { hash: REPORT_HASH.into(), hosts: vec!["a".into(), "b".into()] },
                    NameMatch { hash: "ffff".into(), hosts: vec!["b".into()] },
                ]
            );
        }
        other => panic!("unexpected response {other:?}"),
    }

    match asker
        .request(Request::LocateName { name: "missing.txt".into() })
        .await
    {
        Response::LocateName { status, matches, .. } => {
            assert_eq!(status, Status::NotFound);
            assert!(matches.is_empty());
        }
        other => panic!("unexpected response {other:?}"),
    }
}
