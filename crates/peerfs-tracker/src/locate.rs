//! Turns flat inventory rows into the grouped shapes the locate responses carry.

use peerfs_inventory::{LocatedBlock, NameHit};
use peerfs_protocol::{BlockSet, DivisionHolding, Holding, NameMatch, PeerHolding};

/// Group `locate_by_hash` rows by peer, then by division size.
///
/// Rows must arrive ordered by host, division size descending and block
/// number ascending, which is what the inventory returns. A division is
/// reported as a full claim when the peer holds exactly 1..=N and block N is
/// the file's last block; anything else is sent as a block set.
pub fn group_by_peer(rows: &[LocatedBlock]) -> Vec<PeerHolding> {
    let mut peers: Vec<PeerHolding> = Vec::new();
    let mut start = 0;
    while start < rows.len() {
        let host = &rows[start].host;
        let end = start + rows[start..].iter().take_while(|r| &r.host == host).count();
        peers.push(PeerHolding {
            host: host.clone(),
            divisions: group_divisions(&rows[start..end]),
        });
        start = end;
    }
    peers
}

fn group_divisions(rows: &[LocatedBlock]) -> Vec<DivisionHolding> {
    let mut divisions = Vec::new();
    let mut start = 0;
    while start < rows.len() {
        let division_size = rows[start].division_size;
        let end = start
            + rows[start..]
                .iter()
                .take_while(|r| r.division_size == division_size)
                .count();
        divisions.push(division_holding(division_size, &rows[start..end]));
        start = end;
    }
    divisions
}

fn division_holding(division_size: u16, rows: &[LocatedBlock]) -> DivisionHolding {
    let last = rows.iter().find(|r| r.is_last);
    let last_block_size = last.map(|r| r.size).unwrap_or(0);

    let contiguous = rows
        .iter()
        .enumerate()
        .all(|(i, r)| usize::from(r.number) == i + 1);
    let holding = match last {
        Some(last) if contiguous && usize::from(last.number) == rows.len() => Holding::Full {
            block_count: last.number,
        },
        _ => Holding::Partial {
            blocks: BlockSet::from_numbers(rows.iter().map(|r| r.number)),
        },
    };

    DivisionHolding {
        division_size,
        last_block_size,
        holding,
    }
}

/// Group `locate_by_name` hits (ordered by hash, then host) by hash.
pub fn group_name_hits(hits: &[NameHit]) -> Vec<NameMatch> {
    let mut matches: Vec<NameMatch> = Vec::new();
    for hit in hits {
        match matches.last_mut() {
            Some(m) if m.hash == hit.hash => {
                if !m.hosts.contains(&hit.host) {
                    m.hosts.push(hit.host.clone());
                }
            }
            _ => matches.push(NameMatch {
                hash: hit.hash.clone(),
                hosts: vec![hit.host.clone()],
            }),
        }
    }
    matches
}
