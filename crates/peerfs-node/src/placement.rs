//! Download placement: which division size to fetch, and which peer serves
//! which blocks.
//!
//! The division size advertised by the most peers wins; ties go to the
//! node's preferred block size, then to the larger division. The needed
//! blocks are cut into contiguous slices, one per advertising peer, with the
//! remainder handed out one block at a time starting from the first peer.
//! A block a slice's peer does not hold moves to the least-loaded peer that
//! does.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use peerfs_protocol::{BlockSet, Datagram, HostId, PeerHolding};
use serde::Serialize;

/// Blocks assigned to one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub host: HostId,
    /// Sorted block numbers this peer is asked for.
    pub blocks: Vec<u16>,
    /// Whether the request covers the whole file, so a GET_FULL_FILE suffices.
    pub whole_file: bool,
}

impl Assignment {
    pub fn request(&self, hash: &str, division_size: u16) -> Datagram {
        if self.whole_file {
            Datagram::GetFull {
                hash: hash.to_string(),
                division_size,
            }
        } else {
            Datagram::GetPartial {
                hash: hash.to_string(),
                division_size,
                blocks: BlockSet::from_numbers(self.blocks.iter().copied()),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub division_size: u16,
    /// Total blocks of the file at this division, when some peer holds the
    /// last block.
    pub block_count: Option<u16>,
    pub assignments: Vec<Assignment>,
    /// Needed blocks no peer advertises.
    pub unavailable: Vec<u16>,
}

impl Plan {
    /// Every block number requested from some peer.
    pub fn requested(&self) -> BTreeSet<u16> {
        self.assignments
            .iter()
            .flat_map(|a| a.blocks.iter().copied())
            .collect()
    }
}

/// Division size advertised by the most peers.
pub fn choose_division(peers: &[PeerHolding], preferred: u16) -> Option<u16> {
    let mut counts: BTreeMap<u16, usize> = BTreeMap::new();
    for peer in peers {
        let sizes: BTreeSet<u16> = peer.divisions.iter().map(|d| d.division_size).collect();
        for size in sizes {
            *counts.entry(size).or_default() += 1;
        }
    }
    let best = counts.values().copied().max()?;
    let tied: Vec<u16> = counts
        .into_iter()
        .filter(|&(_, n)| n == best)
        .map(|(size, _)| size)
        .collect();
    if tied.contains(&preferred) {
        Some(preferred)
    } else {
        tied.last().copied()
    }
}

/// Plan a download of the blocks not in `have`.
///
/// `None` when no peer advertises anything.
pub fn plan(peers: &[PeerHolding], preferred: u16, have: &[u16]) -> Option<Plan> {
    let division_size = choose_division(peers, preferred)?;

    // (host, blocks held) of every peer advertising the chosen division, in
    // response order.
    let holders: Vec<(&HostId, BTreeSet<u16>, bool)> = peers
        .iter()
        .filter_map(|p| {
            let d = p.divisions.iter().find(|d| d.division_size == division_size)?;
            Some((&p.host, d.block_numbers().into_iter().collect(), d.is_full()))
        })
        .collect();

    let block_count = peers
        .iter()
        .flat_map(|p| p.divisions.iter())
        .filter(|d| d.division_size == division_size && d.last_block_size > 0)
        .filter_map(|d| d.block_numbers().last().copied())
        .max();

    let advertised: BTreeSet<u16> = holders.iter().flat_map(|(_, b, _)| b.iter().copied()).collect();
    let have: BTreeSet<u16> = have.iter().copied().collect();
    let needed: Vec<u16> = match block_count {
        Some(n) => (1..=n).filter(|b| !have.contains(b)).collect(),
        None => advertised.iter().copied().filter(|b| !have.contains(b)).collect(),
    };

    // Contiguous slices, remainder to the first peers.
    let k = holders.len();
    let base = needed.len() / k;
    let extra = needed.len() % k;
    let mut slices: Vec<Vec<u16>> = Vec::with_capacity(k);
    let mut start = 0;
    for i in 0..k {
        let len = base + usize::from(i < extra);
        slices.push(needed[start..start + len].to_vec());
        start += len;
    }

    let mut load: Vec<Vec<u16>> = vec![Vec::new(); k];
    let mut orphans = Vec::new();
    let mut unavailable = Vec::new();
    for (i, slice) in slices.into_iter().enumerate() {
        for block in slice {
            if holders[i].1.contains(&block) {
                load[i].push(block);
            } else {
                orphans.push(block);
            }
        }
    }
    for block in orphans {
        let target = (0..k)
            .filter(|&j| holders[j].1.contains(&block))
            .min_by_key(|&j| load[j].len());
        match target {
            Some(j) => load[j].push(block),
            None => unavailable.push(block),
        }
    }

    let assignments = holders
        .iter()
        .zip(load)
        .filter(|(_, blocks)| !blocks.is_empty())
        .map(|((host, _, full), mut blocks)| {
            blocks.sort_unstable();
            let whole_file = *full
                && block_count.is_some_and(|n| {
                    blocks.len() == usize::from(n) && blocks.first() == Some(&1)
                });
            Assignment {
                host: (*host).clone(),
                blocks,
                whole_file,
            }
        })
        .collect();

    Some(Plan {
        division_size,
        block_count,
        assignments,
        unavailable,
    })
}

/// UDP address of a peer. Identities that already carry a port are used as
/// they are; bare hosts get `default_port`.
pub async fn resolve_peer(host: &str, default_port: u16) -> std::io::Result<SocketAddr> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host((host, default_port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for peer {host}"),
            )
        })
}
