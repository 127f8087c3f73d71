//! Node controller: ties the block store, the transfer engine and the
//! tracker connection together behind the operations the command loop runs.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use peerfs_blockstore::{BlockStore, BlockStoreError, FileRef, LocalFile};
use peerfs_protocol::{
    BlockSet, FileHash, FullDivision, FullFile, NameMatch, PartialDivision, PartialFile,
    PeerHolding, Status,
};
use peerfs_transfer::{TransferEngine, TransferEvent};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;

use crate::control::TrackerClient;
use crate::placement::{self, Assignment};

/// Outcome of reporting local holdings to the tracker.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    /// Whole files divided at the node's block size, with their block counts.
    pub divided: Vec<(String, u16)>,
    pub full_files: usize,
    pub partial_files: usize,
    pub full_status: Option<Status>,
    pub partial_status: Option<Status>,
    /// Block-only holdings whose hash is unknown and cannot be reported.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Located {
    pub status: Status,
    pub peers: Vec<PeerHolding>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedLocation {
    pub hash: FileHash,
    pub hosts: Vec<String>,
    pub status: Status,
    pub peers: Vec<PeerHolding>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub hash: FileHash,
    pub file_name: String,
    pub division_size: u16,
    pub block_count: Option<u16>,
    pub assignments: Vec<Assignment>,
    /// Needed blocks still absent after the download finished or timed out.
    pub missing: Vec<u16>,
    /// Every block of the division is present; the file can be joined.
    pub complete: bool,
}

/// Split scanned holdings into full claims and partial claims. Files whose
/// hash is unknown are returned by name in the third list.
pub fn build_updates(files: &[LocalFile]) -> (Vec<FullFile>, Vec<PartialFile>, Vec<String>) {
    let mut full = Vec::new();
    let mut partial = Vec::new();
    let mut skipped = Vec::new();

    for file in files {
        let Some(hash) = &file.hash else {
            skipped.push(file.name.clone());
            continue;
        };
        let mut full_divisions = Vec::new();
        let mut partial_divisions = Vec::new();
        for set in &file.divisions {
            match set.block_count() {
                Some(block_count) => full_divisions.push(FullDivision {
                    division_size: set.division_size,
                    last_block_size: set.last_block_size,
                    block_count,
                }),
                None if !set.numbers.is_empty() => partial_divisions.push(PartialDivision {
                    division_size: set.division_size,
                    last_block_size: set.last_block_size,
                    blocks: BlockSet::from_numbers(set.numbers.iter().copied()),
                }),
                None => {}
            }
        }
        if !full_divisions.is_empty() {
            full.push(FullFile {
                hash: hash.clone(),
                name: file.name.clone(),
                divisions: full_divisions,
            });
        }
        if !partial_divisions.is_empty() {
            partial.push(PartialFile {
                hash: hash.clone(),
                name: file.name.clone(),
                divisions: partial_divisions,
            });
        }
    }
    (full, partial, skipped)
}

pub struct Node<S = TcpStream> {
    store: Arc<dyn BlockStore>,
    engine: TransferEngine,
    tracker: TrackerClient<S>,
    block_size: u16,
    peer_port: u16,
}

impl<S> Node<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(engine: TransferEngine, tracker: TrackerClient<S>, block_size: u16, peer_port: u16) -> Self {
        Self {
            store: engine.store().clone(),
            engine,
            tracker,
            block_size,
            peer_port,
        }
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    /// Divide local files and report every holding to the tracker.
    pub async fn update(&mut self) -> anyhow::Result<UpdateReport> {
        let divided = self.store.divide_all(self.block_size)?;
        let files = self.store.scan()?;
        let (full, partial, skipped) = build_updates(&files);
        for name in &skipped {
            tracing::warn!(file = %name, "node: hash unknown, not reported");
        }

        let full_files = full.len();
        let partial_files = partial.len();
        let full_status = if full.is_empty() {
            None
        } else {
            Some(self.tracker.update_full(full).await?)
        };
        let partial_status = if partial.is_empty() {
            None
        } else {
            Some(self.tracker.update_partial(partial).await?)
        };
        tracing::info!(full_files, partial_files, "node: holdings reported");

        Ok(UpdateReport {
            divided,
            full_files,
            partial_files,
            full_status,
            partial_status,
            skipped,
        })
    }

    pub async fn locate_hash(&mut self, hash: &str) -> anyhow::Result<Located> {
        let (status, peers) = self.tracker.locate_hash(hash).await?;
        Ok(Located { status, peers })
    }

    pub async fn locate_name(&mut self, name: &str) -> anyhow::Result<(Status, Vec<NameMatch>)> {
        Ok(self.tracker.locate_name(name).await?)
    }

    /// Locate by name, then locate every returned hash.
    pub async fn locate_hash_with_name(&mut self, name: &str) -> anyhow::Result<Vec<NamedLocation>> {
        let (_, matches) = self.tracker.locate_name(name).await?;
        let mut located = Vec::with_capacity(matches.len());
        for m in matches {
            let (status, peers) = self.tracker.locate_hash(&m.hash).await?;
            located.push(NamedLocation {
                hash: m.hash,
                hosts: m.hosts,
                status,
                peers,
            });
        }
        Ok(located)
    }

    pub async fn check_status(&mut self, host: &str) -> anyhow::Result<(Status, u8)> {
        Ok(self.tracker.check_status(host).await?)
    }

    pub async fn update_status(&mut self, status: u8) -> anyhow::Result<Status> {
        Ok(self.tracker.update_status(status).await?)
    }

    /// Reassemble a downloaded file. Defaults to the node's block size.
    pub fn join(&self, file_name: &str, division_size: Option<u16>) -> anyhow::Result<FileHash> {
        let division_size = division_size.unwrap_or(self.block_size);
        let hash = self
            .store
            .join_blocks(file_name, division_size)
            .with_context(|| format!("joining {file_name} at division size {division_size}"))?;
        tracing::info!(file = file_name, division_size, %hash, "node: file joined");
        Ok(hash)
    }

    pub async fn leave(&mut self) -> anyhow::Result<Status> {
        Ok(self.tracker.leave().await?)
    }

    /// Download the blocks of `hash` this node lacks.
    ///
    /// `name` is needed unless the hash is already known locally.
    pub async fn get(&mut self, hash: &str, name: Option<&str>) -> anyhow::Result<DownloadReport> {
        let file_name = match name {
            Some(name) => name.to_string(),
            None => match self.store.file_name_for_hash(hash) {
                Ok(name) => name,
                Err(BlockStoreError::NotFound(_)) => {
                    bail!("file name for {hash} is unknown locally; pass one")
                }
                Err(e) => return Err(e.into()),
            },
        };

        let (status, peers) = self.tracker.locate_hash(hash).await?;
        if !status.is_success() {
            bail!("tracker cannot locate {hash}: {status:?}");
        }

        let division_size = placement::choose_division(&peers, self.block_size)
            .context("no peer advertises a division")?;
        let have = match self
            .store
            .get_all_block_numbers(FileRef::Name(&file_name), division_size)
        {
            Ok(have) => have,
            Err(BlockStoreError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let plan = placement::plan(&peers, self.block_size, &have)
            .context("no peer advertises a division")?;
        let needed: Vec<u16> = plan
            .requested()
            .into_iter()
            .chain(plan.unavailable.iter().copied())
            .collect();

        self.store.remember_hash(&file_name, hash)?;
        if let Some(count) = plan.block_count {
            self.engine.expect(&file_name, division_size, count);
        }

        let mut events = self.engine.subscribe();
        let mut waiting: HashSet<SocketAddr> = HashSet::new();
        for assignment in &plan.assignments {
            let peer = match placement::resolve_peer(&assignment.host, self.peer_port).await {
                Ok(peer) => peer,
                Err(e) => {
                    tracing::warn!(host = %assignment.host, "node: cannot resolve peer: {e}");
                    continue;
                }
            };
            let request = assignment.request(hash, division_size);
            match self.engine.request(peer, &request).await {
                Ok(()) => {
                    tracing::info!(%peer, blocks = assignment.blocks.len(), division_size, "node: requested blocks");
                    waiting.insert(peer);
                }
                Err(e) => tracing::warn!(%peer, "node: request failed: {e}"),
            }
        }

        let deadline = tokio::time::Instant::now() + self.engine.config().download_timeout();
        while !waiting.is_empty() {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => {
                    tracing::warn!(pending = waiting.len(), "node: download timed out");
                    break;
                }
                Ok(Ok(TransferEvent::Received {
                    peer,
                    division_size: d,
                    blocks,
                    ..
                })) if d == division_size => {
                    if waiting.remove(&peer) {
                        tracing::debug!(%peer, blocks, "node: transfer finished");
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(RecvError::Lagged(n))) => {
                    tracing::debug!(skipped = n, "node: transfer events lagged");
                }
                Ok(Err(RecvError::Closed)) => break,
            }
        }
        self.engine.forget(&file_name, division_size);

        let held: HashSet<u16> = self
            .store
            .get_all_block_numbers(FileRef::Name(&file_name), division_size)
            .unwrap_or_default()
            .into_iter()
            .collect();
        let mut missing: Vec<u16> = needed.into_iter().filter(|b| !held.contains(b)).collect();
        missing.sort_unstable();
        let complete = match plan.block_count {
            Some(n) => (1..=n).all(|b| held.contains(&b)),
            None => false,
        };
        tracing::info!(file = %file_name, division_size, missing = missing.len(), complete, "node: download finished");

        Ok(DownloadReport {
            hash: hash.to_string(),
            file_name,
            division_size,
            block_count: plan.block_count,
            assignments: plan.assignments,
            missing,
            complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerfs_blockstore::DivisionSet;

    fn set(division_size: u16, numbers: &[u16], last_block_size: u16, complete: bool) -> DivisionSet {
        DivisionSet {
            division_size,
            last_block_size,
            numbers: numbers.to_vec(),
            complete,
        }
    }

    #[test]
    fn test_build_updates_splits_full_and_partial() {
        let files = vec![
            LocalFile {
                name: "a.txt".into(),
                hash: Some("ha".into()),
                whole: true,
                divisions: vec![set(1024, &[1, 2], 10, true), set(256, &[1, 3], 0, false)],
            },
            LocalFile {
                name: "b.txt".into(),
                hash: None,
                whole: false,
                divisions: vec![set(1024, &[2], 0, false)],
            },
        ];
        let (full, partial, skipped) = build_updates(&files);

        assert_eq!(
            full,
            vec![FullFile {
                hash: "ha".into(),
                name: "a.txt".into(),
                divisions: vec![FullDivision { division_size: 1024, last_block_size: 10, block_count: 2 }],
            }]
        );
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].divisions[0].blocks.to_sorted(), vec![1, 3]);
        assert_eq!(partial[0].divisions[0].last_block_size, 0);
        assert_eq!(skipped, vec!["b.txt".to_string()]);
    }

    #[test]
    fn test_build_updates_ignores_empty_sets() {
        let files = vec![LocalFile {
            name: "c".into(),
            hash: Some("hc".into()),
            whole: false,
            divisions: vec![set(512, &[], 0, false)],
        }];
        let (full, partial, skipped) = build_updates(&files);
        assert!(full.is_empty() && partial.is_empty() && skipped.is_empty());
    }
}
