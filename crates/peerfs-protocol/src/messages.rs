//! Tracker protocol messages.
//!
//! Every message starts with a one-byte action tag followed by the fields that
//! action declares. Responses end with the 2-byte per-connection request
//! counter so a node can pair them with the request that caused them.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::blocks::BlockSet;
use crate::buf::{checked_u16, checked_u8, put_str16, put_str8, WireReader};
use crate::{FileHash, HostId, ProtocolError, Result, Status};

/// Tracker protocol action tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    UpdateFullFiles = 0,
    UpdatePartial = 1,
    UpdateStatus = 3,
    CheckStatus = 4,
    LocateName = 5,
    LocateHash = 6,
    Leave = 7,
    Response = 8,
    ResponseLocateHash = 9,
    ResponseLocateName = 10,
    ResponseCheckStatus = 11,
}

impl TryFrom<u8> for Action {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Action::UpdateFullFiles,
            1 => Action::UpdatePartial,
            3 => Action::UpdateStatus,
            4 => Action::CheckStatus,
            5 => Action::LocateName,
            6 => Action::LocateHash,
            7 => Action::Leave,
            8 => Action::Response,
            9 => Action::ResponseLocateHash,
            10 => Action::ResponseLocateName,
            11 => Action::ResponseCheckStatus,
            other => return Err(ProtocolError::InvalidAction(other)),
        })
    }
}

// ============================================================================
// Requests
// ============================================================================

/// "I hold every block 1..=block_count at this division size."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullDivision {
    pub division_size: u16,
    pub last_block_size: u16,
    pub block_count: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullFile {
    pub hash: FileHash,
    pub name: String,
    pub divisions: Vec<FullDivision>,
}

/// A subset of blocks at one division size. A zero `last_block_size` means
/// the node does not hold the file's last block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialDivision {
    pub division_size: u16,
    pub last_block_size: u16,
    pub blocks: BlockSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFile {
    pub hash: FileHash,
    pub name: String,
    pub divisions: Vec<PartialDivision>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    UpdateFullFiles(Vec<FullFile>),
    UpdatePartial(Vec<PartialFile>),
    UpdateStatus { status: u8 },
    CheckStatus { host: HostId },
    LocateName { name: String },
    LocateHash { hash: FileHash },
    Leave,
}

impl Request {
    pub fn action(&self) -> Action {
        match self {
            Request::UpdateFullFiles(_) => Action::UpdateFullFiles,
            Request::UpdatePartial(_) => Action::UpdatePartial,
            Request::UpdateStatus { .. } => Action::UpdateStatus,
            Request::CheckStatus { .. } => Action::CheckStatus,
            Request::LocateName { .. } => Action::LocateName,
            Request::LocateHash { .. } => Action::LocateHash,
            Request::Leave => Action::Leave,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.action() as u8);
        match self {
            Request::UpdateFullFiles(files) => {
                dst.put_u16(checked_u16("file count", files.len())?);
                for file in files {
                    put_str16(dst, "file hash", &file.hash)?;
                    put_str8(dst, "file name", &file.name)?;
                    dst.put_u8(checked_u8("division count", file.divisions.len())?);
                    for d in &file.divisions {
                        dst.put_u16(d.division_size);
                        dst.put_u16(d.last_block_size);
                        dst.put_u16(d.block_count);
                    }
                }
            }
            Request::UpdatePartial(files) => {
                dst.put_u16(checked_u16("file count", files.len())?);
                for file in files {
                    put_str16(dst, "file hash", &file.hash)?;
                    put_str8(dst, "file name", &file.name)?;
                    dst.put_u8(checked_u8("division count", file.divisions.len())?);
                    for d in &file.divisions {
                        dst.put_u16(d.division_size);
                        dst.put_u16(d.last_block_size);
                        d.blocks.encode(dst)?;
                    }
                }
            }
            Request::UpdateStatus { status } => dst.put_u8(*status),
            Request::CheckStatus { host } => put_str8(dst, "host identity", host)?,
            Request::LocateName { name } => put_str8(dst, "file name", name)?,
            Request::LocateHash { hash } => put_str16(dst, "file hash", hash)?,
            Request::Leave => {}
        }
        Ok(())
    }

    /// Decode one request starting at its action tag.
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let tag = r.u8()?;
        let request = match Action::try_from(tag)? {
            Action::UpdateFullFiles => {
                let file_count = r.u16()?;
                let mut files = Vec::new();
                for _ in 0..file_count {
                    let hash = r.str16("file hash")?;
                    let name = r.str8("file name")?;
                    let division_count = r.u8()?;
                    let mut divisions = Vec::with_capacity(division_count as usize);
                    for _ in 0..division_count {
                        divisions.push(FullDivision {
                            division_size: r.u16()?,
                            last_block_size: r.u16()?,
                            block_count: r.u16()?,
                        });
                    }
                    files.push(FullFile {
                        hash,
                        name,
                        divisions,
                    });
                }
                Request::UpdateFullFiles(files)
            }
            Action::UpdatePartial => {
                let file_count = r.u16()?;
                let mut files = Vec::new();
                for _ in 0..file_count {
                    let hash = r.str16("file hash")?;
                    let name = r.str8("file name")?;
                    let division_count = r.u8()?;
                    let mut divisions = Vec::with_capacity(division_count as usize);
                    for _ in 0..division_count {
                        divisions.push(PartialDivision {
                            division_size: r.u16()?,
                            last_block_size: r.u16()?,
                            blocks: BlockSet::decode(r)?,
                        });
                    }
                    files.push(PartialFile {
                        hash,
                        name,
                        divisions,
                    });
                }
                Request::UpdatePartial(files)
            }
            Action::UpdateStatus => Request::UpdateStatus { status: r.u8()? },
            Action::CheckStatus => Request::CheckStatus {
                host: r.str8("host identity")?,
            },
            Action::LocateName => Request::LocateName {
                name: r.str8("file name")?,
            },
            Action::LocateHash => Request::LocateHash {
                hash: r.str16("file hash")?,
            },
            Action::Leave => Request::Leave,
            response => {
                return Err(ProtocolError::MalformedMessage(format!(
                    "{response:?} is not a request"
                )))
            }
        };
        Ok(request)
    }

    pub fn to_bytes(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode a buffer holding exactly one request.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let request = Self::decode(&mut r)?;
        r.finish()?;
        Ok(request)
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Holding {
    Full { block_count: u16 },
    Partial { blocks: BlockSet },
}

const HOLDING_FULL: u8 = 0;
const HOLDING_PARTIAL: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivisionHolding {
    pub division_size: u16,
    pub last_block_size: u16,
    pub holding: Holding,
}

impl DivisionHolding {
    /// Block numbers this peer can serve at this division size.
    pub fn block_numbers(&self) -> Vec<u16> {
        match &self.holding {
            Holding::Full { block_count } => (1..=*block_count).collect(),
            Holding::Partial { blocks } => blocks.to_sorted(),
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self.holding, Holding::Full { .. })
    }
}

/// Everything one peer holds of the located file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHolding {
    pub host: HostId,
    pub divisions: Vec<DivisionHolding>,
}

/// One content hash carrying the looked-up name, and the peers holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameMatch {
    pub hash: FileHash,
    pub hosts: Vec<HostId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Status {
        status: Status,
        counter: u16,
    },
    LocateHash {
        status: Status,
        peers: Vec<PeerHolding>,
        counter: u16,
    },
    LocateName {
        status: Status,
        matches: Vec<NameMatch>,
        counter: u16,
    },
    CheckStatus {
        status: Status,
        node_status: u8,
        counter: u16,
    },
}

impl Response {
    pub fn action(&self) -> Action {
        match self {
            Response::Status { .. } => Action::Response,
            Response::LocateHash { .. } => Action::ResponseLocateHash,
            Response::LocateName { .. } => Action::ResponseLocateName,
            Response::CheckStatus { .. } => Action::ResponseCheckStatus,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Response::Status { status, .. }
            | Response::LocateHash { status, .. }
            | Response::LocateName { status, .. }
            | Response::CheckStatus { status, .. } => *status,
        }
    }

    pub fn counter(&self) -> u16 {
        match self {
            Response::Status { counter, .. }
            | Response::LocateHash { counter, .. }
            | Response::LocateName { counter, .. }
            | Response::CheckStatus { counter, .. } => *counter,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.action() as u8);
        dst.put_u8(self.status() as u8);
        match self {
            Response::Status { .. } => {}
            Response::LocateHash { peers, .. } => {
                dst.put_u16(checked_u16("peer count", peers.len())?);
                for peer in peers {
                    put_str8(dst, "host identity", &peer.host)?;
                    dst.put_u8(checked_u8("division count", peer.divisions.len())?);
                    for d in &peer.divisions {
                        dst.put_u16(d.division_size);
                        dst.put_u16(d.last_block_size);
                        match &d.holding {
                            Holding::Full { block_count } => {
                                dst.put_u8(HOLDING_FULL);
                                dst.put_u16(*block_count);
                            }
                            Holding::Partial { blocks } => {
                                dst.put_u8(HOLDING_PARTIAL);
                                blocks.encode(dst)?;
                            }
                        }
                    }
                }
            }
            Response::LocateName { matches, .. } => {
                // Host table first; entries refer to hosts by 1-based handle.
                let mut table: Vec<&str> = Vec::new();
                let mut handles: HashMap<&str, u16> = HashMap::new();
                for m in matches {
                    for host in &m.hosts {
                        if !handles.contains_key(host.as_str()) {
                            table.push(host);
                            let handle = checked_u16("host count", table.len())?;
                            handles.insert(host, handle);
                        }
                    }
                }
                dst.put_u16(checked_u16("host count", table.len())?);
                for host in &table {
                    put_str8(dst, "host identity", host)?;
                }
                dst.put_u16(checked_u16("hash count", matches.len())?);
                for m in matches {
                    put_str16(dst, "file hash", &m.hash)?;
                    dst.put_u16(checked_u16("host reference count", m.hosts.len())?);
                    for host in &m.hosts {
                        dst.put_u16(handles[host.as_str()]);
                    }
                }
            }
            Response::CheckStatus { node_status, .. } => dst.put_u8(*node_status),
        }
        dst.put_u16(self.counter());
        Ok(())
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let tag = r.u8()?;
        let action = Action::try_from(tag)?;
        let status = Status::try_from(r.u8()?)?;
        let response = match action {
            Action::Response => Response::Status {
                status,
                counter: r.u16()?,
            },
            Action::ResponseLocateHash => {
                let peer_count = r.u16()?;
                let mut peers = Vec::new();
                for _ in 0..peer_count {
                    let host = r.str8("host identity")?;
                    let division_count = r.u8()?;
                    let mut divisions = Vec::with_capacity(division_count as usize);
                    for _ in 0..division_count {
                        let division_size = r.u16()?;
                        let last_block_size = r.u16()?;
                        let holding = match r.u8()? {
                            HOLDING_FULL => Holding::Full {
                                block_count: r.u16()?,
                            },
                            HOLDING_PARTIAL => Holding::Partial {
                                blocks: BlockSet::decode(r)?,
                            },
                            other => {
                                return Err(ProtocolError::MalformedMessage(format!(
                                    "unknown holding kind {other}"
                                )))
                            }
                        };
                        divisions.push(DivisionHolding {
                            division_size,
                            last_block_size,
                            holding,
                        });
                    }
                    peers.push(PeerHolding { host, divisions });
                }
                Response::LocateHash {
                    status,
                    peers,
                    counter: r.u16()?,
                }
            }
            Action::ResponseLocateName => {
                let host_count = r.u16()?;
                let mut table = Vec::new();
                for _ in 0..host_count {
                    table.push(r.str8("host identity")?);
                }
                let hash_count = r.u16()?;
                let mut matches = Vec::new();
                for _ in 0..hash_count {
                    let hash = r.str16("file hash")?;
                    let ref_count = r.u16()?;
                    let mut hosts = Vec::new();
                    for _ in 0..ref_count {
                        let handle = r.u16()? as usize;
                        let host = handle
                            .checked_sub(1)
                            .and_then(|i| table.get(i))
                            .ok_or_else(|| {
                                ProtocolError::MalformedMessage(format!(
                                    "host handle {handle} outside table of {}",
                                    table.len()
                                ))
                            })?;
                        hosts.push(host.clone());
                    }
                    matches.push(NameMatch { hash, hosts });
                }
                Response::LocateName {
                    status,
                    matches,
                    counter: r.u16()?,
                }
            }
            Action::ResponseCheckStatus => Response::CheckStatus {
                status,
                node_status: r.u8()?,
                counter: r.u16()?,
            },
            request => {
                return Err(ProtocolError::MalformedMessage(format!(
                    "{request:?} is not a response"
                )))
            }
        };
        Ok(response)
    }

    pub fn to_bytes(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let response = Self::decode(&mut r)?;
        r.finish()?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_full_update() -> Request {
        Request::UpdateFullFiles(vec![FullFile {
            hash: "ab".repeat(32),
            name: "report.pdf".into(),
            divisions: vec![
                FullDivision {
                    division_size: 256,
                    last_block_size: 120,
                    block_count: 5,
                },
                FullDivision {
                    division_size: 1024,
                    last_block_size: 120,
                    block_count: 2,
                },
            ],
        }])
    }

    #[test]
    fn test_full_update_roundtrip() {
        let req = sample_full_update();
        let bytes = req.to_bytes().unwrap();
        assert_eq!(bytes[0], Action::UpdateFullFiles as u8);
        assert_eq!(Request::from_bytes(&bytes).unwrap(), req);
    }

    #[test]
    fn test_full_update_layout() {
        let req = Request::UpdateFullFiles(vec![FullFile {
            hash: "h".into(),
            name: "f".into(),
            divisions: vec![FullDivision {
                division_size: 256,
                last_block_size: 10,
                block_count: 5,
            }],
        }]);
        let bytes = req.to_bytes().unwrap();
        assert_eq!(
            &bytes[..],
            &[
                0, // tag
                0, 1, // file count
                0, 1, b'h', // hash str16
                1, b'f', // name str8
                1, // division count
                1, 0, // division 256
                0, 10, // last block size
                0, 5, // block count
            ]
        );
    }

    #[test]
    fn test_partial_update_roundtrip() {
        let req = Request::UpdatePartial(vec![
            PartialFile {
                hash: "cd".repeat(32),
                name: "belo.png".into(),
                divisions: vec![
                    PartialDivision {
                        division_size: 1024,
                        last_block_size: 210,
                        blocks: BlockSet::from_numbers([3, 4, 5, 6, 9, 10, 11, 12, 13]),
                    },
                    PartialDivision {
                        division_size: 2048,
                        last_block_size: 0,
                        blocks: BlockSet::from_numbers([1, 2, 3, 4, 5, 6, 7, 8, 9, 14, 20]),
                    },
                ],
            },
            PartialFile {
                hash: "ef".repeat(32),
                name: "panik.png".into(),
                divisions: vec![PartialDivision {
                    division_size: 512,
                    last_block_size: 21,
                    blocks: BlockSet::from_numbers([5, 6, 11, 12, 13, 14]),
                }],
            },
        ]);
        let bytes = req.to_bytes().unwrap();
        assert_eq!(Request::from_bytes(&bytes).unwrap(), req);
    }

    #[test]
    fn test_small_requests_roundtrip() {
        for req in [
            Request::UpdateStatus { status: 7 },
            Request::CheckStatus {
                host: "node2.lan".into(),
            },
            Request::LocateName {
                name: "java.png".into(),
            },
            Request::LocateHash {
                hash: "00".repeat(32),
            },
            Request::Leave,
        ] {
            let bytes = req.to_bytes().unwrap();
            assert_eq!(Request::from_bytes(&bytes).unwrap(), req);
        }
    }

    #[test]
    fn test_every_truncation_is_malformed() {
        let bytes = sample_full_update().to_bytes().unwrap();
        for cut in 0..bytes.len() {
            let err = Request::from_bytes(&bytes[..cut]).unwrap_err();
            assert!(err.is_malformed(), "cut at {cut}: {err}");
        }
    }

    #[test]
    fn test_unknown_tag_is_invalid_action() {
        assert!(matches!(
            Request::from_bytes(&[2]),
            Err(ProtocolError::InvalidAction(2))
        ));
        assert!(matches!(
            Request::from_bytes(&[0xee]),
            Err(ProtocolError::InvalidAction(0xee))
        ));
    }

    #[test]
    fn test_response_tag_is_not_a_request() {
        let bytes = Response::Status {
            status: Status::Success,
            counter: 1,
        }
        .to_bytes()
        .unwrap();
        assert!(Request::from_bytes(&bytes).unwrap_err().is_malformed());
    }

    #[test]
    fn test_status_response_layout() {
        let resp = Response::Status {
            status: Status::NotFound,
            counter: 0x0102,
        };
        let bytes = resp.to_bytes().unwrap();
        assert_eq!(&bytes[..], &[8, 3, 1, 2]);
        assert_eq!(Response::from_bytes(&bytes).unwrap(), resp);
    }

    #[test]
    fn test_locate_hash_response_roundtrip() {
        let resp = Response::LocateHash {
            status: Status::Success,
            peers: vec![
                PeerHolding {
                    host: "10.0.0.1".into(),
                    divisions: vec![DivisionHolding {
                        division_size: 256,
                        last_block_size: 77,
                        holding: Holding::Full { block_count: 5 },
                    }],
                },
                PeerHolding {
                    host: "10.0.0.2".into(),
                    divisions: vec![DivisionHolding {
                        division_size: 512,
                        last_block_size: 0,
                        holding: Holding::Partial {
                            blocks: BlockSet::from_numbers([1, 2, 3, 4, 5, 9]),
                        },
                    }],
                },
            ],
            counter: 3,
        };
        let bytes = resp.to_bytes().unwrap();
        assert_eq!(Response::from_bytes(&bytes).unwrap(), resp);
    }

    #[test]
    fn test_locate_name_dedups_hosts() {
        let resp = Response::LocateName {
            status: Status::Success,
            matches: vec![
                NameMatch {
                    hash: "aa".into(),
                    hosts: vec!["node1".into(), "node2".into()],
                },
                NameMatch {
                    hash: "bb".into(),
                    hosts: vec!["node2".into()],
                },
            ],
            counter: 9,
        };
        let bytes = resp.to_bytes().unwrap();
        // "node2" is written once in the host table
        let text = String::from_utf8_lossy(&bytes);
        assert_eq!(text.matches("node2").count(), 1);
        assert_eq!(Response::from_bytes(&bytes).unwrap(), resp);
    }

    #[test]
    fn test_locate_name_bad_handle() {
        // tag, status, 1 host "a", 1 hash "h" with 1 ref to handle 2, counter
        let bytes = [10u8, 0, 0, 1, 1, b'a', 0, 1, 0, 1, b'h', 0, 1, 0, 2, 0, 0];
        assert!(Response::from_bytes(&bytes).unwrap_err().is_malformed());
        // handle 0 is never valid
        let bytes = [10u8, 0, 0, 1, 1, b'a', 0, 1, 0, 1, b'h', 0, 1, 0, 0, 0, 0];
        assert!(Response::from_bytes(&bytes).unwrap_err().is_malformed());
    }

    #[test]
    fn test_check_status_roundtrip() {
        let resp = Response::CheckStatus {
            status: Status::Success,
            node_status: 42,
            counter: 65535,
        };
        let bytes = resp.to_bytes().unwrap();
        assert_eq!(Response::from_bytes(&bytes).unwrap(), resp);
    }
}
