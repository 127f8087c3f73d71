//! peerfs Inventory -- the tracker's registry of which node holds which blocks.
//!
//! rusqlite over a single connection behind a mutex. Every update runs in one
//! transaction: a failed write rolls back entirely, so no partial inventory
//! update is ever visible.

use std::path::Path;
use std::sync::Mutex;

use peerfs_protocol::{FullFile, PartialFile};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock poisoned")]
    LockPoisoned,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, InventoryError>;

/// One block held by one peer, as returned by `locate_by_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatedBlock {
    pub host: String,
    pub size: u16,
    pub number: u16,
    pub division_size: u16,
    pub is_last: bool,
}

/// A (hash, host) pair returned by `locate_by_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameHit {
    pub hash: String,
    pub host: String,
}

/// Inventory operations used by the tracker session handler.
pub trait Inventory: Send + Sync {
    /// Record complete division sets held by `host`.
    fn update_full(&self, host: &str, files: &[FullFile]) -> Result<()>;
    /// Record arbitrary block subsets held by `host`.
    fn update_partial(&self, host: &str, files: &[PartialFile]) -> Result<()>;
    fn update_status(&self, host: &str, status: u8) -> Result<()>;
    /// `None` for an unknown host.
    fn get_status(&self, host: &str) -> Result<Option<u8>>;
    /// Rows ordered by host, division size descending, block number ascending.
    fn locate_by_hash(&self, hash: &str, excluding_host: &str) -> Result<Vec<LocatedBlock>>;
    /// Distinct (hash, host) pairs ordered by hash, then host.
    fn locate_by_name(&self, name: &str, excluding_host: &str) -> Result<Vec<NameHit>>;
    /// Remove the host and everything only it held. Returns whether it existed.
    fn delete_node(&self, host: &str) -> Result<bool>;
}

/// SQLite-backed inventory.
/// Connection wrapped in Mutex for Send + Sync (rusqlite Connection is !Sync).
pub struct SqliteInventory {
    conn: Mutex<Connection>,
}

const DROP_TABLES: &str = "DROP TABLE IF EXISTS node_block;
     DROP TABLE IF EXISTS block;
     DROP TABLE IF EXISTS file;
     DROP TABLE IF EXISTS node;";

impl SqliteInventory {
    fn db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| InventoryError::LockPoisoned)
    }

    /// Open (or create) the database at `db_path`. With `reset`, every table
    /// is dropped and rebuilt, discarding registrations from earlier runs.
    pub fn open(db_path: &Path, reset: bool) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        Self::init(conn, reset)
    }

    /// Fresh in-memory inventory.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init(conn, false)
    }

    fn init(conn: Connection, reset: bool) -> Result<Self> {
        if reset {
            conn.execute_batch(DROP_TABLES)?;
            tracing::info!("inventory: dropped previous registrations");
        }
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn ensure_node(tx: &Transaction<'_>, host: &str) -> Result<()> {
        tx.execute(
            "INSERT INTO node (host) VALUES (?1) ON CONFLICT(host) DO NOTHING",
            params![host],
        )?;
        Ok(())
    }

    fn insert_file(tx: &Transaction<'_>, hash: &str, name: &str) -> Result<()> {
        if hash.is_empty() || name.is_empty() {
            return Err(InventoryError::InvalidRequest(
                "empty file hash or name".into(),
            ));
        }
        tx.execute(
            "INSERT INTO file (hash, name) VALUES (?1, ?2) ON CONFLICT(hash) DO NOTHING",
            params![hash, name],
        )?;
        Ok(())
    }

    fn insert_block(
        tx: &Transaction<'_>,
        host: &str,
        hash: &str,
        division_size: u16,
        number: u16,
        size: u16,
        is_last: bool,
    ) -> Result<()> {
        tx.execute(
            "INSERT INTO block (file_hash, division_size, number, size, is_last)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(file_hash, division_size, number) DO NOTHING",
            params![hash, division_size, number, size, is_last],
        )?;
        tx.execute(
            "INSERT INTO node_block (host, file_hash, division_size, number)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT DO NOTHING",
            params![host, hash, division_size, number],
        )?;
        Ok(())
    }
}

fn check_division(division_size: u16, last_block_size: u16) -> Result<()> {
    if division_size == 0 {
        return Err(InventoryError::InvalidRequest("division size 0".into()));
    }
    if last_block_size > division_size {
        return Err(InventoryError::InvalidRequest(format!(
            "last block of {last_block_size} bytes exceeds division size {division_size}"
        )));
    }
    Ok(())
}

impl Inventory for SqliteInventory {
    fn update_full(&self, host: &str, files: &[FullFile]) -> Result<()> {
        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        Self::ensure_node(&tx, host)?;

        for file in files {
            Self::insert_file(&tx, &file.hash, &file.name)?;
            for d in &file.divisions {
                check_division(d.division_size, d.last_block_size)?;
                if d.block_count == 0 || d.last_block_size == 0 {
                    return Err(InventoryError::InvalidRequest(format!(
                        "full claim on {} @ {} without a last block",
                        file.name, d.division_size
                    )));
                }
                for number in 1..=d.block_count {
                    let is_last = number == d.block_count;
                    let size = if is_last {
                        d.last_block_size
                    } else {
                        d.division_size
                    };
                    Self::insert_block(&tx, host, &file.hash, d.division_size, number, size, is_last)?;
                }
            }
        }

        tx.commit()?;
        tracing::debug!(host, files = files.len(), "inventory: full update");
        Ok(())
    }

    fn update_partial(&self, host: &str, files: &[PartialFile]) -> Result<()> {
        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        Self::ensure_node(&tx, host)?;

        for file in files {
            Self::insert_file(&tx, &file.hash, &file.name)?;
            for d in &file.divisions {
                check_division(d.division_size, d.last_block_size)?;
                let numbers = d.blocks.to_sorted();
                // A non-zero last size marks the highest listed block as the last one.
                let last = (d.last_block_size != 0)
                    .then(|| numbers.last().copied())
                    .flatten();
                for &number in &numbers {
                    let is_last = Some(number) == last;
                    let size = if is_last {
                        d.last_block_size
                    } else {
                        d.division_size
                    };
                    Self::insert_block(&tx, host, &file.hash, d.division_size, number, size, is_last)?;
                }
            }
        }

        tx.commit()?;
        tracing::debug!(host, files = files.len(), "inventory: partial update");
        Ok(())
    }

    fn update_status(&self, host: &str, status: u8) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO node (host, status) VALUES (?1, ?2)
             ON CONFLICT(host) DO UPDATE SET status = excluded.status",
            params![host, status],
        )?;
        Ok(())
    }

    fn get_status(&self, host: &str) -> Result<Option<u8>> {
        let conn = self.db()?;
        let status = conn
            .query_row(
                "SELECT status FROM node WHERE host = ?1",
                params![host],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status)
    }

    fn locate_by_hash(&self, hash: &str, excluding_host: &str) -> Result<Vec<LocatedBlock>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT nb.host, b.size, b.number, b.division_size, b.is_last
             FROM node_block nb
             JOIN block b ON b.file_hash = nb.file_hash
                         AND b.division_size = nb.division_size
                         AND b.number = nb.number
             WHERE nb.file_hash = ?1 AND nb.host != ?2
             ORDER BY nb.host, b.division_size DESC, b.number ASC",
        )?;
        let rows = stmt
            .query_map(params![hash, excluding_host], |row| {
                Ok(LocatedBlock {
                    host: row.get(0)?,
                    size: row.get(1)?,
                    number: row.get(2)?,
                    division_size: row.get(3)?,
                    is_last: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn locate_by_name(&self, name: &str, excluding_host: &str) -> Result<Vec<NameHit>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT f.hash, nb.host
             FROM file f
             JOIN node_block nb ON nb.file_hash = f.hash
             WHERE f.name = ?1 AND nb.host != ?2
             ORDER BY f.hash, nb.host",
        )?;
        let hits = stmt
            .query_map(params![name, excluding_host], |row| {
                Ok(NameHit {
                    hash: row.get(0)?,
                    host: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(hits)
    }

    fn delete_node(&self, host: &str) -> Result<bool> {
        let mut conn = self.db()?;
        let tx = conn.transaction()?;

        // node_block rows go with the node (ON DELETE CASCADE)
        let existed = tx.execute("DELETE FROM node WHERE host = ?1", params![host])? > 0;

        let orphan_blocks = tx.execute(
            "DELETE FROM block WHERE NOT EXISTS (
                 SELECT 1 FROM node_block nb
                 WHERE nb.file_hash = block.file_hash
                   AND nb.division_size = block.division_size
                   AND nb.number = block.number)",
            [],
        )?;
        let orphan_files = tx.execute(
            "DELETE FROM file WHERE NOT EXISTS (
                 SELECT 1 FROM block WHERE block.file_hash = file.hash)",
            [],
        )?;

        tx.commit()?;
        tracing::debug!(host, existed, orphan_blocks, orphan_files, "inventory: node deleted");
        Ok(existed)
    }
}
