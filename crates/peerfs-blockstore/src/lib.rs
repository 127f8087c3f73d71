//! peerfs Block Store -- chunked file storage on the local disk.
//!
//! Every file can be split at several division sizes; each split is a
//! division set of numbered chunks. The transfer engine writes received
//! chunks here and reads chunks it serves from here, the node controller
//! scans it to report holdings and joins complete sets back into files.
//!
//! Writes are serialised by one lock and are idempotent: saving a chunk that
//! already exists is a no-op, which makes retransmitted datagrams harmless.

pub mod layout;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use peerfs_protocol::FileHash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::layout::{ChunkName, BLOCKS_DIR, FILES_DIR, HASHES_DIR};

#[derive(Debug, thiserror::Error)]
pub enum BlockStoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("destination already exists: {0}")]
    DestinationExists(PathBuf),
    #[error("no blocks of {file} at division size {division_size}")]
    NoBlocks { file: String, division_size: u16 },
    #[error("{file} at division size {division_size} is missing blocks {missing:?}")]
    Incomplete {
        file: String,
        division_size: u16,
        missing: Vec<u16>,
    },
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("invalid block layout: {0}")]
    InvalidLayout(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, BlockStoreError>;

/// A file referred to by content hash or by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRef<'a> {
    Hash(&'a str),
    Name(&'a str),
}

/// One division set found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivisionSet {
    pub division_size: u16,
    /// Size of the last block, 0 when the last block is not held.
    pub last_block_size: u16,
    /// Sorted block numbers held.
    pub numbers: Vec<u16>,
    /// Every block 1..=N held and block N is the last one.
    pub complete: bool,
}

impl DivisionSet {
    fn from_chunks(division_size: u16, chunks: &[ChunkName]) -> Self {
        let mut numbers: Vec<u16> = chunks.iter().map(|c| c.number).collect();
        numbers.sort_unstable();
        numbers.dedup();

        let last = chunks.iter().find_map(|c| c.last_size.map(|s| (c.number, s)));
        let last_block_size = last.map(|(_, s)| s).unwrap_or(0);
        let complete = match last {
            Some((n, _)) => numbers.len() == n as usize && numbers.last() == Some(&n),
            None => false,
        };
        Self {
            division_size,
            last_block_size,
            numbers,
            complete,
        }
    }

    pub fn block_count(&self) -> Option<u16> {
        self.complete.then(|| self.numbers.len() as u16)
    }
}

/// A file the node holds wholly or partially.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFile {
    pub name: String,
    /// Unknown for block-only holdings that were never remembered.
    pub hash: Option<FileHash>,
    /// Whether `<root>/files/<name>` exists.
    pub whole: bool,
    pub divisions: Vec<DivisionSet>,
}

/// Block storage used by the transfer engine and the node controller.
pub trait BlockStore: Send + Sync {
    /// Store one block. Returns false when it was already present.
    fn save_block(
        &self,
        file_name: &str,
        division_size: u16,
        block_number: u16,
        is_last: bool,
        data: &[u8],
    ) -> Result<bool>;

    fn get_block(&self, file: FileRef<'_>, division_size: u16, block_number: u16)
        -> Result<Vec<u8>>;

    /// Sorted block numbers held at `division_size`, empty when none.
    fn get_all_block_numbers(&self, file: FileRef<'_>, division_size: u16) -> Result<Vec<u16>>;

    /// Number of blocks of a complete division set. A whole local file is
    /// divided on demand; otherwise `NotFound`.
    fn get_block_count(&self, file: FileRef<'_>, division_size: u16) -> Result<u16>;

    /// Reassemble `<root>/files/<file_name>` from a complete division set and
    /// return the recomputed hash. Never leaves a partial destination file.
    fn join_blocks(&self, file_name: &str, division_size: u16) -> Result<FileHash>;

    /// Split a whole local file at `division_size`. Returns the block count.
    fn divide_file(&self, file_name: &str, division_size: u16) -> Result<u16>;

    /// Divide every whole local file at `division_size`.
    fn divide_all(&self, division_size: u16) -> Result<Vec<(String, u16)>>;

    /// Every file held, whole or as blocks.
    fn scan(&self) -> Result<Vec<LocalFile>>;

    /// Record the hash of a file being downloaded so partial holdings can be reported.
    fn remember_hash(&self, file_name: &str, hash: &str) -> Result<()>;

    /// Resolve a content hash to the local file name.
    fn file_name_for_hash(&self, hash: &str) -> Result<String>;
}

/// SHA-256 over the name bytes followed by the content, hex encoded.
pub fn hash_file_contents<R: Read>(name: &str, mut content: R) -> io::Result<FileHash> {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = content.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Filesystem-backed block store rooted at one node directory.
pub struct FsBlockStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    /// hash -> name, rebuilt from disk on a miss.
    hash_index: Mutex<HashMap<FileHash, String>>,
    /// (name, division size) -> chunks on disk. Listed on first lookup, kept
    /// current by saves and reloaded by `scan`.
    chunk_index: Mutex<HashMap<(String, u16), BTreeMap<u16, ChunkName>>>,
}

impl FsBlockStore {
    /// Open (or create) the store under `root`.
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [FILES_DIR, BLOCKS_DIR, HASHES_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            write_lock: Mutex::new(()),
            hash_index: Mutex::new(HashMap::new()),
            chunk_index: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.root.join(FILES_DIR).join(name)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| BlockStoreError::LockPoisoned)
    }

    fn index(&self) -> Result<MutexGuard<'_, HashMap<FileHash, String>>> {
        self.hash_index
            .lock()
            .map_err(|_| BlockStoreError::LockPoisoned)
    }

    fn chunk_index(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<(String, u16), BTreeMap<u16, ChunkName>>>> {
        self.chunk_index
            .lock()
            .map_err(|_| BlockStoreError::LockPoisoned)
    }

    /// Hash of a whole local file.
    pub fn file_hash(&self, name: &str) -> Result<FileHash> {
        layout::validate_name(name)?;
        let file = fs::File::open(self.file_path(name)).map_err(|e| not_found(e, name))?;
        let hash = hash_file_contents(name, io::BufReader::new(file))?;
        self.index()?.insert(hash.clone(), name.to_string());
        Ok(hash)
    }

    fn remembered_hash(&self, name: &str) -> Result<Option<FileHash>> {
        match fs::read_to_string(self.root.join(HASHES_DIR).join(name)) {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn resolve(&self, file: FileRef<'_>) -> Result<String> {
        match file {
            FileRef::Name(name) => {
                layout::validate_name(name)?;
                Ok(name.to_string())
            }
            FileRef::Hash(hash) => self.file_name_for_hash(hash),
        }
    }

    /// Chunks of one division set, unsorted.
    fn chunks(&self, name: &str, division_size: u16) -> Result<Vec<ChunkName>> {
        let dir = layout::division_dir(&self.root, name, division_size);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut chunks = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            match file_name.to_str().and_then(ChunkName::parse) {
                Some(c) if c.division_size == division_size => chunks.push(c),
                _ => tracing::trace!(path = %entry.path().display(), "blockstore: skipping stray file"),
            }
        }
        Ok(chunks)
    }

    /// Look up one chunk. The division directory is listed only on the first
    /// lookup of a division set.
    fn find_chunk(&self, name: &str, division_size: u16, number: u16) -> Result<Option<ChunkName>> {
        let key = (name.to_string(), division_size);
        let mut index = self.chunk_index()?;
        if !index.contains_key(&key) {
            let listed = self.chunks(name, division_size)?;
            index.insert(key.clone(), listed.into_iter().map(|c| (c.number, c)).collect());
        }
        Ok(index.get(&key).and_then(|chunks| chunks.get(&number)).copied())
    }

    fn forget_division(&self, name: &str, division_size: u16) -> Result<()> {
        self.chunk_index()?.remove(&(name.to_string(), division_size));
        Ok(())
    }

    /// Write `data` to `path` through a temp file so readers never see a partial chunk.
    fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BlockStoreError::InvalidName(path.display().to_string()))?;
        let tmp = path.with_file_name(format!(".{file_name}.tmp"));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Caller holds the write lock.
    fn save_locked(&self, name: &str, chunk: ChunkName, data: &[u8]) -> Result<bool> {
        if self.find_chunk(name, chunk.division_size, chunk.number)?.is_some() {
            return Ok(false);
        }
        let dir = layout::division_dir(&self.root, name, chunk.division_size);
        fs::create_dir_all(&dir)?;
        Self::write_atomic(&dir.join(chunk.file_name()), data)?;
        self.chunk_index()?
            .entry((name.to_string(), chunk.division_size))
            .or_default()
            .insert(chunk.number, chunk);
        Ok(true)
    }

    fn division_sets(&self, name: &str) -> Result<Vec<DivisionSet>> {
        let mut by_division: BTreeMap<u16, Vec<ChunkName>> = BTreeMap::new();
        for entry in fs::read_dir(self.root.join(BLOCKS_DIR))? {
            let entry = entry?;
            let dir_name = entry.file_name();
            let Some((file, division)) = dir_name.to_str().and_then(layout::parse_division_dir)
            else {
                continue;
            };
            if file == name {
                by_division.insert(division, self.chunks(name, division)?);
            }
        }
        {
            let mut index = self.chunk_index()?;
            index.retain(|(file, _), _| file != name);
            for (division, chunks) in &by_division {
                index.insert(
                    (name.to_string(), *division),
                    chunks.iter().map(|c| (c.number, *c)).collect(),
                );
            }
        }
        Ok(by_division
            .into_iter()
            .filter(|(_, chunks)| !chunks.is_empty())
            .map(|(division, chunks)| DivisionSet::from_chunks(division, &chunks))
            .collect())
    }

    fn rebuild_index(&self) -> Result<()> {
        let mut found = Vec::new();
        for entry in fs::read_dir(self.root.join(FILES_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                let file = fs::File::open(entry.path())?;
                found.push((hash_file_contents(name, io::BufReader::new(file))?, name.to_string()));
            }
        }
        for entry in fs::read_dir(self.root.join(HASHES_DIR))? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(hash) = self.remembered_hash(name)? {
                    found.push((hash, name.to_string()));
                }
            }
        }
        let mut index = self.index()?;
        index.clear();
        index.extend(found);
        Ok(())
    }
}

fn not_found(e: io::Error, what: &str) -> BlockStoreError {
    if e.kind() == io::ErrorKind::NotFound {
        BlockStoreError::NotFound(what.to_string())
    } else {
        BlockStoreError::Io(e)
    }
}

impl BlockStore for FsBlockStore {
    fn save_block(
        &self,
        file_name: &str,
        division_size: u16,
        block_number: u16,
        is_last: bool,
        data: &[u8],
    ) -> Result<bool> {
        layout::validate_name(file_name)?;
        if block_number == 0 || division_size == 0 || data.len() > division_size as usize {
            return Err(BlockStoreError::InvalidLayout(format!(
                "block {block_number} of {} bytes at division size {division_size}",
                data.len()
            )));
        }
        if is_last && data.is_empty() {
            return Err(BlockStoreError::InvalidLayout(format!(
                "empty last block {block_number}"
            )));
        }

        let chunk = ChunkName {
            division_size,
            number: block_number,
            last_size: is_last.then_some(data.len() as u16),
        };
        let _guard = self.lock()?;
        let stored = self.save_locked(file_name, chunk, data)?;
        if stored {
            tracing::trace!(file = file_name, division_size, block = block_number, "blockstore: saved block");
        }
        Ok(stored)
    }

    fn get_block(
        &self,
        file: FileRef<'_>,
        division_size: u16,
        block_number: u16,
    ) -> Result<Vec<u8>> {
        let name = self.resolve(file)?;
        let chunk = self
            .find_chunk(&name, division_size, block_number)?
            .ok_or_else(|| {
                BlockStoreError::NotFound(format!("{name} block {block_number} @ {division_size}"))
            })?;
        let path = layout::division_dir(&self.root, &name, division_size).join(chunk.file_name());
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) => {
                // Removed behind our back; list the directory again next time
                self.forget_division(&name, division_size)?;
                Err(not_found(e, &path.display().to_string()))
            }
        }
    }

    fn get_all_block_numbers(&self, file: FileRef<'_>, division_size: u16) -> Result<Vec<u16>> {
        let name = self.resolve(file)?;
        let mut numbers: Vec<u16> = self
            .chunks(&name, division_size)?
            .into_iter()
            .map(|c| c.number)
            .collect();
        numbers.sort_unstable();
        numbers.dedup();
        Ok(numbers)
    }

    fn get_block_count(&self, file: FileRef<'_>, division_size: u16) -> Result<u16> {
        let name = self.resolve(file)?;
        let chunks = self.chunks(&name, division_size)?;
        if let Some(count) = DivisionSet::from_chunks(division_size, &chunks).block_count() {
            return Ok(count);
        }
        if self.file_path(&name).is_file() {
            return self.divide_file(&name, division_size);
        }
        Err(BlockStoreError::NotFound(format!(
            "{name} has no complete division set at {division_size}"
        )))
    }

    fn join_blocks(&self, file_name: &str, division_size: u16) -> Result<FileHash> {
        layout::validate_name(file_name)?;
        let dest = self.file_path(file_name);
        let _guard = self.lock()?;

        if dest.exists() {
            return Err(BlockStoreError::DestinationExists(dest));
        }
        let chunks = self.chunks(file_name, division_size)?;
        if chunks.is_empty() {
            return Err(BlockStoreError::NoBlocks {
                file: file_name.to_string(),
                division_size,
            });
        }
        let set = DivisionSet::from_chunks(division_size, &chunks);
        if !set.complete {
            let highest = chunks
                .iter()
                .find_map(|c| c.last_size.map(|_| c.number))
                .or_else(|| set.numbers.last().copied())
                .unwrap_or(0);
            let missing: Vec<u16> = (1..=highest)
                .filter(|n| set.numbers.binary_search(n).is_err())
                .collect();
            return Err(BlockStoreError::Incomplete {
                file: file_name.to_string(),
                division_size,
                missing,
            });
        }

        let dir = layout::division_dir(&self.root, file_name, division_size);
        let tmp = dir.join(format!(".join-{file_name}.tmp"));
        let written = (|| -> Result<()> {
            let mut out = io::BufWriter::new(fs::File::create(&tmp)?);
            let mut ordered = chunks.clone();
            ordered.sort_by_key(|c| c.number);
            for chunk in &ordered {
                out.write_all(&fs::read(dir.join(chunk.file_name()))?)?;
            }
            out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            Ok(())
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, &dest)?;

        let hash = hash_file_contents(file_name, io::BufReader::new(fs::File::open(&dest)?))?;
        if let Some(expected) = self.remembered_hash(file_name)? {
            if expected != hash {
                tracing::warn!(file = file_name, %expected, actual = %hash, "blockstore: joined file hash differs from the located hash");
            }
        }
        self.index()?.insert(hash.clone(), file_name.to_string());
        tracing::info!(file = file_name, division_size, blocks = set.numbers.len(), "blockstore: joined blocks");
        Ok(hash)
    }

    fn divide_file(&self, file_name: &str, division_size: u16) -> Result<u16> {
        layout::validate_name(file_name)?;
        if division_size == 0 {
            return Err(BlockStoreError::InvalidLayout("division size 0".into()));
        }
        let mut file = fs::File::open(self.file_path(file_name)).map_err(|e| not_found(e, file_name))?;
        let len = file.metadata()?.len();
        let count = len.div_ceil(division_size as u64);
        let count = u16::try_from(count).map_err(|_| {
            BlockStoreError::InvalidLayout(format!(
                "{file_name} needs {count} blocks at division size {division_size}"
            ))
        })?;

        let _guard = self.lock()?;
        let mut buf = vec![0u8; division_size as usize];
        for number in 1..=count {
            let size = if number == count {
                (len - (count as u64 - 1) * division_size as u64) as usize
            } else {
                division_size as usize
            };
            file.read_exact(&mut buf[..size])?;
            let chunk = ChunkName {
                division_size,
                number,
                last_size: (number == count).then_some(size as u16),
            };
            self.save_locked(file_name, chunk, &buf[..size])?;
        }
        tracing::debug!(file = file_name, division_size, blocks = count, "blockstore: divided file");
        Ok(count)
    }

    fn divide_all(&self, division_size: u16) -> Result<Vec<(String, u16)>> {
        let mut divided = Vec::new();
        for entry in fs::read_dir(self.root.join(FILES_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if layout::validate_name(&name).is_err() {
                tracing::warn!(file = %name, "blockstore: skipping file with unusable name");
                continue;
            }
            let count = self.divide_file(&name, division_size)?;
            divided.push((name, count));
        }
        divided.sort();
        Ok(divided)
    }

    fn scan(&self) -> Result<Vec<LocalFile>> {
        let mut names: BTreeMap<String, bool> = BTreeMap::new();
        for entry in fs::read_dir(self.root.join(FILES_DIR))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.insert(name.to_string(), true);
                }
            }
        }
        for entry in fs::read_dir(self.root.join(BLOCKS_DIR))? {
            let entry = entry?;
            let dir_name = entry.file_name();
            if let Some((name, _)) = dir_name.to_str().and_then(layout::parse_division_dir) {
                names.entry(name.to_string()).or_insert(false);
            }
        }

        let mut files = Vec::new();
        for (name, whole) in names {
            if layout::validate_name(&name).is_err() {
                continue;
            }
            let hash = if whole {
                Some(self.file_hash(&name)?)
            } else {
                self.remembered_hash(&name)?
            };
            files.push(LocalFile {
                divisions: self.division_sets(&name)?,
                name,
                hash,
                whole,
            });
        }
        Ok(files)
    }

    fn remember_hash(&self, file_name: &str, hash: &str) -> Result<()> {
        layout::validate_name(file_name)?;
        Self::write_atomic(&self.root.join(HASHES_DIR).join(file_name), hash.as_bytes())?;
        self.index()?.insert(hash.to_string(), file_name.to_string());
        Ok(())
    }

    fn file_name_for_hash(&self, hash: &str) -> Result<String> {
        if let Some(name) = self.index()?.get(hash) {
            return Ok(name.clone());
        }
        self.rebuild_index()?;
        self.index()?
            .get(hash)
            .cloned()
            .ok_or_else(|| BlockStoreError::NotFound(format!("hash {hash}")))
    }
}
