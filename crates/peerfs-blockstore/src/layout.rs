//! Directory layout and chunk naming.
//!
//! ```text
//! <root>/files/<name>                                  whole files
//! <root>/blocks/<name>_<division>/<division>_<n>_<k>   chunks; k = last chunk size, 0 otherwise
//! <root>/hashes/<name>                                 remembered hash of a partial download
//! ```

use std::path::{Path, PathBuf};

use crate::{BlockStoreError, Result};

pub const FILES_DIR: &str = "files";
pub const BLOCKS_DIR: &str = "blocks";
pub const HASHES_DIR: &str = "hashes";

/// Parsed chunk file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkName {
    pub division_size: u16,
    pub number: u16,
    /// Size of the chunk when it is the file's last block.
    pub last_size: Option<u16>,
}

impl ChunkName {
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}",
            self.division_size,
            self.number,
            self.last_size.unwrap_or(0)
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '_');
        let division_size = parts.next()?.parse().ok()?;
        let number = parts.next()?.parse().ok()?;
        let last: u16 = parts.next()?.parse().ok()?;
        if number == 0 {
            return None;
        }
        Some(Self {
            division_size,
            number,
            last_size: (last != 0).then_some(last),
        })
    }
}

/// Folder holding every chunk of `name` at `division_size`.
pub fn division_dir(root: &Path, name: &str, division_size: u16) -> PathBuf {
    root.join(BLOCKS_DIR)
        .join(format!("{name}_{division_size}"))
}

/// Split a division folder name back into file name and division size.
/// File names may themselves contain underscores.
pub fn parse_division_dir(s: &str) -> Option<(&str, u16)> {
    let (name, division) = s.rsplit_once('_')?;
    if name.is_empty() {
        return None;
    }
    Some((name, division.parse().ok()?))
}

/// Names travel over the wire and become path components.
pub fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name.len() > peerfs_protocol::MAX_STR8_LEN;
    if bad {
        return Err(BlockStoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_name_roundtrip() {
        let last = ChunkName {
            division_size: 1024,
            number: 7,
            last_size: Some(210),
        };
        assert_eq!(last.file_name(), "1024_7_210");
        assert_eq!(ChunkName::parse("1024_7_210"), Some(last));

        let middle = ChunkName::parse("256_3_0").unwrap();
        assert_eq!(middle.last_size, None);
    }

    #[test]
    fn test_chunk_name_rejects_garbage() {
        assert_eq!(ChunkName::parse("256_0_0"), None);
        assert_eq!(ChunkName::parse("256_3"), None);
        assert_eq!(ChunkName::parse("a_b_c"), None);
        assert_eq!(ChunkName::parse("256_3_0.tmp"), None);
    }

    #[test]
    fn test_division_dir_with_underscored_name() {
        assert_eq!(parse_division_dir("my_file.txt_512"), Some(("my_file.txt", 512)));
        assert_eq!(parse_division_dir("_512"), None);
        assert_eq!(parse_division_dir("nodivision"), None);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("report.pdf").is_ok());
        for bad in ["", ".", "..", "a/b", "../etc"] {
            assert!(validate_name(bad).is_err(), "{bad:?} accepted");
        }
        assert!(validate_name(&"x".repeat(256)).is_err());
    }
}
