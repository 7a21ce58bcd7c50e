//! # dvault-cas
//!
//! Block-level content addressing for dvault.
//!
//! - [`hash`]: the rolling weak hash and the BLAKE3 strong hash
//! - [`policy`]: the file-size → chunk-size step function
//! - [`chunker`]: the sliding-window chunker that drives the sync protocol
//! - [`ObjectStore`]: one payload object per stored block
//!
//! ## Directory Layout
//!
//! ```text
//! <store root>/
//! └── blocks/
//!     └── ab/
//!         └── cd/
//!             └── abcd1234...efgh_0   # strong-hash-hex _ collision slot
//! ```

pub mod chunker;
pub mod hash;
pub mod policy;

pub use chunker::{ChunkMessage, ChunkSink, ChunkStats, Chunker};
pub use hash::{
    content_hash, content_hash_reader, hash_to_hex, hex_to_hash, strong_hash, weak_hash,
    RollingHash, StrongHash, WeakHash,
};
pub use policy::{chunk_size_for, MAX_CHUNK_SIZE};

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::instrument;
use walkdir::WalkDir;

/// Errors that can occur during object store operations
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Block object not found: {name}")]
    NotFound { name: String },

    #[error("Hash mismatch for {name}: expected {expected}, got {actual}")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Name of a payload object: strong hash plus collision slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectName {
    pub strong: StrongHash,
    pub col: u32,
}

impl ObjectName {
    pub fn new(strong: StrongHash, col: u32) -> Self {
        Self { strong, col }
    }

    /// File name used on disk: `<hex>_<col>`.
    pub fn file_name(&self) -> String {
        format!("{}_{}", hash_to_hex(&self.strong), self.col)
    }

    /// Parse a file name produced by [`ObjectName::file_name`].
    pub fn parse(file_name: &str) -> Option<Self> {
        let (hex, col) = file_name.split_once('_')?;
        Some(Self {
            strong: hex_to_hash(hex)?,
            col: col.parse().ok()?,
        })
    }
}

impl std::fmt::Display for ObjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Payload objects for blocks, one file per (strong hash, collision slot).
///
/// Objects are immutable once written; the database decides when they die.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Open (creating if needed) the object directory below `store_root`.
    pub fn new<P: AsRef<Path>>(store_root: P) -> Result<Self> {
        let root = store_root.as_ref().join("blocks");
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Get the path where an object would be stored.
    pub fn object_path(&self, name: &ObjectName) -> PathBuf {
        let hex = hash_to_hex(&name.strong);
        self.root
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(format!("{}_{}", hex, name.col))
    }

    pub fn exists(&self, name: &ObjectName) -> bool {
        self.object_path(name).exists()
    }

    /// Write an object atomically (temp file + rename).
    #[instrument(skip(self, data), level = "debug", fields(name = %name, len = data.len()))]
    pub fn put(&self, name: &ObjectName, data: &[u8]) -> Result<()> {
        let path = self.object_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_file_name(format!(
            "{}.{}.tmp",
            name.file_name(),
            std::process::id()
        ));
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(CasError::Io(e));
        }
        Ok(())
    }

    /// Read an object.
    #[instrument(skip(self), level = "debug", fields(name = %name))]
    pub fn get(&self, name: &ObjectName) -> Result<Vec<u8>> {
        match fs::read(self.object_path(name)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CasError::NotFound {
                name: name.file_name(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Read an object and check it against its strong hash.
    pub fn get_checked(&self, name: &ObjectName, chunk_size: usize) -> Result<Vec<u8>> {
        let data = self.get(name)?;
        let actual = strong_hash(&data, chunk_size);
        if actual != name.strong {
            return Err(CasError::HashMismatch {
                name: name.file_name(),
                expected: hash_to_hex(&name.strong),
                actual: hash_to_hex(&actual),
            });
        }
        Ok(data)
    }

    /// Delete an object.
    pub fn delete(&self, name: &ObjectName) -> Result<()> {
        match fs::remove_file(self.object_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CasError::NotFound {
                name: name.file_name(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All object names currently on disk. Temp files are skipped.
    pub fn names(&self) -> Result<Vec<ObjectName>> {
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = entry.map_err(|e| CasError::Io(io::Error::other(e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str().and_then(ObjectName::parse) {
                names.push(name);
            }
        }
        Ok(names)
    }
}

/// Total size in bytes of every regular file below `path`.
pub fn disk_usage<P: AsRef<Path>>(path: P) -> Result<u64> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(0);
    }
    let mut total = 0u64;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|e| CasError::Io(io::Error::other(e)))?;
        if entry.file_type().is_file() {
            total += entry
                .metadata()
                .map_err(|e| CasError::Io(io::Error::other(e)))?
                .len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn name_for(data: &[u8], chunk_size: usize, col: u32) -> ObjectName {
        ObjectName::new(strong_hash(data, chunk_size), col)
    }

    #[test]
    fn test_put_and_get() {
        let temp = TempDir::new().unwrap();
        let store = ObjectStore::new(temp.path()).unwrap();

        let name = name_for(b"ABCD", 4, 0);
        store.put(&name, b"ABCD").unwrap();
        assert!(store.exists(&name));
        assert_eq!(store.get(&name).unwrap(), b"ABCD");
        assert_eq!(store.get_checked(&name, 4).unwrap(), b"ABCD");
    }

    #[test]
    fn test_collision_slots_are_distinct_files() {
        let temp = TempDir::new().unwrap();
        let store = ObjectStore::new(temp.path()).unwrap();

        let first = name_for(b"AB", 4, 0);
        let second = ObjectName::new(first.strong, 1);
        store.put(&first, b"AB").unwrap();
        store.put(&second, b"AB\0\0").unwrap();

        assert_ne!(store.object_path(&first), store.object_path(&second));
        assert_eq!(store.get(&first).unwrap(), b"AB");
        assert_eq!(store.get(&second).unwrap(), b"AB\0\0");
        assert_eq!(store.names().unwrap().len(), 2);
    }

    #[test]
    fn test_fan_out_layout() {
        let temp = TempDir::new().unwrap();
        let store = ObjectStore::new(temp.path()).unwrap();
        let name = name_for(b"layout", 8, 3);
        store.put(&name, b"layout").unwrap();

        let hex = hash_to_hex(&name.strong);
        let expected = temp
            .path()
            .join("blocks")
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(format!("{}_3", hex));
        assert!(expected.exists());
    }

    #[test]
    fn test_not_found_and_delete() {
        let temp = TempDir::new().unwrap();
        let store = ObjectStore::new(temp.path()).unwrap();
        let name = name_for(b"gone", 4, 0);

        assert!(matches!(store.get(&name), Err(CasError::NotFound { .. })));
        store.put(&name, b"gone").unwrap();
        store.delete(&name).unwrap();
        assert!(!store.exists(&name));
        assert!(matches!(store.delete(&name), Err(CasError::NotFound { .. })));
    }

    #[test]
    fn test_get_checked_detects_corruption() {
        let temp = TempDir::new().unwrap();
        let store = ObjectStore::new(temp.path()).unwrap();
        let name = name_for(b"good", 4, 0);
        store.put(&name, b"evil").unwrap();

        assert!(matches!(
            store.get_checked(&name, 4),
            Err(CasError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_object_name_parse_roundtrip() {
        let name = name_for(b"x", 1, 42);
        assert_eq!(ObjectName::parse(&name.file_name()), Some(name));
        assert_eq!(ObjectName::parse("nounderscore"), None);
        assert_eq!(ObjectName::parse("abcd_1"), None);
    }

    #[test]
    fn test_names_and_disk_usage() {
        let temp = TempDir::new().unwrap();
        let store = ObjectStore::new(temp.path()).unwrap();
        let first = name_for(b"1234", 4, 0);
        let second = name_for(b"56", 4, 0);
        store.put(&first, b"1234").unwrap();
        store.put(&second, b"56").unwrap();

        let mut names = store.names().unwrap();
        names.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(names, expected);
        assert_eq!(disk_usage(temp.path()).unwrap(), 6);
        assert_eq!(disk_usage(temp.path().join("missing")).unwrap(), 0);
    }
}
