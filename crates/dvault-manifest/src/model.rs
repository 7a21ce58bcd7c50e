//! Filesystem tree, versions and blocks.

use std::collections::{BTreeMap, HashMap};

use dvault_cas::{ObjectName, StrongHash, WeakHash};
use serde::{Deserialize, Serialize};

/// Arena handle of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Handle of a block record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u64);

/// Handle of an edit script in the script table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScriptId(pub u64);

/// Store-wide stable identity of a version; indices shift on deletion, ids do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionId(pub u64);

/// A stored, reference-counted chunk of file bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub weak: WeakHash,
    pub strong: StrongHash,
    /// On-disk collision slot.
    pub col: u32,
    pub chunk_size: u32,
    /// Bytes of real content; below `chunk_size` only for a file's last block.
    pub valid: u32,
    pub refs: u64,
}

impl Block {
    pub fn object_name(&self) -> ObjectName {
        ObjectName::new(self.strong, self.col)
    }
}

/// How a version's bytes are stored. The two forms are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionBody {
    /// Ordered block list; duplicates allowed.
    Blocks(Vec<BlockId>),
    /// Edit script against the nearest preceding block-form version.
    Script(ScriptId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    /// Seconds since the Unix epoch.
    pub created: u64,
    pub chunk_size: u32,
    pub size: u64,
    pub content_hash: StrongHash,
    pub body: VersionBody,
}

impl Version {
    pub fn is_script(&self) -> bool {
        matches!(self.body, VersionBody::Script(_))
    }

    pub fn blocks(&self) -> Option<&[BlockId]> {
        match &self.body {
            VersionBody::Blocks(blocks) => Some(blocks),
            VersionBody::Script(_) => None,
        }
    }

    pub fn script(&self) -> Option<ScriptId> {
        match self.body {
            VersionBody::Script(id) => Some(id),
            VersionBody::Blocks(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub children: BTreeMap<String, NodeId>,
}

/// Versions in chronological order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub versions: Vec<Version>,
}

impl File {
    pub fn latest(&self) -> Option<&Version> {
        self.versions.last()
    }

    /// Index of the newest block-form version at or before `index`.
    pub fn base_of(&self, index: usize) -> Option<usize> {
        self.versions
            .get(..=index)?
            .iter()
            .rposition(|v| !v.is_script())
    }

    /// Number of script-form versions at the end of the list.
    pub fn trailing_scripts(&self) -> usize {
        self.versions
            .iter()
            .rev()
            .take_while(|v| v.is_script())
            .count()
    }

    pub fn position(&self, id: VersionId) -> Option<usize> {
        self.versions.iter().position(|v| v.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Item {
    Directory(Directory),
    File(File),
}

impl Item {
    pub fn is_dir(&self) -> bool {
        matches!(self, Item::Directory(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Item::File(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub parent: Option<NodeId>,
    pub item: Item,
}

/// Kind of a listing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Directory,
    File,
}

/// One line of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Zero for directories.
    pub versions: usize,
    /// Size of the latest version; zero for directories.
    pub size: u64,
}

/// Metadata of one version as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub index: usize,
    pub created: u64,
    pub size: u64,
    pub chunk_size: u32,
    pub is_script: bool,
    pub content_hash: StrongHash,
}

/// Lightweight copy of the block index the client chunker looks blocks up in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndex {
    entries: HashMap<WeakHash, Vec<(StrongHash, u32)>>,
}

impl BlockIndex {
    pub fn insert(&mut self, weak: WeakHash, strong: StrongHash, valid: u32) {
        let bucket = self.entries.entry(weak).or_default();
        if !bucket.contains(&(strong, valid)) {
            bucket.push((strong, valid));
        }
    }

    pub fn contains_weak(&self, weak: WeakHash) -> bool {
        self.entries.contains_key(&weak)
    }

    pub fn contains(&self, weak: WeakHash, strong: &StrongHash, valid: u32) -> bool {
        self.entries
            .get(&weak)
            .is_some_and(|bucket| bucket.contains(&(*strong, valid)))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Split into parts of at most `per_part` entries each.
    pub fn split(self, per_part: usize) -> Vec<BlockIndex> {
        let per_part = per_part.max(1);
        let mut parts = Vec::new();
        let mut current = BlockIndex::default();
        let mut count = 0;
        for (weak, bucket) in self.entries {
            for (strong, valid) in bucket {
                if count == per_part {
                    parts.push(std::mem::take(&mut current));
                    count = 0;
                }
                current.insert(weak, strong, valid);
                count += 1;
            }
        }
        if count > 0 || parts.is_empty() {
            parts.push(current);
        }
        parts
    }

    /// Fold another part into this one.
    pub fn merge(&mut self, other: BlockIndex) {
        for (weak, bucket) in other.entries {
            for (strong, valid) in bucket {
                self.insert(weak, strong, valid);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
