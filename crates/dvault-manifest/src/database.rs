//! In-memory filesystem database: an arena of tree nodes plus the block table.
//!
//! Nodes are addressed by [`NodeId`]; the root directory is always
//! [`Database::ROOT`]. The block table owns every [`Block`] record and keeps
//! a weak-hash index next to it. The index is not serialized; it is rebuilt
//! from the table on load.

use std::collections::HashMap;

use dvault_cas::{StrongHash, WeakHash};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::model::{
    Block, BlockId, BlockIndex, Directory, File, Item, Node, NodeId, ScriptId, Version,
    VersionBody, VersionId,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    nodes: HashMap<NodeId, Node>,
    blocks: HashMap<BlockId, Block>,
    #[serde(skip)]
    weak_index: HashMap<WeakHash, Vec<BlockId>>,
    next_node: u64,
    next_block: u64,
    next_version: u64,
    next_script: u64,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a slash-separated path into components.
///
/// Empty components are ignored, so `"/a//b/"` is `["a", "b"]` and `""` is
/// the root. `.` and `..` are rejected.
pub fn split_path(path: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.iter().any(|p| *p == "." || *p == "..") {
        return Err(StoreError::MalformedPath(path.to_string()));
    }
    Ok(parts)
}

impl Database {
    pub const ROOT: NodeId = NodeId(0);

    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            Self::ROOT,
            Node {
                name: String::new(),
                parent: None,
                item: Item::Directory(Directory::default()),
            },
        );
        Self {
            nodes,
            blocks: HashMap::new(),
            weak_index: HashMap::new(),
            next_node: 1,
            next_block: 0,
            next_version: 0,
            next_script: 0,
        }
    }

    /// Rebuild the weak-hash index from the block table.
    pub fn rebuild_index(&mut self) {
        self.weak_index.clear();
        let mut ids: Vec<BlockId> = self.blocks.keys().copied().collect();
        ids.sort();
        for id in ids {
            let weak = self.blocks[&id].weak;
            self.weak_index.entry(weak).or_default().push(id);
        }
    }

    // === tree ===

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Walk existing nodes; `None` if any component is missing or a file is
    /// in the way.
    pub fn resolve(&self, components: &[&str]) -> Option<NodeId> {
        let mut current = Self::ROOT;
        for name in components {
            match &self.nodes.get(&current)?.item {
                Item::Directory(dir) => current = *dir.children.get(*name)?,
                Item::File(_) => return None,
            }
        }
        Some(current)
    }

    /// Look up an item. Empty or invalid paths are simply not found.
    pub fn get_item(&self, path: &str) -> Option<&Node> {
        let components = split_path(path).ok()?;
        self.resolve(&components).and_then(|id| self.nodes.get(&id))
    }

    pub fn find_file(&self, path: &str) -> Option<NodeId> {
        let components = split_path(path).ok()?;
        let id = self.resolve(&components)?;
        self.file(id).map(|_| id)
    }

    pub fn file(&self, id: NodeId) -> Option<&File> {
        match &self.nodes.get(&id)?.item {
            Item::File(file) => Some(file),
            Item::Directory(_) => None,
        }
    }

    pub fn file_mut(&mut self, id: NodeId) -> Option<&mut File> {
        match &mut self.nodes.get_mut(&id)?.item {
            Item::File(file) => Some(file),
            Item::Directory(_) => None,
        }
    }

    /// Would creating these components require new nodes?
    ///
    /// Fails with `MalformedPath` if a file sits on the way.
    pub fn missing_nodes(&self, components: &[&str]) -> Result<usize> {
        let mut current = Self::ROOT;
        for (depth, name) in components.iter().enumerate() {
            let node = self.node_or_corrupt(current)?;
            match &node.item {
                Item::Directory(dir) => match dir.children.get(*name) {
                    Some(child) => current = *child,
                    None => return Ok(components.len() - depth),
                },
                Item::File(_) => return Err(StoreError::MalformedPath(components.join("/"))),
            }
        }
        Ok(0)
    }

    /// Create missing directories along `components`.
    pub fn make_path(&mut self, components: &[&str]) -> Result<NodeId> {
        let mut current = Self::ROOT;
        for name in components {
            current = match &self.node_or_corrupt(current)?.item {
                Item::Directory(dir) => match dir.children.get(*name) {
                    Some(child) => *child,
                    None => self.attach(current, name, Item::Directory(Directory::default()))?,
                },
                Item::File(_) => return Err(StoreError::MalformedPath(components.join("/"))),
            };
        }
        match self.node_or_corrupt(current)?.item {
            Item::Directory(_) => Ok(current),
            Item::File(_) => Err(StoreError::MalformedPath(components.join("/"))),
        }
    }

    /// Return the file at `components`, creating it and its parents if needed.
    pub fn add_file(&mut self, components: &[&str]) -> Result<NodeId> {
        let (name, parents) = components
            .split_last()
            .ok_or_else(|| StoreError::MalformedPath("/".to_string()))?;
        let parent = self.make_path(parents)?;

        let existing = match &self.node_or_corrupt(parent)?.item {
            Item::Directory(dir) => dir.children.get(*name).copied(),
            Item::File(_) => return Err(StoreError::MalformedPath(components.join("/"))),
        };
        match existing {
            Some(id) if self.file(id).is_some() => Ok(id),
            Some(_) => Err(StoreError::NotAFile(components.join("/"))),
            None => self.attach(parent, name, Item::File(File::default())),
        }
    }

    fn attach(&mut self, parent: NodeId, name: &str, item: Item) -> Result<NodeId> {
        let id = NodeId(self.next_node);
        match self.nodes.get_mut(&parent).map(|n| &mut n.item) {
            Some(Item::Directory(dir)) => {
                dir.children.insert(name.to_string(), id);
            }
            _ => return Err(StoreError::Corrupt(format!("parent {:?} is not a directory", parent))),
        }
        self.next_node += 1;
        self.nodes.insert(
            id,
            Node {
                name: name.to_string(),
                parent: Some(parent),
                item,
            },
        );
        Ok(id)
    }

    fn node_or_corrupt(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| StoreError::Corrupt(format!("dangling node {:?}", id)))
    }

    /// Detach a subtree and return every version it held. Block references
    /// are not touched; the caller owns that.
    pub fn remove_subtree(&mut self, id: NodeId) -> Result<Vec<Version>> {
        if id == Self::ROOT {
            return Err(StoreError::MalformedPath("/".to_string()));
        }
        let node = self.node_or_corrupt(id)?;
        if let Some(parent) = node.parent {
            let name = node.name.clone();
            if let Some(Item::Directory(dir)) = self.nodes.get_mut(&parent).map(|n| &mut n.item) {
                dir.children.remove(&name);
            }
        }

        let mut versions = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                match node.item {
                    Item::Directory(dir) => stack.extend(dir.children.into_values()),
                    Item::File(file) => versions.extend(file.versions),
                }
            }
        }
        Ok(versions)
    }

    /// Slash-separated path of a node, for logs and errors.
    pub fn path_of(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current.and_then(|c| self.nodes.get(&c)) {
            if node.parent.is_some() {
                parts.push(node.name.as_str());
            }
            current = node.parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    pub fn files(&self) -> impl Iterator<Item = (NodeId, &File)> {
        self.nodes.iter().filter_map(|(id, node)| match &node.item {
            Item::File(file) => Some((*id, file)),
            Item::Directory(_) => None,
        })
    }

    pub fn file_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.files().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }

    pub fn directory_count(&self) -> usize {
        self.nodes.values().filter(|n| n.item.is_dir()).count()
    }

    // === versions ===

    pub fn next_version_id(&mut self) -> VersionId {
        let id = VersionId(self.next_version);
        self.next_version += 1;
        id
    }

    pub fn next_script_id(&mut self) -> ScriptId {
        let id = ScriptId(self.next_script);
        self.next_script += 1;
        id
    }

    /// Append a version; a block-form version takes a reference on each block.
    pub fn add_version(&mut self, file: NodeId, version: Version) -> Result<usize> {
        if self.file(file).is_none() {
            return Err(StoreError::NotAFile(self.path_of(file)));
        }
        if let VersionBody::Blocks(blocks) = &version.body {
            let blocks = blocks.clone();
            self.increment_refs(&blocks)?;
        }
        let path = self.path_of(file);
        let versions = &mut self
            .file_mut(file)
            .ok_or(StoreError::NotAFile(path))?
            .versions;
        versions.push(version);
        Ok(versions.len() - 1)
    }

    // === blocks ===

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.blocks.iter().map(|(id, b)| (*id, b))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn contains_weak(&self, weak: WeakHash) -> bool {
        self.weak_index.contains_key(&weak)
    }

    /// Find the block with this identity.
    pub fn find(&self, weak: WeakHash, strong: &StrongHash, valid: u32) -> Option<BlockId> {
        self.weak_index.get(&weak)?.iter().copied().find(|id| {
            self.blocks
                .get(id)
                .is_some_and(|b| b.strong == *strong && b.valid == valid)
        })
    }

    /// Insert a new block record with refs 0.
    ///
    /// Blocks that share a strong hash (the same padded window with a
    /// different valid length) get consecutive collision slots. Equal
    /// padded windows always share a weak hash, so scanning the weak
    /// bucket is enough.
    pub fn insert_block(
        &mut self,
        weak: WeakHash,
        strong: StrongHash,
        chunk_size: u32,
        valid: u32,
    ) -> BlockId {
        let col = self
            .weak_index
            .get(&weak)
            .into_iter()
            .flatten()
            .filter_map(|id| self.blocks.get(id))
            .filter(|b| b.strong == strong)
            .map(|b| b.col + 1)
            .max()
            .unwrap_or(0);

        let id = BlockId(self.next_block);
        self.next_block += 1;
        self.blocks.insert(
            id,
            Block {
                weak,
                strong,
                col,
                chunk_size,
                valid,
                refs: 0,
            },
        );
        self.weak_index.entry(weak).or_default().push(id);
        id
    }

    /// Add one reference per entry of `ids`. Nothing changes unless every
    /// id names a known block.
    pub fn increment_refs(&mut self, ids: &[BlockId]) -> Result<()> {
        if let Some(id) = ids.iter().find(|id| !self.blocks.contains_key(id)) {
            return Err(StoreError::BlockNotFound(format!("{:?}", id)));
        }
        for id in ids {
            if let Some(block) = self.blocks.get_mut(id) {
                block.refs += 1;
            }
        }
        Ok(())
    }

    pub fn decrement_refs(&mut self, ids: &[BlockId]) {
        for id in ids {
            match self.blocks.get_mut(id) {
                Some(block) if block.refs > 0 => block.refs -= 1,
                Some(_) => warn!(block = id.0, "ref count underflow"),
                None => warn!(block = id.0, "decrement on unknown block"),
            }
        }
    }

    pub fn remove_block(&mut self, id: BlockId) -> Option<Block> {
        let block = self.blocks.remove(&id)?;
        if let Some(bucket) = self.weak_index.get_mut(&block.weak) {
            bucket.retain(|b| *b != id);
            if bucket.is_empty() {
                self.weak_index.remove(&block.weak);
            }
        }
        Some(block)
    }

    /// Snapshot of the block identities for the client chunker.
    pub fn index_snapshot(&self) -> BlockIndex {
        let mut index = BlockIndex::default();
        for block in self.blocks.values() {
            index.insert(block.weak, block.strong, block.valid);
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks_version(db: &mut Database, blocks: Vec<BlockId>) -> Version {
        Version {
            id: db.next_version_id(),
            created: 0,
            chunk_size: 4,
            size: 0,
            content_hash: [0; 32],
            body: VersionBody::Blocks(blocks),
        }
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/a//b/").unwrap(), vec!["a", "b"]);
        assert!(split_path("").unwrap().is_empty());
        assert!(matches!(split_path("a/../b"), Err(StoreError::MalformedPath(_))));
    }

    #[test]
    fn test_make_path_and_lookup() {
        let mut db = Database::new();
        let dir = db.make_path(&["docs", "2024"]).unwrap();
        assert_eq!(db.resolve(&["docs", "2024"]), Some(dir));
        assert_eq!(db.path_of(dir), "/docs/2024");
        assert!(db.get_item("docs").unwrap().item.is_dir());
        assert!(db.get_item("").unwrap().item.is_dir());
        assert!(db.get_item("nope").is_none());
        assert!(db.get_item("../x").is_none());

        // Idempotent.
        assert_eq!(db.make_path(&["docs", "2024"]).unwrap(), dir);
    }

    #[test]
    fn test_cannot_descend_through_file() {
        let mut db = Database::new();
        db.add_file(&["a", "f"]).unwrap();

        assert!(matches!(
            db.make_path(&["a", "f", "g"]),
            Err(StoreError::MalformedPath(_))
        ));
        assert!(matches!(
            db.add_file(&["a", "f", "g"]),
            Err(StoreError::MalformedPath(_))
        ));
        assert!(matches!(
            db.missing_nodes(&["a", "f", "g"]),
            Err(StoreError::MalformedPath(_))
        ));
        assert_eq!(db.missing_nodes(&["a", "x", "y"]).unwrap(), 2);
        assert!(matches!(db.add_file(&["a"]), Err(StoreError::NotAFile(_))));
        assert!(matches!(db.add_file(&[]), Err(StoreError::MalformedPath(_))));
    }

    #[test]
    fn test_add_file_is_idempotent() {
        let mut db = Database::new();
        let f = db.add_file(&["x.txt"]).unwrap();
        assert_eq!(db.add_file(&["x.txt"]).unwrap(), f);
        assert_eq!(db.find_file("/x.txt"), Some(f));
        assert_eq!(db.find_file("/"), None);
    }

    #[test]
    fn test_add_version_counts_refs() {
        let mut db = Database::new();
        let a = db.insert_block(1, [1; 32], 4, 4);
        let b = db.insert_block(2, [2; 32], 4, 4);
        let f = db.add_file(&["f"]).unwrap();

        let v = blocks_version(&mut db, vec![a, b, a]);
        assert_eq!(db.add_version(f, v).unwrap(), 0);
        assert_eq!(db.block(a).unwrap().refs, 2);
        assert_eq!(db.block(b).unwrap().refs, 1);

        db.decrement_refs(&[a, b, a]);
        assert_eq!(db.block(a).unwrap().refs, 0);
        assert_eq!(db.block(b).unwrap().refs, 0);
    }

    #[test]
    fn test_unknown_block_leaves_refs_untouched() {
        let mut db = Database::new();
        let a = db.insert_block(1, [1; 32], 4, 4);
        let b = db.insert_block(2, [2; 32], 4, 4);
        let f = db.add_file(&["f"]).unwrap();

        assert!(matches!(
            db.increment_refs(&[a, b, BlockId(99)]),
            Err(StoreError::BlockNotFound(_))
        ));
        let v = blocks_version(&mut db, vec![a, BlockId(99), b]);
        assert!(db.add_version(f, v).is_err());
        assert_eq!(db.block(a).unwrap().refs, 0);
        assert_eq!(db.block(b).unwrap().refs, 0);
        assert!(db.file(f).unwrap().versions.is_empty());
    }

    #[test]
    fn test_collision_slots() {
        let mut db = Database::new();
        let first = db.insert_block(9, [7; 32], 4, 2);
        let second = db.insert_block(9, [7; 32], 4, 4);
        let other = db.insert_block(9, [8; 32], 4, 4);

        assert_eq!(db.block(first).unwrap().col, 0);
        assert_eq!(db.block(second).unwrap().col, 1);
        assert_eq!(db.block(other).unwrap().col, 0);
        assert_eq!(db.find(9, &[7; 32], 4), Some(second));
        assert_eq!(db.find(9, &[7; 32], 2), Some(first));
        assert_eq!(db.find(9, &[7; 32], 3), None);
    }

    #[test]
    fn test_remove_block_updates_index() {
        let mut db = Database::new();
        let id = db.insert_block(5, [5; 32], 4, 4);
        assert!(db.contains_weak(5));
        assert!(db.remove_block(id).is_some());
        assert!(!db.contains_weak(5));
        assert_eq!(db.find(5, &[5; 32], 4), None);
    }

    #[test]
    fn test_remove_subtree_returns_versions() {
        let mut db = Database::new();
        let f1 = db.add_file(&["d", "one"]).unwrap();
        let f2 = db.add_file(&["d", "sub", "two"]).unwrap();
        let v1 = blocks_version(&mut db, vec![]);
        let v2 = blocks_version(&mut db, vec![]);
        db.add_version(f1, v1).unwrap();
        db.add_version(f2, v2).unwrap();

        let dir = db.resolve(&["d"]).unwrap();
        let removed = db.remove_subtree(dir).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(db.get_item("d").is_none());
        assert!(db.file(f1).is_none());
        assert!(matches!(
            db.remove_subtree(Database::ROOT),
            Err(StoreError::MalformedPath(_))
        ));
    }

    #[test]
    fn test_rebuild_index_after_roundtrip() {
        let mut db = Database::new();
        let id = db.insert_block(3, [3; 32], 4, 4);
        let bytes = bincode::serialize(&db).unwrap();
        let mut loaded: Database = bincode::deserialize(&bytes).unwrap();
        assert!(!loaded.contains_weak(3));
        loaded.rebuild_index();
        assert_eq!(loaded.find(3, &[3; 32], 4), Some(id));
    }
}
