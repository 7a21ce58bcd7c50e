//! Version compaction: block form ⇄ script form.
//!
//! A new version is stored as an edit script against the newest block-form
//! version of its file when
//!
//! - the file already has a block-form version,
//! - the run of trailing script versions is shorter than `script_limit`,
//! - both sides fit `max_script_input`,
//! - and the diff stays under `max_edit_ratio × (|base| + |target|)` edits.
//!
//! Otherwise it keeps its blocks. A script version takes no block
//! references; blocks uploaded for it that nothing else uses are swept by
//! the next GC.

use std::collections::HashSet;

use dvault_cas::{
    strong_hash, weak_hash, CasError, ChunkMessage, ChunkSink, Chunker, StrongHash, WeakHash,
};
use dvault_config::{log_store_debug, log_store_warn};
use dvault_diff::{diff, DiffOptions, EditScript};
use tracing::instrument;

use crate::error::{Result, StoreError};
use crate::model::{Block, BlockId, NodeId, Version, VersionBody};
use crate::store::{now_secs, Committed, Store};

/// Versions smaller than this together are always worth diffing.
const OVERLAP_CHECK_MIN: u64 = 64 * 1024;

impl Store {
    // === blocks ===

    /// Return the block with these bytes, writing a new one if needed.
    ///
    /// Creating a block first makes room for it, which may run GC.
    pub fn resolve_or_create(&mut self, payload: &[u8], chunk_size: usize) -> Result<BlockId> {
        let weak = weak_hash(payload, chunk_size);
        let strong = strong_hash(payload, chunk_size);
        if let Some(id) = self.db.find(weak, &strong, payload.len() as u32) {
            return Ok(id);
        }
        self.ensure_space(payload.len() as u64)?;
        self.create_block(payload, chunk_size, weak, strong)
    }

    /// Like [`Store::resolve_or_create`] without the space check; used while
    /// rewriting versions, where a GC round could shift the versions being
    /// worked on.
    pub(crate) fn store_block(&mut self, payload: &[u8], chunk_size: usize) -> Result<BlockId> {
        let weak = weak_hash(payload, chunk_size);
        let strong = strong_hash(payload, chunk_size);
        match self.db.find(weak, &strong, payload.len() as u32) {
            Some(id) => Ok(id),
            None => self.create_block(payload, chunk_size, weak, strong),
        }
    }

    fn create_block(
        &mut self,
        payload: &[u8],
        chunk_size: usize,
        weak: WeakHash,
        strong: StrongHash,
    ) -> Result<BlockId> {
        let id = self
            .db
            .insert_block(weak, strong, chunk_size as u32, payload.len() as u32);
        let name = self
            .db
            .block(id)
            .map(Block::object_name)
            .ok_or_else(|| StoreError::Corrupt(format!("block {:?} vanished", id)))?;

        if let Err(e) = self.objects.put(&name, payload) {
            self.db.remove_block(id);
            return Err(e.into());
        }
        self.usage += payload.len() as u64;
        Ok(id)
    }

    fn load_payload(&self, block: &Block) -> Result<Vec<u8>> {
        let mut data = self.objects.get(&block.object_name()).map_err(|e| match e {
            CasError::NotFound { name } => StoreError::BlockNotFound(name),
            other => StoreError::Cas(other),
        })?;
        if data.len() < block.valid as usize {
            return Err(StoreError::Corrupt(format!(
                "payload {} holds {} bytes, expected {}",
                block.object_name(),
                data.len(),
                block.valid
            )));
        }
        data.truncate(block.valid as usize);
        Ok(data)
    }

    /// Concatenate the valid bytes of `ids` in order.
    pub fn read_blocks(&self, ids: &[BlockId]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for id in ids {
            let block = self
                .db
                .block(*id)
                .ok_or_else(|| StoreError::BlockNotFound(format!("block #{}", id.0)))?;
            out.extend_from_slice(&self.load_payload(block)?);
        }
        Ok(out)
    }

    /// Whole-content hash of the bytes `ids` describe, without buffering them.
    pub(crate) fn hash_blocks(&self, ids: &[BlockId]) -> Result<StrongHash> {
        let mut hasher = blake3::Hasher::new();
        for id in ids {
            let block = self
                .db
                .block(*id)
                .ok_or_else(|| StoreError::BlockNotFound(format!("block #{}", id.0)))?;
            hasher.update(&self.load_payload(block)?);
        }
        Ok(*hasher.finalize().as_bytes())
    }

    /// Chunk `data` into blocks against the live index.
    pub(crate) fn blocks_from_bytes(&mut self, data: &[u8], chunk_size: usize) -> Result<Vec<BlockId>> {
        let mut sink = StoreSink {
            store: self,
            chunk_size,
            blocks: Vec::new(),
        };
        Chunker::new(chunk_size).run_slice(data, &mut sink)?;
        Ok(sink.blocks)
    }

    // === versions ===

    /// Reconstruct the bytes of version `index` of `file`.
    #[instrument(skip(self), level = "debug")]
    pub fn materialize(&self, file: NodeId, index: usize) -> Result<Vec<u8>> {
        let path = self.db.path_of(file);
        let f = self
            .db
            .file(file)
            .ok_or_else(|| StoreError::NotAFile(path.clone()))?;
        let version = f.versions.get(index).ok_or(StoreError::WrongVersionNumber {
            index,
            count: f.versions.len(),
        })?;

        match &version.body {
            VersionBody::Blocks(ids) => self.read_blocks(ids),
            VersionBody::Script(script_id) => {
                let base = f
                    .base_of(index)
                    .and_then(|i| f.versions[i].blocks())
                    .ok_or_else(|| StoreError::Corrupt(format!("{}#{} has no base", path, index)))?;
                let script = self
                    .scripts
                    .get(script_id)
                    .ok_or_else(|| StoreError::Corrupt(format!("{}#{} lost its script", path, index)))?;
                let base_bytes = self.read_blocks(base)?;
                Ok(script.apply(&base_bytes)?)
            }
        }
    }

    /// Diff under the configured ceiling; `None` means "store as blocks".
    pub(crate) fn try_diff(&self, base: &[u8], target: &[u8]) -> Option<EditScript> {
        let limit = self.options.max_script_input;
        if base.len() as u64 > limit || target.len() as u64 > limit {
            return None;
        }
        let ceiling = ((base.len() + target.len()) as f64 * self.options.max_edit_ratio) as usize;
        let options = DiffOptions {
            heuristic: self.options.heuristic,
            max_edits: Some(ceiling),
            ..DiffOptions::default()
        };
        match diff(base, target, options) {
            Ok(script) => Some(script),
            Err(e) => {
                log_store_debug!("Falling back to blocks", reason = e.to_string());
                None
            }
        }
    }

    /// Cheap pre-check before diffing large versions: the bytes of `target`
    /// blocks that `base` also holds bound how much the two share at block
    /// granularity. When even that leaves more edits than the ceiling allows,
    /// the diff is not worth running.
    fn may_diff_well(&self, base: &[BlockId], target: &[BlockId], base_size: u64, size: u64) -> bool {
        let total = base_size + size;
        if total < OVERLAP_CHECK_MIN {
            return true;
        }
        let shared: HashSet<BlockId> = base.iter().copied().collect();
        let common: u64 = target
            .iter()
            .filter(|id| shared.contains(id))
            .filter_map(|id| self.db.block(*id))
            .map(|b| b.valid as u64)
            .sum();
        let ceiling = (total as f64 * self.options.max_edit_ratio) as u64;
        if 2 * common + ceiling < total {
            log_store_debug!(
                "Too little overlap to diff",
                common = common,
                base = base_size,
                target = size
            );
            return false;
        }
        true
    }

    /// Append a version built from `blocks`, in script form when allowed.
    pub(crate) fn commit_version(
        &mut self,
        file: NodeId,
        chunk_size: u32,
        size: u64,
        content_hash: StrongHash,
        blocks: Vec<BlockId>,
    ) -> Result<Committed> {
        let path = self.db.path_of(file);
        let f = self
            .db
            .file(file)
            .ok_or_else(|| StoreError::NotAFile(path.clone()))?;
        let trailing = f.trailing_scripts();
        let base = f
            .versions
            .len()
            .checked_sub(1)
            .and_then(|last| f.base_of(last))
            .map(|i| (i, f.versions[i].size));
        let overlapping = base.is_some_and(|(i, base_size)| {
            f.versions[i]
                .blocks()
                .is_some_and(|base_blocks| self.may_diff_well(base_blocks, &blocks, base_size, size))
        });

        let script = match base {
            Some((base_index, base_size))
                if trailing < self.options.script_limit
                    && size <= self.options.max_script_input
                    && base_size <= self.options.max_script_input
                    && overlapping =>
            {
                match (self.materialize(file, base_index), self.read_blocks(&blocks)) {
                    (Ok(base_bytes), Ok(target)) => self.try_diff(&base_bytes, &target),
                    (Err(e), _) | (_, Err(e)) => {
                        log_store_warn!("Cannot diff, keeping blocks", path = path.as_str(), error = e.to_string());
                        None
                    }
                }
            }
            _ => None,
        };

        let body = match script {
            Some(script) => {
                let id = self.db.next_script_id();
                self.scripts.insert(id, script);
                VersionBody::Script(id)
            }
            None => VersionBody::Blocks(blocks),
        };
        let is_script = matches!(body, VersionBody::Script(_));
        let version = Version {
            id: self.db.next_version_id(),
            created: now_secs(),
            chunk_size,
            size,
            content_hash,
            body,
        };
        let index = self.db.add_version(file, version)?;
        Ok(Committed { index, is_script })
    }

    /// Turn a script-form version back into blocks. No-op for block form.
    ///
    /// The scripts that follow it in the same run were diffed against the
    /// previous block-form version, so they are re-encoded against the new
    /// one as well.
    #[instrument(skip(self), level = "debug")]
    pub fn script_to_blocks(&mut self, file: NodeId, index: usize) -> Result<()> {
        let later = {
            let f = self
                .db
                .file(file)
                .ok_or_else(|| StoreError::NotAFile(self.db.path_of(file)))?;
            let version = f
                .versions
                .get(index)
                .ok_or_else(|| StoreError::NotFound(format!("{}#{}", self.db.path_of(file), index)))?;
            if !version.is_script() {
                return Ok(());
            }
            f.versions[index + 1..]
                .iter()
                .take_while(|v| v.is_script())
                .count()
        };

        let mut contents = Vec::with_capacity(later + 1);
        for i in index..=index + later {
            contents.push(self.materialize(file, i)?);
        }
        self.rebuild_run(file, index, contents)?;
        log_store_debug!(
            "Script expanded to blocks",
            file = file.0,
            index = index,
            rebased = later
        );
        Ok(())
    }

    /// Re-encode the script versions starting at `first` from their
    /// materialized `contents`.
    ///
    /// The first one becomes block form. Each following one is diffed
    /// against the latest block-form version of the run, or becomes block
    /// form itself when that diff is over the ceiling.
    pub(crate) fn rebuild_run(&mut self, file: NodeId, first: usize, contents: Vec<Vec<u8>>) -> Result<()> {
        let mut base: Option<Vec<u8>> = None;
        for (offset, bytes) in contents.into_iter().enumerate() {
            let at = first + offset;
            let (script_id, chunk_size) = {
                let version = self
                    .db
                    .file(file)
                    .and_then(|f| f.versions.get(at))
                    .ok_or_else(|| StoreError::Corrupt(format!("version {:?}#{} vanished", file, at)))?;
                match version.script() {
                    Some(id) => (id, version.chunk_size as usize),
                    None => continue,
                }
            };

            match base.as_deref().and_then(|b| self.try_diff(b, &bytes)) {
                Some(script) => {
                    self.scripts.insert(script_id, script);
                }
                None => {
                    let blocks = self.blocks_from_bytes(&bytes, chunk_size)?;
                    self.set_blocks(file, at, blocks)?;
                    self.scripts.remove(&script_id);
                    base = Some(bytes);
                }
            }
        }
        Ok(())
    }

    /// Give a version a block body and take references for it.
    pub(crate) fn set_blocks(&mut self, file: NodeId, index: usize, blocks: Vec<BlockId>) -> Result<()> {
        self.db.increment_refs(&blocks)?;
        let version = self
            .db
            .file_mut(file)
            .and_then(|f| f.versions.get_mut(index))
            .ok_or_else(|| StoreError::Corrupt(format!("version {:?}#{} vanished", file, index)))?;
        version.body = VersionBody::Blocks(blocks);
        Ok(())
    }
}

/// Server-side chunk sink: raw runs become blocks straight away.
struct StoreSink<'a> {
    store: &'a mut Store,
    chunk_size: usize,
    blocks: Vec<BlockId>,
}

impl ChunkSink for StoreSink<'_> {
    type Error = StoreError;

    fn contains_weak(&mut self, weak: WeakHash) -> Result<bool> {
        Ok(self.store.db.contains_weak(weak))
    }

    fn contains(&mut self, weak: WeakHash, strong: &StrongHash, valid: usize) -> Result<bool> {
        Ok(self.store.db.find(weak, strong, valid as u32).is_some())
    }

    fn send(&mut self, message: ChunkMessage) -> Result<()> {
        match message {
            ChunkMessage::Raw(data) => {
                for piece in data.chunks(self.chunk_size) {
                    let id = self.store.store_block(piece, self.chunk_size)?;
                    self.blocks.push(id);
                }
            }
            ChunkMessage::Match {
                weak,
                strong,
                valid,
            } => {
                let id = self
                    .store
                    .db
                    .find(weak, &strong, valid)
                    .ok_or_else(|| StoreError::BlockNotFound(dvault_cas::hash_to_hex(&strong)))?;
                self.blocks.push(id);
            }
            ChunkMessage::End => {}
        }
        Ok(())
    }
}
