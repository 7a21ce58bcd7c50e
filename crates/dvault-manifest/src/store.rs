//! The [`Store`] façade: database, script table, payload objects and
//! upload sessions behind one owner.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use dvault_cas::{
    content_hash, disk_usage, hash_to_hex, CasError, ChunkMessage, ChunkSink, Chunker, ObjectStore,
    StrongHash, WeakHash,
};
use dvault_config::{log_store_debug, log_store_info, log_store_warn, log_sync_debug, Config};
use dvault_diff::EditScript;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::database::{split_path, Database};
use crate::error::{Result, StoreError};
use crate::model::{
    BlockId, BlockIndex, EntryKind, Item, ListEntry, NodeId, ScriptId, Version, VersionInfo,
};

/// Bytes charged against the capacity for creating a file or directory node.
pub const ITEM_OVERHEAD: u64 = 64;

/// Tuning for a [`Store`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOptions {
    pub reserved_capacity: u64,
    /// Longest run of script-form versions after a block-form one.
    pub script_limit: usize,
    pub heuristic: bool,
    /// Edit ceiling as a fraction of base plus target length.
    pub max_edit_ratio: f64,
    /// Versions larger than this are always stored as blocks.
    pub max_script_input: u64,
    pub gc_rounds: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for StoreOptions {
    fn from(config: &Config) -> Self {
        Self {
            reserved_capacity: config.storage.reserved_capacity,
            script_limit: config.compaction.script_limit,
            heuristic: config.compaction.heuristic,
            max_edit_ratio: config.compaction.max_edit_ratio,
            max_script_input: config.compaction.max_script_input,
            gc_rounds: config.gc.rounds,
        }
    }
}

/// Handle of an in-flight upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// Result of [`Store::begin_upload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginUpload {
    /// The latest version already has this content.
    Unchanged,
    Ready(SessionId),
}

/// How a committed version ended up stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committed {
    pub index: usize,
    pub is_script: bool,
}

/// Result of [`Store::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Unchanged,
    Committed(Committed),
}

#[derive(Debug)]
pub(crate) struct UploadSession {
    pub(crate) path: String,
    pub(crate) chunk_size: usize,
    pub(crate) size: u64,
    pub(crate) content_hash: StrongHash,
    pub(crate) blocks: Vec<BlockId>,
    pub(crate) received: u64,
    pub(crate) ended: bool,
}

/// Store-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
    pub reserved_capacity: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub block_count: u64,
    pub orphan_blocks: u64,
    pub file_count: u64,
    pub directory_count: u64,
    pub version_count: u64,
    pub script_count: u64,
    pub open_uploads: u64,
}

/// A block whose recorded ref count disagrees with the version lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefMismatch {
    pub block: BlockId,
    pub recorded: u64,
    pub actual: u64,
}

/// Findings of [`Store::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub ref_mismatches: Vec<RefMismatch>,
    pub missing_blocks: Vec<BlockId>,
    pub missing_payloads: Vec<String>,
    /// Payloads whose bytes no longer match their strong hash.
    pub corrupt_payloads: Vec<String>,
    /// Objects under `blocks/` that no block record names.
    pub stray_objects: Vec<String>,
    pub missing_scripts: Vec<String>,
    pub chain_violations: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.ref_mismatches.is_empty()
            && self.missing_blocks.is_empty()
            && self.missing_payloads.is_empty()
            && self.corrupt_payloads.is_empty()
            && self.stray_objects.is_empty()
            && self.missing_scripts.is_empty()
            && self.chain_violations.is_empty()
    }
}

/// The deduplicating version store.
///
/// ```text
/// <root>/
/// ├── index.bin     # tree, versions, block table
/// ├── scripts.bin   # version edit scripts
/// └── blocks/       # one payload object per block
/// ```
pub struct Store {
    pub(crate) root: PathBuf,
    pub(crate) db: Database,
    pub(crate) scripts: HashMap<ScriptId, EditScript>,
    pub(crate) objects: ObjectStore,
    pub(crate) options: StoreOptions,
    /// Bytes on disk below `root`, kept current as objects come and go.
    pub(crate) usage: u64,
    pub(crate) uploads: HashMap<SessionId, UploadSession>,
    /// Blocks held by open uploads; the orphan sweep leaves them alone.
    pub(crate) pinned: HashMap<BlockId, usize>,
    /// Set when versions or payloads were removed since the last save.
    pub(crate) dirty: bool,
    next_session: u64,
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Store {
    /// Open the store at `root`, loading the last saved snapshot if any.
    pub fn open<P: AsRef<Path>>(root: P, options: StoreOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let objects = ObjectStore::new(&root)?;
        let (db, scripts) = crate::persist::load(&root)?;
        let usage = disk_usage(&root)?;

        log_store_info!(
            "Store opened",
            root = root.display().to_string(),
            blocks = db.block_count(),
            scripts = scripts.len(),
            usage = usage
        );

        Ok(Self {
            root,
            db,
            scripts,
            objects,
            options,
            usage,
            uploads: HashMap::new(),
            pinned: HashMap::new(),
            dirty: false,
            next_session: 0,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut StoreOptions {
        &mut self.options
    }

    /// Whether a deletion happened that the saved snapshot does not know
    /// about yet. GC can run inside any request that needs space.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn script(&self, id: ScriptId) -> Option<&EditScript> {
        self.scripts.get(&id)
    }

    /// Lightweight block index for the client chunker.
    pub fn index_snapshot(&self) -> BlockIndex {
        self.db.index_snapshot()
    }

    pub(crate) fn file_or_not_found(&self, path: &str) -> Result<NodeId> {
        let components = split_path(path)?;
        match self.db.resolve(&components) {
            Some(id) => self
                .db
                .file(id)
                .map(|_| id)
                .ok_or_else(|| StoreError::NotAFile(path.to_string())),
            None => {
                // A file on the way is a malformed path, not a missing one.
                self.db.missing_nodes(&components)?;
                Err(StoreError::NotFound(path.to_string()))
            }
        }
    }

    pub(crate) fn pin(&mut self, id: BlockId) {
        *self.pinned.entry(id).or_insert(0) += 1;
    }

    pub(crate) fn unpin_all(&mut self, ids: &[BlockId]) {
        for id in ids {
            if let Some(count) = self.pinned.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    self.pinned.remove(id);
                }
            }
        }
    }

    pub fn is_pinned(&self, id: BlockId) -> bool {
        self.pinned.contains_key(&id)
    }

    // === tree operations ===

    /// Create a directory and any missing parents.
    #[instrument(skip(self), level = "debug")]
    pub fn make_dir(&mut self, path: &str) -> Result<()> {
        let components = split_path(path)?;
        let missing = self.db.missing_nodes(&components)?;
        if missing > 0 {
            self.ensure_space(missing as u64 * ITEM_OVERHEAD)?;
        }
        self.db.make_path(&components)?;
        Ok(())
    }

    /// List a directory, or describe a single file.
    pub fn list(&self, path: &str) -> Result<Vec<ListEntry>> {
        split_path(path)?;
        let node = self
            .db
            .get_item(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        let describe = |name: &str, item: &Item| match item {
            Item::Directory(_) => ListEntry {
                name: name.to_string(),
                kind: EntryKind::Directory,
                versions: 0,
                size: 0,
            },
            Item::File(file) => ListEntry {
                name: name.to_string(),
                kind: EntryKind::File,
                versions: file.versions.len(),
                size: file.latest().map(|v| v.size).unwrap_or(0),
            },
        };

        match &node.item {
            Item::Directory(dir) => Ok(dir
                .children
                .iter()
                .filter_map(|(name, id)| self.db.node(*id).map(|n| describe(name, &n.item)))
                .collect()),
            item @ Item::File(_) => Ok(vec![describe(&node.name, item)]),
        }
    }

    pub fn versions(&self, path: &str) -> Result<Vec<VersionInfo>> {
        let id = self.file_or_not_found(path)?;
        let file = self
            .db
            .file(id)
            .ok_or_else(|| StoreError::NotAFile(path.to_string()))?;
        Ok(file
            .versions
            .iter()
            .enumerate()
            .map(|(index, v)| VersionInfo {
                index,
                created: v.created,
                size: v.size,
                chunk_size: v.chunk_size,
                is_script: v.is_script(),
                content_hash: v.content_hash,
            })
            .collect())
    }

    /// Bytes of one version; `None` means the latest.
    #[instrument(skip(self), level = "debug")]
    pub fn read_version(&self, path: &str, index: Option<usize>) -> Result<Vec<u8>> {
        let id = self.file_or_not_found(path)?;
        let count = self.db.file(id).map(|f| f.versions.len()).unwrap_or(0);
        let index = match index {
            Some(i) if i < count => i,
            None if count > 0 => count - 1,
            Some(i) => return Err(StoreError::WrongVersionNumber { index: i, count }),
            None => return Err(StoreError::WrongVersionNumber { index: 0, count }),
        };
        self.materialize(id, index)
    }

    /// Remove a file with all its versions, or a whole directory subtree.
    #[instrument(skip(self), level = "debug")]
    pub fn remove(&mut self, path: &str) -> Result<usize> {
        let components = split_path(path)?;
        if components.is_empty() {
            return Err(StoreError::MalformedPath(path.to_string()));
        }
        let id = self
            .db
            .resolve(&components)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        let versions = self.db.remove_subtree(id)?;
        for version in &versions {
            self.release_version(version);
        }
        log_store_info!("Removed", path = path, versions = versions.len());
        Ok(versions.len())
    }

    /// Give up whatever a detached version held: block refs or its script.
    pub(crate) fn release_version(&mut self, version: &Version) {
        match version.blocks() {
            Some(blocks) => self.db.decrement_refs(blocks),
            None => {
                if let Some(script) = version.script() {
                    self.scripts.remove(&script);
                }
            }
        }
    }

    // === uploads ===

    /// Open an upload for `path`.
    ///
    /// Answers [`BeginUpload::Unchanged`] when the latest version already
    /// has `content_hash`.
    #[instrument(skip(self, content_hash), level = "debug")]
    pub fn begin_upload(
        &mut self,
        path: &str,
        chunk_size: usize,
        size: u64,
        content_hash: StrongHash,
    ) -> Result<BeginUpload> {
        let components = split_path(path)?;
        if components.is_empty() {
            return Err(StoreError::MalformedPath(path.to_string()));
        }
        if chunk_size == 0 || chunk_size > u32::MAX as usize {
            return Err(StoreError::UploadState(format!("invalid chunk size {}", chunk_size)));
        }

        match self.db.resolve(&components) {
            Some(id) => {
                let file = self
                    .db
                    .file(id)
                    .ok_or_else(|| StoreError::NotAFile(path.to_string()))?;
                if file
                    .latest()
                    .is_some_and(|v| v.content_hash == content_hash && v.size == size)
                {
                    log_sync_debug!("Content unchanged", path = path);
                    return Ok(BeginUpload::Unchanged);
                }
            }
            None => {
                let missing = self.db.missing_nodes(&components)?;
                self.ensure_space(missing as u64 * ITEM_OVERHEAD)?;
            }
        }

        let id = SessionId(self.next_session);
        self.next_session += 1;
        self.uploads.insert(
            id,
            UploadSession {
                path: components.join("/"),
                chunk_size,
                size,
                content_hash,
                blocks: Vec::new(),
                received: 0,
                ended: false,
            },
        );
        log_sync_debug!("Upload started", path = path, session = id.0, chunk_size = chunk_size, size = size);
        Ok(BeginUpload::Ready(id))
    }

    /// Feed one chunk message into an open upload.
    pub fn upload_chunk(&mut self, session: SessionId, message: ChunkMessage) -> Result<()> {
        let mut upload = self
            .uploads
            .remove(&session)
            .ok_or_else(|| StoreError::UploadState(format!("no upload session {}", session.0)))?;
        let result = self.absorb(&mut upload, message);
        self.uploads.insert(session, upload);
        result
    }

    fn absorb(&mut self, upload: &mut UploadSession, message: ChunkMessage) -> Result<()> {
        if upload.ended {
            return Err(StoreError::UploadState("chunk after end of stream".into()));
        }
        let chunk_size = upload.chunk_size;

        match message {
            ChunkMessage::Raw(data) => {
                upload.received += data.len() as u64;
                if upload.received > upload.size {
                    return Err(StoreError::UploadState(format!(
                        "received more than the declared {} bytes",
                        upload.size
                    )));
                }
                for piece in data.chunks(chunk_size) {
                    let id = self.resolve_or_create(piece, chunk_size)?;
                    self.pin(id);
                    upload.blocks.push(id);
                }
            }
            ChunkMessage::Match {
                weak,
                strong,
                valid,
            } => {
                if valid == 0 || valid as usize > chunk_size {
                    return Err(StoreError::UploadState(format!("invalid block length {}", valid)));
                }
                let id = self
                    .db
                    .find(weak, &strong, valid)
                    .ok_or_else(|| StoreError::BlockNotFound(hash_to_hex(&strong)))?;
                self.pin(id);
                upload.blocks.push(id);
                upload.received += valid as u64;
            }
            ChunkMessage::End => upload.ended = true,
        }
        Ok(())
    }

    /// Commit a finished upload as a new version.
    #[instrument(skip(self), level = "debug")]
    pub fn finish_upload(&mut self, session: SessionId) -> Result<Committed> {
        let upload = self
            .uploads
            .remove(&session)
            .ok_or_else(|| StoreError::UploadState(format!("no upload session {}", session.0)))?;
        let result = self.commit_upload(&upload);
        self.unpin_all(&upload.blocks);
        result
    }

    fn commit_upload(&mut self, upload: &UploadSession) -> Result<Committed> {
        if !upload.ended {
            return Err(StoreError::UploadState("upload finished before end of stream".into()));
        }
        if upload.received != upload.size {
            return Err(StoreError::UploadState(format!(
                "received {} bytes, expected {}",
                upload.received, upload.size
            )));
        }
        let actual = self.hash_blocks(&upload.blocks)?;
        if actual != upload.content_hash {
            return Err(StoreError::UploadState(format!(
                "content hash mismatch: expected {}, got {}",
                hash_to_hex(&upload.content_hash),
                hash_to_hex(&actual)
            )));
        }

        let components = split_path(&upload.path)?;
        let file = self.db.add_file(&components)?;
        let committed = self.commit_version(
            file,
            upload.chunk_size as u32,
            upload.size,
            upload.content_hash,
            upload.blocks.clone(),
        )?;
        log_store_info!(
            "Version committed",
            path = upload.path.as_str(),
            index = committed.index,
            script = committed.is_script,
            blocks = upload.blocks.len()
        );
        Ok(committed)
    }

    /// Drop an open upload. Blocks it created stay as orphans for the next GC.
    pub fn abort_upload(&mut self, session: SessionId) -> Result<()> {
        let upload = self
            .uploads
            .remove(&session)
            .ok_or_else(|| StoreError::UploadState(format!("no upload session {}", session.0)))?;
        self.unpin_all(&upload.blocks);
        log_sync_debug!("Upload aborted", path = upload.path.as_str(), blocks = upload.blocks.len());
        Ok(())
    }

    /// Upload an in-memory buffer through the full sync protocol.
    pub fn ingest(&mut self, path: &str, data: &[u8], chunk_size: usize) -> Result<UploadOutcome> {
        let session = match self.begin_upload(path, chunk_size, data.len() as u64, content_hash(data))? {
            BeginUpload::Unchanged => return Ok(UploadOutcome::Unchanged),
            BeginUpload::Ready(session) => session,
        };

        let mut sink = IngestSink {
            store: self,
            session,
        };
        if let Err(e) = Chunker::new(chunk_size).run_slice(data, &mut sink) {
            self.abort_upload(session)?;
            return Err(e);
        }
        self.finish_upload(session).map(UploadOutcome::Committed)
    }

    // === reporting ===

    pub fn status(&self) -> Result<StoreStatus> {
        let used_bytes = disk_usage(&self.root)?;
        let mut status = StoreStatus {
            reserved_capacity: self.options.reserved_capacity,
            used_bytes,
            available_bytes: self.options.reserved_capacity.saturating_sub(used_bytes),
            block_count: self.db.block_count() as u64,
            orphan_blocks: self.db.blocks().filter(|(_, b)| b.refs == 0).count() as u64,
            directory_count: self.db.directory_count().saturating_sub(1) as u64,
            script_count: self.scripts.len() as u64,
            open_uploads: self.uploads.len() as u64,
            ..Default::default()
        };
        for (_, file) in self.db.files() {
            status.file_count += 1;
            status.version_count += file.versions.len() as u64;
        }
        Ok(status)
    }

    /// Recount block references, re-hash every payload, and check scripts
    /// and chain lengths.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        let mut actual: HashMap<BlockId, u64> = HashMap::new();

        for (id, file) in self.db.files() {
            let mut run = 0usize;
            for (index, version) in file.versions.iter().enumerate() {
                match version.blocks() {
                    Some(blocks) => {
                        run = 0;
                        for block in blocks {
                            *actual.entry(*block).or_insert(0) += 1;
                        }
                    }
                    None => {
                        run += 1;
                        let path = self.db.path_of(id);
                        if index == 0 || run > self.options.script_limit {
                            report.chain_violations.push(format!("{}#{}", path, index));
                        }
                        if version.script().is_some_and(|s| !self.scripts.contains_key(&s)) {
                            report.missing_scripts.push(format!("{}#{}", path, index));
                        }
                    }
                }
            }
        }

        let mut known = HashSet::new();
        for (id, block) in self.db.blocks() {
            let count = actual.remove(&id).unwrap_or(0);
            if count != block.refs {
                report.ref_mismatches.push(RefMismatch {
                    block: id,
                    recorded: block.refs,
                    actual: count,
                });
            }
            let name = block.object_name();
            match self.objects.get_checked(&name, block.chunk_size as usize) {
                Ok(_) => {}
                Err(CasError::NotFound { .. }) => report.missing_payloads.push(name.file_name()),
                Err(CasError::HashMismatch { .. }) => {
                    log_store_warn!("Payload does not match its hash", object = name.file_name());
                    report.corrupt_payloads.push(name.file_name());
                }
                Err(e) => return Err(e.into()),
            }
            known.insert(name);
        }

        for name in self.objects.names()? {
            if !known.contains(&name) {
                report.stray_objects.push(name.file_name());
            }
        }
        report.stray_objects.sort();
        report.missing_blocks = actual.into_keys().collect();
        report.missing_blocks.sort();
        report.ref_mismatches.sort_by_key(|m| m.block);

        log_store_debug!("Verify finished", clean = report.is_clean());
        Ok(report)
    }
}

/// Drives an upload from an in-process chunker against the live index.
struct IngestSink<'a> {
    store: &'a mut Store,
    session: SessionId,
}

impl ChunkSink for IngestSink<'_> {
    type Error = StoreError;

    fn contains_weak(&mut self, weak: WeakHash) -> Result<bool> {
        Ok(self.store.db.contains_weak(weak))
    }

    fn contains(&mut self, weak: WeakHash, strong: &StrongHash, valid: usize) -> Result<bool> {
        Ok(self.store.db.find(weak, strong, valid as u32).is_some())
    }

    fn send(&mut self, message: ChunkMessage) -> Result<()> {
        self.store.upload_chunk(self.session, message)
    }
}
