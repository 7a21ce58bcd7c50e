//! # dvault-manifest
//!
//! The versioned filesystem database behind dvault.
//!
//! - [`Database`]: arena tree of directories and files, per-file version
//!   lists, the block table with reference counts
//! - [`compactor`]: stores near-duplicate versions as edit scripts and
//!   expands them back into blocks
//! - [`gc`]: capacity checks, version reclamation and orphan sweeping
//! - [`Store`]: the façade that ties the above to the payload objects and
//!   runs the server half of the sync protocol
//!
//! ## Invariants
//!
//! - A block's `refs` equals the number of (version, position) pairs that
//!   list it. Script-form versions list no blocks.
//! - The first version of a file is never a script, and no run of script
//!   versions is longer than `script_limit`.
//! - A file always has at least one version.

pub mod compactor;
pub mod database;
pub mod error;
pub mod gc;
pub mod model;
pub mod persist;
pub mod store;

pub use database::{split_path, Database};
pub use error::{ErrorKind, Result, StoreError};
pub use gc::{GcReport, RemovalCandidate};
pub use model::{
    Block, BlockId, BlockIndex, EntryKind, File, Item, ListEntry, Node, NodeId, ScriptId, Version,
    VersionBody, VersionId, VersionInfo,
};
pub use store::{
    BeginUpload, Committed, RefMismatch, SessionId, Store, StoreOptions, StoreStatus,
    UploadOutcome, VerifyReport, ITEM_OVERHEAD,
};
