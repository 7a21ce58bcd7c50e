//! Space manager: capacity checks, version reclamation and block sweeping.
//!
//! Two deletion primitives with different guarantees live here:
//!
//! - [`Store::unsafe_delete_version`] is what GC uses. Deleting a block-form
//!   version also deletes the script versions right after it, because their
//!   base is gone. This loses data on purpose; it is cheap and only ever
//!   applied to versions that have a newer block-form sibling.
//! - [`Store::delete_version`] is the user-facing delete. It first rewrites
//!   every dependent script so that no other version becomes unreadable.

use dvault_cas::{disk_usage, CasError};
use dvault_config::{log_gc_debug, log_gc_info, log_gc_warn};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{Result, StoreError};
use crate::model::{NodeId, VersionId};
use crate::store::Store;

/// What one reclaim pass freed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub versions_removed: u64,
    /// Script versions dropped together with their base.
    pub scripts_cascaded: u64,
    pub blocks_freed: u64,
    pub bytes_freed: u64,
}

impl GcReport {
    pub fn merge(&mut self, other: GcReport) {
        self.versions_removed += other.versions_removed;
        self.scripts_cascaded += other.scripts_cascaded;
        self.blocks_freed += other.blocks_freed;
        self.bytes_freed += other.bytes_freed;
    }
}

/// A superseded block-form version and what losing it costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalCandidate {
    pub file: NodeId,
    pub version: VersionId,
    /// Newer block-form versions of the same file times this version's size.
    pub value: u64,
}

impl Store {
    /// Reserved capacity minus what the store occupies on disk.
    pub fn available_space(&self) -> u64 {
        self.options.reserved_capacity.saturating_sub(self.usage)
    }

    /// Re-measure on-disk usage instead of trusting the running count.
    pub fn refresh_usage(&mut self) -> Result<u64> {
        self.usage = disk_usage(&self.root)?;
        Ok(self.usage)
    }

    /// Make sure `needed` more bytes fit, running up to `gc_rounds` reclaim
    /// passes first.
    pub fn ensure_space(&mut self, needed: u64) -> Result<()> {
        if needed < self.available_space() {
            return Ok(());
        }

        for round in 1..=self.options.gc_rounds {
            let report = self.reclaim_once()?;
            log_gc_info!(
                "Reclaim round finished",
                round = round,
                needed = needed,
                available = self.available_space(),
                versions = report.versions_removed,
                blocks = report.blocks_freed
            );
            if needed < self.available_space() {
                return Ok(());
            }
        }

        let available = self.available_space();
        log_gc_warn!("Out of space", needed = needed, available = available);
        Err(StoreError::NotEnoughSpaceOnDisc { needed, available })
    }

    /// Remove every superseded block-form version, then sweep orphans.
    #[instrument(skip(self), level = "debug")]
    pub fn reclaim_once(&mut self) -> Result<GcReport> {
        let mut report = GcReport::default();

        for candidate in self.select_removable_versions() {
            // An earlier deletion in this pass may already have taken it.
            let index = match self
                .db
                .file(candidate.file)
                .and_then(|f| f.position(candidate.version))
            {
                Some(index) => index,
                None => continue,
            };
            let cascaded = self.unsafe_delete_version(candidate.file, index)?;
            report.versions_removed += 1;
            report.scripts_cascaded += cascaded as u64;
        }

        let (blocks, bytes) = self.collect_orphaned_blocks()?;
        report.blocks_freed = blocks;
        report.bytes_freed = bytes;
        Ok(report)
    }

    /// Block-form versions with at least one newer block-form sibling,
    /// cheapest to lose first.
    pub fn select_removable_versions(&self) -> Vec<RemovalCandidate> {
        let mut candidates = Vec::new();
        for (file_id, file) in self.db.files() {
            let mut newer = 0u64;
            for version in file.versions.iter().rev() {
                if version.is_script() {
                    continue;
                }
                if newer > 0 {
                    candidates.push(RemovalCandidate {
                        file: file_id,
                        version: version.id,
                        value: newer.saturating_mul(version.size),
                    });
                }
                newer += 1;
            }
        }
        candidates.sort_by_key(|c| (c.value, c.file, c.version));
        candidates
    }

    /// Delete a version without preserving its dependents.
    ///
    /// A block-form version releases its blocks and takes the script
    /// versions that follow it down with it. Returns how many of those
    /// scripts were dropped.
    pub fn unsafe_delete_version(&mut self, file: NodeId, index: usize) -> Result<usize> {
        let path = self.db.path_of(file);
        let f = self
            .db
            .file_mut(file)
            .ok_or_else(|| StoreError::NotAFile(path.clone()))?;
        let count = f.versions.len();
        if index >= count {
            return Err(StoreError::WrongVersionNumber { index, count });
        }

        let end = if f.versions[index].is_script() {
            index + 1
        } else {
            index
                + 1
                + f.versions[index + 1..]
                    .iter()
                    .take_while(|v| v.is_script())
                    .count()
        };
        if end - index >= count {
            return Err(StoreError::TooFewVersions(path));
        }

        let removed: Vec<_> = f.versions.drain(index..end).collect();
        self.dirty = true;
        for version in &removed {
            self.release_version(version);
        }
        let cascaded = removed.len() - 1;
        log_gc_debug!(
            "Version removed",
            path = path.as_str(),
            index = index,
            cascaded = cascaded
        );
        Ok(cascaded)
    }

    /// Delete every unpinned block nobody references, payload first.
    pub fn collect_orphaned_blocks(&mut self) -> Result<(u64, u64)> {
        let mut orphans: Vec<_> = self
            .db
            .blocks()
            .filter(|(id, b)| b.refs == 0 && !self.is_pinned(*id))
            .map(|(id, b)| (id, b.object_name(), b.valid as u64))
            .collect();
        orphans.sort_by_key(|(id, _, _)| *id);

        if !orphans.is_empty() {
            self.dirty = true;
        }
        let mut freed = 0u64;
        for (id, name, len) in &orphans {
            match self.objects.delete(name) {
                Ok(()) | Err(CasError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            self.db.remove_block(*id);
            self.usage = self.usage.saturating_sub(*len);
            freed += len;
        }
        Ok((orphans.len() as u64, freed))
    }

    /// Delete one version of `path` without losing any other version.
    ///
    /// Dependent script versions of a block-form target are rebuilt first:
    /// the first one becomes block form, the rest are diffed again against
    /// it (or also become block form when that diff is too large).
    #[instrument(skip(self), level = "debug")]
    pub fn delete_version(&mut self, path: &str, index: usize) -> Result<()> {
        let file = self.file_or_not_found(path)?;
        let (count, is_script, dependents) = {
            let f = self
                .db
                .file(file)
                .ok_or_else(|| StoreError::NotAFile(path.to_string()))?;
            let count = f.versions.len();
            if index >= count {
                return Err(StoreError::WrongVersionNumber { index, count });
            }
            let dependents = f.versions[index + 1..]
                .iter()
                .take_while(|v| v.is_script())
                .count();
            (count, f.versions[index].is_script(), dependents)
        };
        if count == 1 {
            return Err(StoreError::TooFewVersions(path.to_string()));
        }

        if !is_script && dependents > 0 {
            self.rebase_dependents(file, index, dependents)?;
        }

        self.unsafe_delete_version(file, index)?;
        log_gc_info!("Version deleted", path = path, index = index, rebased = dependents);
        Ok(())
    }

    /// Detach the scripts at `index+1 ..= index+dependents` from the
    /// block-form version at `index`.
    fn rebase_dependents(&mut self, file: NodeId, index: usize, dependents: usize) -> Result<()> {
        let mut contents = Vec::with_capacity(dependents);
        for i in index + 1..=index + dependents {
            contents.push(self.materialize(file, i)?);
        }
        self.rebuild_run(file, index + 1, contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;
    use tempfile::TempDir;

    fn open(temp: &TempDir, script_limit: usize) -> Store {
        let options = StoreOptions {
            script_limit,
            ..StoreOptions::default()
        };
        Store::open(temp.path(), options).unwrap()
    }

    fn scripts_of(store: &Store, path: &str) -> Vec<bool> {
        store
            .versions(path)
            .unwrap()
            .iter()
            .map(|v| v.is_script)
            .collect()
    }

    #[test]
    fn test_select_ranks_by_value() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp, 0);
        store.ingest("big", &[1u8; 100], 4).unwrap();
        store.ingest("big", &[2u8; 100], 4).unwrap();
        store.ingest("small", b"0123456789", 4).unwrap();
        store.ingest("small", b"abcdefghij", 4).unwrap();
        store.ingest("small", b"ABCDEFGHIJ", 4).unwrap();
        store.ingest("only", b"single", 4).unwrap();

        let candidates = store.select_removable_versions();
        let values: Vec<u64> = candidates.iter().map(|c| c.value).collect();
        // small v1 (1 newer × 10), small v0 (2 × 10), big v0 (1 × 100)
        assert_eq!(values, vec![10, 20, 100]);
    }

    #[test]
    fn test_reclaim_keeps_latest_and_sweeps() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp, 0);
        store.ingest("f", b"AAAABBBB", 4).unwrap();
        store.ingest("f", b"CCCCDDDD", 4).unwrap();

        let report = store.reclaim_once().unwrap();
        assert_eq!(report.versions_removed, 1);
        assert_eq!(report.blocks_freed, 2);
        assert_eq!(report.bytes_freed, 8);
        assert_eq!(store.read_version("f", None).unwrap(), b"CCCCDDDD");
        assert_eq!(store.versions("f").unwrap().len(), 1);
        assert!(store.verify().unwrap().is_clean());

        // Nothing left to take.
        assert_eq!(store.reclaim_once().unwrap(), GcReport::default());
    }

    #[test]
    fn test_unsafe_delete_cascades_scripts() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp, 2);
        store.ingest("f", b"AAAABBBBCCCC", 4).unwrap();
        store.ingest("f", b"AAAABBBBCCCX", 4).unwrap();
        store.ingest("f", b"AAAABBBBCCXX", 4).unwrap();
        store.ingest("f", b"zzzzyyyyxxxx", 4).unwrap();
        assert_eq!(scripts_of(&store, "f"), vec![false, true, true, false]);

        let file = store.database().find_file("f").unwrap();
        assert_eq!(store.unsafe_delete_version(file, 0).unwrap(), 2);
        assert_eq!(scripts_of(&store, "f"), vec![false]);
        assert!(store.scripts.is_empty());
        assert!(store.verify().unwrap().is_clean());
    }

    #[test]
    fn test_unsafe_delete_refuses_to_empty_file() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp, 2);
        store.ingest("f", b"AAAABBBB", 4).unwrap();
        store.ingest("f", b"AAAABBBX", 4).unwrap();
        let file = store.database().find_file("f").unwrap();

        assert!(matches!(
            store.unsafe_delete_version(file, 0),
            Err(StoreError::TooFewVersions(_))
        ));
        assert_eq!(store.versions("f").unwrap().len(), 2);
    }

    #[test]
    fn test_safe_delete_rebases_dependents() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp, 2);
        store.ingest("f", b"AAAABBBBCCCC", 4).unwrap();
        store.ingest("f", b"AAAABBBBCCCX", 4).unwrap();
        store.ingest("f", b"AAAABBBBCCXX", 4).unwrap();
        assert_eq!(scripts_of(&store, "f"), vec![false, true, true]);

        store.delete_version("f", 0).unwrap();

        assert_eq!(scripts_of(&store, "f"), vec![false, true]);
        assert_eq!(store.read_version("f", Some(0)).unwrap(), b"AAAABBBBCCCX");
        assert_eq!(store.read_version("f", Some(1)).unwrap(), b"AAAABBBBCCXX");
        assert_eq!(store.scripts.len(), 1);
        assert!(store.verify().unwrap().is_clean());
    }

    #[test]
    fn test_safe_delete_of_script_version() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp, 2);
        store.ingest("f", b"AAAABBBB", 4).unwrap();
        store.ingest("f", b"AAAABBBX", 4).unwrap();
        store.ingest("f", b"AAAABBXX", 4).unwrap();

        store.delete_version("f", 1).unwrap();
        assert_eq!(scripts_of(&store, "f"), vec![false, true]);
        assert_eq!(store.read_version("f", Some(1)).unwrap(), b"AAAABBXX");
        assert!(store.verify().unwrap().is_clean());
    }

    #[test]
    fn test_safe_delete_errors() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp, 2);
        store.ingest("f", b"only", 4).unwrap();

        assert!(matches!(
            store.delete_version("f", 0),
            Err(StoreError::TooFewVersions(_))
        ));
        assert!(matches!(
            store.delete_version("f", 5),
            Err(StoreError::WrongVersionNumber { index: 5, count: 1 })
        ));
        assert!(matches!(
            store.delete_version("nope", 0),
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.read_version("f", None).unwrap(), b"only");
    }

    #[test]
    fn test_pinned_blocks_survive_sweep() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp, 2);
        let id = store.resolve_or_create(b"PINN", 4).unwrap();
        store.pin(id);

        assert_eq!(store.collect_orphaned_blocks().unwrap(), (0, 0));
        store.unpin_all(&[id]);
        assert_eq!(store.collect_orphaned_blocks().unwrap(), (1, 4));
        assert!(store.database().block(id).is_none());
    }

    #[test]
    fn test_ensure_space_fails_when_nothing_to_reclaim() {
        let temp = TempDir::new().unwrap();
        let mut store = open(&temp, 2);
        store.options_mut().reserved_capacity = 10;

        assert!(store.ensure_space(5).is_ok());
        assert!(matches!(
            store.ensure_space(10),
            Err(StoreError::NotEnoughSpaceOnDisc { needed: 10, available: 10 })
        ));
    }
}
