//! Snapshot persistence: `index.bin` and `scripts.bin`, written atomically.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use dvault_config::log_store_debug;
use dvault_diff::EditScript;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::database::Database;
use crate::error::Result;
use crate::model::ScriptId;
use crate::store::Store;

pub const INDEX_FILE: &str = "index.bin";
pub const SCRIPTS_FILE: &str = "scripts.bin";

/// Snapshot format version, bumped on incompatible changes.
const FORMAT_VERSION: u32 = 1;

#[derive(serde::Deserialize)]
struct IndexSnapshot {
    version: u32,
    database: Database,
}

#[derive(Serialize)]
struct IndexSnapshotRef<'a> {
    version: u32,
    database: &'a Database,
}

/// Load the saved database and script table, or empty ones for a new store.
pub(crate) fn load(root: &Path) -> Result<(Database, HashMap<ScriptId, EditScript>)> {
    let mut db = match read_bincode::<IndexSnapshot>(&root.join(INDEX_FILE))? {
        Some(snapshot) if snapshot.version == FORMAT_VERSION => snapshot.database,
        Some(snapshot) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported index format version {}", snapshot.version),
            )
            .into())
        }
        None => Database::new(),
    };
    db.rebuild_index();

    let scripts = read_bincode(&root.join(SCRIPTS_FILE))?.unwrap_or_default();
    Ok((db, scripts))
}

fn read_bincode<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let reader = BufReader::new(file);
    Ok(Some(bincode::deserialize_from(reader)?))
}

/// Serialize `value` to `path` via a temp file and rename.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let temp_path = path.with_extension(format!("bin.{}.tmp", std::process::id()));
    let result = (|| -> Result<()> {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, value)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

impl Store {
    /// Write the database and script table snapshots.
    pub fn save(&mut self) -> Result<()> {
        let index_path = self.root.join(INDEX_FILE);
        let scripts_path = self.root.join(SCRIPTS_FILE);
        let before = file_len(&index_path) + file_len(&scripts_path);

        write_atomic(
            &index_path,
            &IndexSnapshotRef {
                version: FORMAT_VERSION,
                database: &self.db,
            },
        )?;
        write_atomic(&scripts_path, &self.scripts)?;

        let after = file_len(&index_path) + file_len(&scripts_path);
        self.usage = self.usage.saturating_sub(before) + after;
        self.dirty = false;
        log_store_debug!("Snapshot saved", bytes = after);
        Ok(())
    }
}
