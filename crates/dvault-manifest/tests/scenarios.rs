//! End-to-end store behaviour: dedup, compaction, GC and deletion.

use dvault_cas::{chunk_size_for, strong_hash, weak_hash};
use dvault_manifest::{Committed, Store, StoreError, StoreOptions, UploadOutcome};
use tempfile::TempDir;

fn open(temp: &TempDir, script_limit: usize) -> Store {
    let options = StoreOptions {
        script_limit,
        ..StoreOptions::default()
    };
    Store::open(temp.path(), options).unwrap()
}

fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

fn committed(outcome: UploadOutcome) -> Committed {
    match outcome {
        UploadOutcome::Committed(c) => c,
        UploadOutcome::Unchanged => panic!("upload reported unchanged"),
    }
}

fn all_versions(store: &Store, path: &str) -> Vec<Vec<u8>> {
    let count = store.versions(path).unwrap().len();
    (0..count)
        .map(|i| store.read_version(path, Some(i)).unwrap())
        .collect()
}

#[test]
fn test_first_upload_creates_blocks_and_repeat_is_noop() {
    let temp = TempDir::new().unwrap();
    let mut store = open(&temp, 2);

    let c = committed(store.ingest("/abc", b"AAAABBBBCCCC", 4).unwrap());
    assert!(!c.is_script);

    let db = store.database();
    assert_eq!(db.block_count(), 3);
    for piece in [b"AAAA", b"BBBB", b"CCCC"] {
        let id = db
            .find(weak_hash(piece, 4), &strong_hash(piece, 4), 4)
            .expect("block stored");
        assert_eq!(db.block(id).unwrap().refs, 1);
    }

    assert_eq!(
        store.ingest("/abc", b"AAAABBBBCCCC", 4).unwrap(),
        UploadOutcome::Unchanged
    );
    assert_eq!(store.versions("/abc").unwrap().len(), 1);
    assert_eq!(store.database().block_count(), 3);
}

#[test]
fn test_one_byte_change_is_stored_as_script() {
    let temp = TempDir::new().unwrap();
    let mut store = open(&temp, 2);

    store.ingest("/f", b"AAAABBBB", 4).unwrap();
    let c = committed(store.ingest("/f", b"AAAABBBX", 4).unwrap());
    assert!(c.is_script);
    assert_eq!(store.read_version("/f", Some(1)).unwrap(), b"AAAABBBX");
}

#[test]
fn test_script_limit_forces_blocks() {
    let temp = TempDir::new().unwrap();
    let mut store = open(&temp, 1);

    store.ingest("/f", b"AAAABBBBCCCC", 4).unwrap();
    assert!(committed(store.ingest("/f", b"AAAABBBBCCCX", 4).unwrap()).is_script);
    assert!(!committed(store.ingest("/f", b"AAAABBBBCCXX", 4).unwrap()).is_script);
    // The chain restarts after the new block-form version.
    assert!(committed(store.ingest("/f", b"AAAABBBBCXXX", 4).unwrap()).is_script);

    for (i, expected) in [
        &b"AAAABBBBCCCC"[..],
        b"AAAABBBBCCCX",
        b"AAAABBBBCCXX",
        b"AAAABBBBCXXX",
    ]
    .iter()
    .enumerate()
    {
        assert_eq!(store.read_version("/f", Some(i)).unwrap(), *expected);
    }
    assert!(store.verify().unwrap().is_clean());
}

#[test]
fn test_expanding_a_script_keeps_every_version_readable() {
    let temp = TempDir::new().unwrap();
    let mut store = open(&temp, 3);

    let base = pseudo_random(2000, 9);
    let mut history = vec![base.clone()];
    for (i, at) in [100usize, 900, 1500].iter().enumerate() {
        let mut next = history[history.len() - 1].clone();
        next[*at] ^= 0xFF;
        next.insert(*at + 1, i as u8);
        history.push(next);
    }
    for data in &history {
        store.ingest("/doc", data, 64).unwrap();
    }
    let forms: Vec<bool> = store
        .versions("/doc")
        .unwrap()
        .iter()
        .map(|v| v.is_script)
        .collect();
    assert_eq!(forms, vec![false, true, true, true]);

    let file = store.database().find_file("/doc").unwrap();
    store.script_to_blocks(file, 1).unwrap();

    assert_eq!(all_versions(&store, "/doc"), history);
    assert!(!store.versions("/doc").unwrap()[1].is_script);
    assert!(store.verify().unwrap().is_clean());
}

#[test]
fn test_space_pressure_triggers_gc() {
    let temp = TempDir::new().unwrap();
    let mut store = open(&temp, 0);

    let old = pseudo_random(4000, 1);
    let newer = pseudo_random(4000, 2);
    let chunk = chunk_size_for(4000);
    store.ingest("/old", &old, chunk).unwrap();
    store.ingest("/old", &newer, chunk).unwrap();
    store.save().unwrap();

    store.refresh_usage().unwrap();
    let used = store.status().unwrap().used_bytes;
    store.options_mut().reserved_capacity = used + 300;

    let fresh = pseudo_random(3000, 3);
    store.ingest("/new", &fresh, chunk_size_for(3000)).unwrap();

    assert_eq!(store.versions("/old").unwrap().len(), 1);
    assert_eq!(store.read_version("/old", None).unwrap(), newer);
    assert_eq!(store.read_version("/new", None).unwrap(), fresh);
    assert!(store.available_space() > 0);
    assert!(store.verify().unwrap().is_clean());
}

#[test]
fn test_space_exhaustion_is_reported() {
    let temp = TempDir::new().unwrap();
    let mut store = open(&temp, 0);

    let only = pseudo_random(4000, 4);
    store.ingest("/only", &only, chunk_size_for(4000)).unwrap();
    store.save().unwrap();
    store.refresh_usage().unwrap();
    let used = store.status().unwrap().used_bytes;
    store.options_mut().reserved_capacity = used + 100;

    let err = store
        .ingest("/new", &pseudo_random(3000, 5), chunk_size_for(3000))
        .unwrap_err();
    assert!(matches!(err, StoreError::NotEnoughSpaceOnDisc { .. }));

    // Nothing was lost and the failed upload left no session behind.
    assert_eq!(store.read_version("/only", None).unwrap(), only);
    assert_eq!(store.status().unwrap().open_uploads, 0);
    assert!(store.database().find_file("/new").is_none());
}

#[test]
fn test_deleting_last_version_is_refused() {
    let temp = TempDir::new().unwrap();
    let mut store = open(&temp, 2);
    store.ingest("/solo", b"lonely bytes", 4).unwrap();

    assert!(matches!(
        store.delete_version("/solo", 0),
        Err(StoreError::TooFewVersions(_))
    ));
    assert_eq!(store.versions("/solo").unwrap().len(), 1);
    assert_eq!(store.read_version("/solo", None).unwrap(), b"lonely bytes");
}

#[test]
fn test_roundtrip_across_sizes_and_chunks() {
    let temp = TempDir::new().unwrap();
    let mut store = open(&temp, 2);

    for (i, len) in [0usize, 1, 3, 4, 5, 255, 256, 257, 1000, 5000].iter().enumerate() {
        for chunk in [1usize, 4, 64, 256] {
            let data = pseudo_random(*len, (i * 31 + chunk) as u64);
            let path = format!("/rt/{}-{}", len, chunk);
            store.ingest(&path, &data, chunk).unwrap();
            assert_eq!(store.read_version(&path, None).unwrap(), data, "{}", path);
        }
    }
    assert!(store.verify().unwrap().is_clean());
}

#[test]
fn test_invariants_hold_over_mixed_operations() {
    let temp = TempDir::new().unwrap();
    let mut store = open(&temp, 2);
    let mut state = 42u64;
    let mut next = move |bound: u64| {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 33) % bound
    };

    let mut contents: Vec<Vec<u8>> = (0..3).map(|i| pseudo_random(600, 100 + i)).collect();
    let paths = ["/m/a", "/m/b", "/m/c"];

    for step in 0..60 {
        let which = next(3) as usize;
        let path = paths[which];
        match next(10) {
            0..=5 => {
                // Small edit at a random spot.
                let data = &mut contents[which];
                let at = next(data.len() as u64) as usize;
                let value = next(256) as u8;
                match next(3) {
                    0 => data[at] = value,
                    1 => data.insert(at, value),
                    _ => {
                        data.remove(at);
                    }
                }
                store.ingest(path, data, 64).unwrap();
            }
            6 | 7 => {
                // Older versions only, so the latest content stays put.
                if let Ok(versions) = store.versions(path) {
                    let index = next(versions.len() as u64) as usize;
                    if index + 1 == versions.len() {
                        continue;
                    }
                    match store.delete_version(path, index) {
                        Ok(()) | Err(StoreError::TooFewVersions(_)) => {}
                        Err(e) => panic!("step {}: {}", step, e),
                    }
                }
            }
            8 => {
                // Cascading removal may take trailing scripts with it.
                store.reclaim_once().unwrap();
                for (i, p) in paths.iter().enumerate() {
                    if store.database().find_file(p).is_some() {
                        contents[i] = store.read_version(p, None).unwrap();
                    }
                }
            }
            _ => {
                if let Some(file) = store.database().find_file(path) {
                    let count = store.database().file(file).unwrap().versions.len();
                    let index = next(count as u64) as usize;
                    let before = all_versions(&store, path);
                    store.script_to_blocks(file, index).unwrap();
                    assert_eq!(all_versions(&store, path), before, "step {}", step);
                }
            }
        }

        let report = store.verify().unwrap();
        assert!(report.is_clean(), "step {}: {:?}", step, report);
        if store.database().find_file(path).is_some() {
            assert_eq!(store.read_version(path, None).unwrap(), contents[which], "step {}", step);
        }
    }
}
