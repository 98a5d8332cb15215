//! RocksDB-backed [`KeyStore`].
//!
//! Column families:
//! - `forward`: composite key bytes → 16-byte identifier
//! - `reverse`: identifier bytes ++ composite key bytes → empty
//! - `metadata`: storage manifest
//!
//! Forward and reverse entries are always written and removed in one
//! `WriteBatch`. Conditional writes are serialized per key through a striped
//! set of write gates, so unrelated keys commit in parallel.

use crate::model::{CompositeKey, Identifier};
use crate::store::{KeyStore, PutOutcome, StoreError};
use lru::LruCache;
use parking_lot::Mutex;
use rocksdb::{
    checkpoint::Checkpoint, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    DB,
};
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::path::Path;
use tracing::info;

const CF_FORWARD: &str = "forward";
const CF_REVERSE: &str = "reverse";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";

const STORAGE_FORMAT_VERSION: u32 = 1;
const WRITE_GATE_STRIPES: usize = 64;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

#[derive(Debug, Clone, Copy)]
pub struct PersistentOpenOptions {
    pub repair: bool,
    pub cache_capacity: usize,
}

impl Default for PersistentOpenOptions {
    fn default() -> Self {
        Self {
            repair: false,
            cache_capacity: crate::config::DEFAULT_READ_CACHE_CAPACITY,
        }
    }
}

pub struct RocksKeyStore {
    db: DB,
    cache: Mutex<LruCache<CompositeKey, Identifier>>,
    gates: Vec<Mutex<()>>,
}

impl RocksKeyStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, PersistentOpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: PersistentOpenOptions,
    ) -> Result<Self, StoreError> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = open_db(path.as_ref())?;
        validate_or_init_manifest(&db)?;
        info!(path = %path.as_ref().display(), "opened identity store");

        let capacity = NonZeroUsize::new(options.cache_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            db,
            cache: Mutex::new(LruCache::new(capacity)),
            gates: (0..WRITE_GATE_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }

    fn gate(&self, key: &CompositeKey) -> &Mutex<()> {
        let mut hasher = rustc_hash::FxHasher::default();
        key.hash(&mut hasher);
        &self.gates[(hasher.finish() as usize) % self.gates.len()]
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Format(format!("missing column family {name}")))
    }

    fn read_forward(&self, key: &CompositeKey) -> Result<Option<Identifier>, StoreError> {
        let forward = self.cf(CF_FORWARD)?;
        match self.db.get_cf(forward, key.as_bytes())? {
            Some(bytes) => Identifier::from_slice(&bytes)
                .map(Some)
                .ok_or_else(|| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: format!("identifier has {} bytes", bytes.len()),
                }),
            None => Ok(None),
        }
    }
}

impl KeyStore for RocksKeyStore {
    fn get(&self, key: &CompositeKey) -> Result<Option<Identifier>, StoreError> {
        if let Some(id) = self.cache.lock().get(key) {
            return Ok(Some(*id));
        }
        // Fill under the gate so a concurrent delete cannot leave a stale entry.
        let _gate = self.gate(key).lock();
        let found = self.read_forward(key)?;
        if let Some(id) = found {
            self.cache.lock().put(key.clone(), id);
        }
        Ok(found)
    }

    fn put_if_absent(&self, key: &CompositeKey, id: Identifier) -> Result<PutOutcome, StoreError> {
        let _gate = self.gate(key).lock();
        if let Some(existing) = self.read_forward(key)? {
            return Ok(PutOutcome::Existing(existing));
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_FORWARD)?, key.as_bytes(), id.to_bytes());
        batch.put_cf(self.cf(CF_REVERSE)?, encode_reverse(&id, key), b"");
        self.db.write(batch)?;
        self.cache.lock().put(key.clone(), id);
        Ok(PutOutcome::Inserted)
    }

    fn delete_if(&self, key: &CompositeKey, expected: Identifier) -> Result<bool, StoreError> {
        let _gate = self.gate(key).lock();
        if self.read_forward(key)? != Some(expected) {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_FORWARD)?, key.as_bytes());
        batch.delete_cf(self.cf(CF_REVERSE)?, encode_reverse(&expected, key));
        self.cache.lock().pop(key);
        self.db.write(batch)?;
        Ok(true)
    }

    fn keys_for(&self, id: &Identifier) -> Result<BTreeSet<CompositeKey>, StoreError> {
        let reverse = self.cf(CF_REVERSE)?;
        let prefix = id.to_bytes();
        let iter = self
            .db
            .iterator_cf(reverse, IteratorMode::From(&prefix, Direction::Forward));
        let mut keys = BTreeSet::new();
        for entry in iter {
            let (raw, _) = entry?;
            if !raw.starts_with(&prefix) {
                break;
            }
            keys.insert(decode_reverse_key(&raw)?);
        }
        Ok(keys)
    }

    fn len(&self) -> Result<usize, StoreError> {
        let forward = self.cf(CF_FORWARD)?;
        let mut count = 0;
        for entry in self.db.iterator_cf(forward, IteratorMode::Start) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}

impl Drop for RocksKeyStore {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn open_db(path: &Path) -> Result<DB, StoreError> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_FORWARD, Options::default()),
        ColumnFamilyDescriptor::new(CF_REVERSE, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn encode_reverse(id: &Identifier, key: &CompositeKey) -> Vec<u8> {
    let mut raw = Vec::with_capacity(16 + key.as_bytes().len());
    raw.extend_from_slice(&id.to_bytes());
    raw.extend_from_slice(key.as_bytes());
    raw
}

fn decode_reverse_key(raw: &[u8]) -> Result<CompositeKey, StoreError> {
    let corrupt = |reason: &str| StoreError::Corrupt {
        key: String::from_utf8_lossy(raw).into_owned(),
        reason: reason.to_string(),
    };
    if raw.len() <= 16 {
        return Err(corrupt("reverse entry too short"));
    }
    let text = std::str::from_utf8(&raw[16..]).map_err(|_| corrupt("key is not utf-8"))?;
    CompositeKey::from_stored(text).ok_or_else(|| corrupt("empty key"))
}

fn repair_db(path: &Path) -> Result<(), StoreError> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

fn validate_or_init_manifest(db: &DB) -> Result<(), StoreError> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| StoreError::Format("missing metadata column family".to_string()))?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)
            .map_err(|err| StoreError::Format(format!("unreadable manifest: {err}")))?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(StoreError::Format(format!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION, manifest.format_version
            )));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let bytes = bincode::serialize(&manifest)
        .map_err(|err| StoreError::Format(format!("manifest encoding failed: {err}")))?;
    db.put_cf(metadata_cf, KEY_MANIFEST, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(raw: &str) -> CompositeKey {
        CompositeKey::from_stored(raw).unwrap()
    }

    #[test]
    fn persistent_store_round_trip() {
        let dir = tempdir().unwrap();
        let id = Identifier::mint();
        {
            let store = RocksKeyStore::open(dir.path()).unwrap();
            assert_eq!(store.put_if_absent(&key("ds|1"), id).unwrap(), PutOutcome::Inserted);
        }

        let store = RocksKeyStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&key("ds|1")).unwrap(), Some(id));
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(
            store.put_if_absent(&key("ds|1"), Identifier::mint()).unwrap(),
            PutOutcome::Existing(id)
        );
    }

    #[test]
    fn reverse_index_prefix_scan_is_exact() {
        let dir = tempdir().unwrap();
        let store = RocksKeyStore::open(dir.path()).unwrap();
        let a = Identifier::mint();
        let b = Identifier::mint();
        store.put_if_absent(&key("ds|NHM|Birds|1"), a).unwrap();
        store.put_if_absent(&key("ds|occ-1"), a).unwrap();
        store.put_if_absent(&key("ds|occ-2"), b).unwrap();

        let keys_a = store.keys_for(&a).unwrap();
        assert_eq!(keys_a.len(), 2);
        assert!(keys_a.contains(&key("ds|occ-1")));
        assert_eq!(store.keys_for(&b).unwrap().len(), 1);

        assert!(store.delete_if(&key("ds|occ-1"), a).unwrap());
        assert_eq!(store.get(&key("ds|occ-1")).unwrap(), None);
        assert_eq!(store.keys_for(&a).unwrap().len(), 1);
        assert!(!store.delete_if(&key("ds|occ-2"), a).unwrap());
    }

    #[test]
    fn manifest_version_is_checked() {
        let dir = tempdir().unwrap();
        {
            let _store = RocksKeyStore::open(dir.path()).unwrap();
        }
        {
            let db = open_db(dir.path()).unwrap();
            let metadata_cf = db.cf_handle(CF_METADATA).unwrap();
            let manifest = StorageManifest {
                format_version: STORAGE_FORMAT_VERSION + 1,
                app_version: "future".to_string(),
            };
            db.put_cf(metadata_cf, KEY_MANIFEST, bincode::serialize(&manifest).unwrap())
                .unwrap();
        }
        let err = RocksKeyStore::open(dir.path()).err().unwrap();
        assert!(err.to_string().contains("version mismatch"));
    }
}
