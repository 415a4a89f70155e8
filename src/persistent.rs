//! Content-addressed store for partial results
//!
//! Each value lives in its own file named after a hash of its key, so workers never
//! coordinate: two workers only touch the same file when they ran the same unit, and
//! then the last rename wins. Values are bincode encoded `(key, value)` pairs, which
//! keeps NaN and infinities exact.

use crate::dates::to_iso;
use crate::errors::{DatasetError, Result};
use crate::provenance::gather_provenance_info;
use crate::utils::{atomic_write, is_temp_name};
use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Extension of value files
const VALUE_EXTENSION: &str = "bin";

/// Turns the canonical form of a key into a file-name-safe identifier
pub trait KeyHasher: Send + Sync {
    fn id(&self, canonical: &str) -> String;

    /// Name recorded in the store provenance
    fn name(&self) -> &'static str;
}

/// BLAKE3 hex digest of the canonical key
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl KeyHasher for Blake3Hasher {
    fn id(&self, canonical: &str) -> String {
        blake3::hash(canonical.as_bytes()).to_hex().to_string()
    }

    fn name(&self) -> &'static str {
        "blake3"
    }
}

/// Canonical string of a date key: ISO dates joined by commas
pub fn canonical_key(key: &[NaiveDateTime]) -> String {
    key.iter().map(to_iso).collect::<Vec<_>>().join(",")
}

/// Directory of content-addressed values
#[derive(Debug, Clone)]
pub struct PartialStore<H: KeyHasher = Blake3Hasher> {
    dir: PathBuf,
    hasher: H,
}

impl PartialStore<Blake3Hasher> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_hasher(dir, Blake3Hasher)
    }
}

impl<H: KeyHasher> PartialStore<H> {
    /// Format version of the value files
    pub const VERSION: u32 = 3;

    pub fn with_hasher(dir: impl Into<PathBuf>, hasher: H) -> Self {
        Self {
            dir: dir.into(),
            hasher,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn version(&self) -> u32 {
        Self::VERSION
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    /// Create the directory; an existing one is an error unless `exist_ok`
    pub fn create(&self, exist_ok: bool) -> Result<()> {
        if self.dir.exists() && !exist_ok {
            return Err(DatasetError::store(format!(
                "Partial store {} already exists",
                self.dir.display()
            )));
        }
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Remove the whole directory, doing nothing when it does not exist
    pub fn delete(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                info!("Deleted {}", self.dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn value_path(&self, key: &[NaiveDateTime]) -> PathBuf {
        let id = self.hasher.id(&canonical_key(key));
        self.dir.join(format!("{id}.{VALUE_EXTENSION}"))
    }

    /// Store `value` under `key`, replacing (with a warning) what was there
    ///
    /// The store must have been created first.
    pub fn put<V: Serialize>(&self, key: &[NaiveDateTime], value: &V) -> Result<()> {
        if !self.exists() {
            return Err(DatasetError::store(format!(
                "Partial store {} is not initialised, create it before storing records",
                self.dir.display()
            )));
        }
        let path = self.value_path(key);
        if path.exists() {
            warn!(
                "{} already exists for key {}, overwriting it",
                path.display(),
                canonical_key(key)
            );
        }
        let bytes = bincode::serialize(&(key, value))?;
        atomic_write(&path, &bytes)?;
        debug!("Stored {} bytes in {}", bytes.len(), path.display());
        Ok(())
    }

    /// Read back the value stored under `key`, if any
    pub fn get<V: DeserializeOwned>(&self, key: &[NaiveDateTime]) -> Result<Option<V>> {
        let path = self.value_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let (_, value): (Vec<NaiveDateTime>, V) = bincode::deserialize(&fs::read(path)?)?;
        Ok(Some(value))
    }

    /// Lazily read every stored `(key, value)` pair, in no particular order
    ///
    /// Fails with [`DatasetError::NoData`] when nothing has been stored. Orphaned
    /// temporary files and provenance documents are skipped.
    pub fn items<V: DeserializeOwned>(&self) -> Result<Items<V>> {
        let mut files = Vec::new();
        if self.dir.is_dir() {
            for entry in fs::read_dir(&self.dir)? {
                let path = entry?.path();
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                if is_temp_name(name) {
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) == Some(VALUE_EXTENSION) {
                    files.push(path);
                }
            }
        }
        if files.is_empty() {
            return Err(DatasetError::NoData {
                path: self.dir.display().to_string(),
            });
        }
        files.sort();
        Ok(Items {
            files: files.into_iter(),
            _value: PhantomData,
        })
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| {
                        let name = e.file_name();
                        let name = name.to_string_lossy();
                        !is_temp_name(&name) && name.ends_with(&format!(".{VALUE_EXTENSION}"))
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write an environment fingerprint next to the values as `<name>.json`
    pub fn add_provenance(&self, name: &str, extra: JsonValue) -> Result<()> {
        let mut info = gather_provenance_info();
        if let (JsonValue::Object(info), JsonValue::Object(extra)) = (&mut info, extra) {
            info.extend(extra);
            info.insert("hasher".to_string(), JsonValue::from(self.hasher.name()));
            info.insert("store_version".to_string(), JsonValue::from(Self::VERSION));
        }
        let path = self.dir.join(format!("{name}.json"));
        atomic_write(&path, serde_json::to_string_pretty(&info)?.as_bytes())
    }
}

/// Iterator returned by [`PartialStore::items`]
pub struct Items<V> {
    files: std::vec::IntoIter<PathBuf>,
    _value: PhantomData<V>,
}

impl<V: DeserializeOwned> Iterator for Items<V> {
    type Item = Result<(Vec<NaiveDateTime>, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.files.next()?;
        Some(
            fs::read(&path)
                .map_err(DatasetError::from)
                .and_then(|bytes| Ok(bincode::deserialize(&bytes)?)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dates::parse_iso;
    use crate::utils::temp_path_for;
    use tempfile::tempdir;

    fn key(days: &[&str]) -> Vec<NaiveDateTime> {
        days.iter().map(|s| parse_iso(s).unwrap()).collect()
    }

    #[test]
    fn put_and_iterate() {
        let dir = tempdir().unwrap();
        let store = PartialStore::new(dir.path().join("stats"));
        store.create(false).unwrap();
        assert!(matches!(store.items::<f64>(), Err(DatasetError::NoData { .. })));

        store.put(&key(&["2020-01-01"]), &1.5_f64).unwrap();
        store.put(&key(&["2020-01-02", "2020-01-03"]), &f64::NAN).unwrap();
        store.add_provenance("provenance", serde_json::json!({"phase": "test"})).unwrap();

        let mut items: Vec<(Vec<NaiveDateTime>, f64)> =
            store.items().unwrap().collect::<Result<_>>().unwrap();
        items.sort_by_key(|(k, _)| k[0]);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].1, 1.5);
        assert_eq!(items[1].0.len(), 2);
        assert!(items[1].1.is_nan());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn same_key_overwrites() {
        let dir = tempdir().unwrap();
        let store = PartialStore::new(dir.path().join("stats"));
        store.create(false).unwrap();
        let k = key(&["2020-01-01"]);
        store.put(&k, &1_i64).unwrap();
        store.put(&k, &2_i64).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get::<i64>(&k).unwrap(), Some(2));
    }

    #[test]
    fn interrupted_put_is_invisible() {
        let dir = tempdir().unwrap();
        let store = PartialStore::new(dir.path().join("stats"));
        store.create(false).unwrap();
        store.put(&key(&["2020-01-01"]), &1_i64).unwrap();

        // A crash between the write and the rename leaves only the temporary file
        let orphan = temp_path_for(&store.value_path(&key(&["2020-01-02"])));
        fs::write(&orphan, b"partial").unwrap();

        let items: Vec<(Vec<NaiveDateTime>, i64)> = store.items().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(items, vec![(key(&["2020-01-01"]), 1)]);
    }

    #[test]
    fn put_needs_created_store() {
        let dir = tempdir().unwrap();
        let store = PartialStore::new(dir.path().join("stats"));
        match store.put(&key(&["2020-01-01"]), &1_i64) {
            Err(DatasetError::Store(message)) => assert!(message.contains("not initialised")),
            other => panic!("expected a store error, got {other:?}"),
        }
        assert!(!store.exists());

        store.create(false).unwrap();
        store.put(&key(&["2020-01-01"]), &1_i64).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn create_and_delete() {
        let dir = tempdir().unwrap();
        let store = PartialStore::new(dir.path().join("stats"));
        store.delete().unwrap();
        store.create(false).unwrap();
        assert!(store.create(false).is_err());
        store.create(true).unwrap();
        store.delete().unwrap();
        assert!(!store.exists());
    }

    #[test]
    fn hasher_is_pluggable() {
        struct Plain;
        impl KeyHasher for Plain {
            fn id(&self, canonical: &str) -> String {
                canonical.replace([':', ','], "_")
            }
            fn name(&self) -> &'static str {
                "plain"
            }
        }
        let dir = tempdir().unwrap();
        let store = PartialStore::with_hasher(dir.path().join("stats"), Plain);
        store.create(false).unwrap();
        store.put(&key(&["2020-01-01"]), &0_u8).unwrap();
        assert!(dir.path().join("stats/2020-01-01T00_00_00.bin").exists());
    }
}
