//! Durable storage of running sessions.
//!
//! One record per shaped device: its address, the serialized session and the absolute
//! expiry. Stores are synchronous; the persistence worker calls them off the runtime.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{error::StoreError, types::ShapingSession};

/// The durable mirror of one live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    /// Controlled IP, the record key.
    pub ip: String,
    /// The session, serialized as JSON.
    pub session: String,
    /// Unix time at which the session expires.
    pub timeout: u64,
}

impl PersistedRecord {
    /// Serializes `session`, expiring at unix time `timeout`.
    pub fn new(session: &ShapingSession, timeout: u64) -> Result<Self, serde_json::Error> {
        Ok(Self {
            ip: session.device.controlled_ip.clone(),
            session: serde_json::to_string(session)?,
            timeout,
        })
    }

    /// Deserializes the stored session.
    pub fn decode(&self) -> Result<ShapingSession, serde_json::Error> {
        serde_json::from_str(&self.session)
    }
}

/// Where sessions are persisted.
pub trait Store: Send + Sync + 'static {
    /// Every record, in no particular order.
    fn saved_shapings(&self) -> Result<Vec<PersistedRecord>, StoreError>;

    /// Inserts or replaces the record for `record.ip`.
    fn upsert(&self, record: PersistedRecord) -> Result<(), StoreError>;

    /// Deletes the record for `ip`, if any.
    fn remove(&self, ip: &str) -> Result<(), StoreError>;
}

/// An in-process store, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, PersistedRecord>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn saved_shapings(&self) -> Result<Vec<PersistedRecord>, StoreError> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn upsert(&self, record: PersistedRecord) -> Result<(), StoreError> {
        self.records.lock().insert(record.ip.clone(), record);
        Ok(())
    }

    fn remove(&self, ip: &str) -> Result<(), StoreError> {
        self.records.lock().remove(ip);
        Ok(())
    }
}

/// A store kept in a single JSON file.
///
/// Every change rewrites the whole file through a temporary file in the same directory
/// followed by a rename, so a crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Opens the store at `path`, creating its parent directory. The file itself is created
    /// on the first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path, lock: Mutex::new(()) })
    }

    /// Location of the JSON file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, PersistedRecord>, StoreError> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if contents.is_empty() {
            return Ok(BTreeMap::new());
        }

        let records: Vec<PersistedRecord> = serde_json::from_slice(&contents)?;
        Ok(records.into_iter().map(|r| (r.ip.clone(), r)).collect())
    }

    fn save(&self, records: &BTreeMap<String, PersistedRecord>) -> Result<(), StoreError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let body = serde_json::to_vec_pretty(&records.values().collect::<Vec<_>>())?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn modify(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, PersistedRecord>),
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut records = self.load()?;
        f(&mut records);
        self.save(&records)
    }
}

impl Store for JsonFileStore {
    fn saved_shapings(&self) -> Result<Vec<PersistedRecord>, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.load()?.into_values().collect())
    }

    fn upsert(&self, record: PersistedRecord) -> Result<(), StoreError> {
        self.modify(|records| {
            records.insert(record.ip.clone(), record);
        })
    }

    fn remove(&self, ip: &str) -> Result<(), StoreError> {
        self.modify(|records| {
            records.remove(ip);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Device, Settings};

    fn record(ip: &str, timeout: u64) -> PersistedRecord {
        let session = ShapingSession {
            device: Device::itself(ip),
            settings: Settings::default(),
            timeout: 30,
        };
        PersistedRecord::new(&session, timeout).unwrap()
    }

    #[test]
    fn record_roundtrips_session() {
        let rec = record("10.0.0.1", 1_000);
        assert_eq!(rec.ip, "10.0.0.1");
        assert_eq!(rec.decode().unwrap().device, Device::itself("10.0.0.1"));
    }

    #[test]
    fn memory_store_upserts_by_ip() {
        let store = MemoryStore::new();
        store.upsert(record("10.0.0.1", 1)).unwrap();
        store.upsert(record("10.0.0.1", 2)).unwrap();
        store.upsert(record("10.0.0.2", 3)).unwrap();

        let saved = store.saved_shapings().unwrap();
        assert_eq!(saved, vec![record("10.0.0.1", 2), record("10.0.0.2", 3)]);

        store.remove("10.0.0.1").unwrap();
        store.remove("10.0.0.9").unwrap();
        assert_eq!(store.saved_shapings().unwrap(), vec![record("10.0.0.2", 3)]);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("shapings.json");

        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.saved_shapings().unwrap().is_empty());

        store.upsert(record("10.0.0.1", 10)).unwrap();
        store.upsert(record("10.0.0.2", 20)).unwrap();
        store.remove("10.0.0.1").unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.saved_shapings().unwrap(), vec![record("10.0.0.2", 20)]);
        assert!(!dir.path().join("nested").join("shapings.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shapings.json");
        fs::write(&path, b"{not json").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert!(matches!(store.saved_shapings(), Err(StoreError::Serde(_))));
    }
}
