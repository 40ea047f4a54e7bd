//! Session ledger: message id → spreadsheet row number.
//!
//! The ledger is the only durable link between a posted session message and
//! its spreadsheet row. It is loaded once at startup. Every mutation is
//! written to the store before it becomes visible in memory, and a failed
//! write leaves the in-memory map untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use async_lock::Mutex;
use tracing::{debug, info, warn};

/// Serialized form of the ledger.
pub type LedgerMap = BTreeMap<String, u32>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum LedgerError {
    Io { path: PathBuf, source: io::Error },
    Serde(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Io { path, source } => {
                write!(f, "ledger I/O error at {}: {}", path.display(), source)
            }
            LedgerError::Serde(e) => write!(f, "ledger is not a valid JSON object: {}", e),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LedgerError::Io { source, .. } => Some(source),
            LedgerError::Serde(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Where the ledger is persisted.
pub trait LedgerStore: Send + Sync {
    /// Read the whole map. `Ok(None)` means nothing has been stored yet.
    fn read(&self) -> Result<Option<LedgerMap>, LedgerError>;

    /// Replace the stored map with `map`.
    fn write(&self, map: &LedgerMap) -> Result<(), LedgerError>;
}

/// A JSON object file (`{"<message_id>": <row>}`), replaced atomically on
/// every write via a sibling temp file and rename.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl LedgerStore for JsonFileStore {
    fn read(&self) -> Result<Option<LedgerMap>, LedgerError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| LedgerError::Serde(e.to_string()))
    }

    fn write(&self, map: &LedgerMap) -> Result<(), LedgerError> {
        let json = serde_json::to_string(map).map_err(|e| LedgerError::Serde(e.to_string()))?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        fs::write(&tmp, json).map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))
    }
}

/// In-memory store for tests; keeps the last written map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: StdMutex<Option<LedgerMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a previously saved map.
    pub fn with_map(map: LedgerMap) -> Self {
        Self {
            saved: StdMutex::new(Some(map)),
        }
    }

    /// The last map written, if any.
    pub fn saved(&self) -> Option<LedgerMap> {
        self.saved.lock().ok().and_then(|m| m.clone())
    }
}

impl LedgerStore for MemoryStore {
    fn read(&self) -> Result<Option<LedgerMap>, LedgerError> {
        Ok(self.saved())
    }

    fn write(&self, map: &LedgerMap) -> Result<(), LedgerError> {
        if let Ok(mut saved) = self.saved.lock() {
            *saved = Some(map.clone());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SessionLedger
// ---------------------------------------------------------------------------

/// The process-wide ledger of open sessions.
pub struct SessionLedger {
    entries: Mutex<LedgerMap>,
    store: Box<dyn LedgerStore>,
}

impl SessionLedger {
    /// Load the ledger from `store`. A store with nothing in it yields an
    /// empty ledger.
    pub fn load(store: impl LedgerStore + 'static) -> Result<Self, LedgerError> {
        let entries = store.read()?.unwrap_or_default();
        info!(open_sessions = entries.len(), "session ledger loaded");
        Ok(Self {
            entries: Mutex::new(entries),
            store: Box::new(store),
        })
    }

    /// Persist the current map.
    pub async fn save(&self) -> Result<(), LedgerError> {
        let entries = self.entries.lock().await;
        self.persist(&entries)
    }

    fn persist(&self, map: &LedgerMap) -> Result<(), LedgerError> {
        self.store.write(map)?;
        debug!(entries = map.len(), "session ledger saved");
        Ok(())
    }

    /// Persist `next`, and only then make it the in-memory map. On a failed
    /// write the map is left as it was.
    fn commit(&self, entries: &mut LedgerMap, next: LedgerMap) -> Result<(), LedgerError> {
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }

    /// Record the row for a freshly posted session message, then persist.
    pub async fn insert(&self, message_id: &str, row: u32) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().await;
        let mut next = entries.clone();
        if let Some(previous) = next.insert(message_id.to_string(), row) {
            warn!(message_id, previous, row, "ledger entry overwritten");
        }
        self.commit(&mut entries, next)?;
        debug!(message_id, row, "ledger entry inserted");
        Ok(())
    }

    /// Take the row for `message_id` out of the ledger, then persist.
    ///
    /// Returns `Ok(None)` when there is no entry: the session was already
    /// closed or never belonged to this bot.
    pub async fn lookup_and_remove(&self, message_id: &str) -> Result<Option<u32>, LedgerError> {
        let mut entries = self.entries.lock().await;
        let mut next = entries.clone();
        let Some(row) = next.remove(message_id) else {
            return Ok(None);
        };
        self.commit(&mut entries, next)?;
        debug!(message_id, row, "ledger entry removed");
        Ok(Some(row))
    }

    pub async fn get(&self, message_id: &str) -> Option<u32> {
        self.entries.lock().await.get(message_id).copied()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// A copy of every open entry.
    pub async fn snapshot(&self) -> LedgerMap {
        self.entries.lock().await.clone()
    }
}

impl fmt::Debug for SessionLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLedger").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    assert_impl_all!(SessionLedger: Send, Sync);

    fn map(entries: &[(&str, u32)]) -> LedgerMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SessionLedger::load(JsonFileStore::new(dir.path().join("message_ids.json")))
            .unwrap();
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn lookup_and_remove_only_succeeds_once() {
        let ledger = SessionLedger::load(MemoryStore::new()).unwrap();
        ledger.insert("111", 5).await.unwrap();

        assert_eq!(ledger.lookup_and_remove("111").await.unwrap(), Some(5));
        assert_eq!(ledger.lookup_and_remove("111").await.unwrap(), None);
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn every_mutation_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("message_ids.json");
        let ledger = SessionLedger::load(JsonFileStore::new(&path)).unwrap();

        ledger.insert("111", 2).await.unwrap();
        ledger.insert("222", 3).await.unwrap();
        let on_disk: LedgerMap =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, map(&[("111", 2), ("222", 3)]));

        ledger.lookup_and_remove("111").await.unwrap();
        let on_disk: LedgerMap =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, map(&[("222", 3)]));
    }

    #[tokio::test]
    async fn reload_reproduces_last_saved_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("message_ids.json");

        let before = {
            let ledger = SessionLedger::load(JsonFileStore::new(&path)).unwrap();
            ledger.insert("1200000000000000001", 7).await.unwrap();
            ledger.insert("1200000000000000002", 8).await.unwrap();
            ledger.lookup_and_remove("1200000000000000001").await.unwrap();
            ledger.snapshot().await
        };

        let reloaded = SessionLedger::load(JsonFileStore::new(&path)).unwrap();
        assert_eq!(reloaded.snapshot().await, before);
        assert_eq!(reloaded.get("1200000000000000002").await, Some(8));
    }

    #[tokio::test]
    async fn save_rewrites_the_current_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("message_ids.json");
        fs::write(&path, r#"{"111": 2, "222": 3}"#).unwrap();
        let ledger = SessionLedger::load(JsonFileStore::new(&path)).unwrap();

        fs::remove_file(&path).unwrap();
        ledger.save().await.unwrap();

        let on_disk: LedgerMap =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, map(&[("111", 2), ("222", 3)]));
    }

    #[test]
    fn reads_a_plain_json_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("message_ids.json");
        fs::write(&path, r#"{"1199999999999999999": 42}"#).unwrap();

        let loaded = JsonFileStore::new(&path).read().unwrap();
        assert_eq!(loaded, Some(map(&[("1199999999999999999", 42)])));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("message_ids.json");
        fs::write(&path, "[1, 2, 3]").unwrap();

        let err = SessionLedger::load(JsonFileStore::new(&path)).unwrap_err();
        assert!(matches!(err, LedgerError::Serde(_)));
    }

    /// Accepts writes until `fail` is set.
    #[derive(Clone, Default)]
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        fail: Arc<AtomicBool>,
    }

    impl LedgerStore for FlakyStore {
        fn read(&self) -> Result<Option<LedgerMap>, LedgerError> {
            self.inner.read()
        }

        fn write(&self, map: &LedgerMap) -> Result<(), LedgerError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(LedgerError::Io {
                    path: PathBuf::from("message_ids.json"),
                    source: io::Error::new(io::ErrorKind::Other, "disk full"),
                });
            }
            self.inner.write(map)
        }
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_unchanged() {
        let store = FlakyStore::default();
        let ledger = SessionLedger::load(store.clone()).unwrap();
        ledger.insert("111", 2).await.unwrap();

        store.fail.store(true, Ordering::SeqCst);
        assert!(ledger.lookup_and_remove("111").await.is_err());
        assert_eq!(ledger.get("111").await, Some(2));
        assert!(ledger.insert("222", 3).await.is_err());
        assert_eq!(ledger.get("222").await, None);
        assert_eq!(store.inner.saved(), Some(ledger.snapshot().await));

        store.fail.store(false, Ordering::SeqCst);
        assert_eq!(ledger.lookup_and_remove("111").await.unwrap(), Some(2));
        assert_eq!(store.inner.saved(), Some(LedgerMap::new()));
    }

    #[tokio::test]
    async fn overwrite_keeps_latest_row() {
        let store = MemoryStore::with_map(map(&[("9", 1)]));
        let ledger = SessionLedger::load(store).unwrap();
        ledger.insert("9", 4).await.unwrap();
        assert_eq!(ledger.get("9").await, Some(4));
        assert_eq!(ledger.len().await, 1);
    }
}
