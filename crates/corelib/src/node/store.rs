//! Persistence of the local instance identity.
//!
//! The instance id must survive restarts, and every start must produce a
//! session that is strictly newer than the previous one. Both are kept in a
//! small [`KeyValueStore`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{InstanceId, InstanceSessionId};
use crate::error::{Error, Result};

/// Store key of the persisted instance id.
pub const INSTANCE_ID_KEY: &str = "node.instanceId";
/// Store key of the last used session generation.
pub const SESSION_GENERATION_KEY: &str = "node.sessionGeneration";

/// A persistent string key/value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
}

/// Store that lives only as long as the process; for tests and simulations.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Store backed by a single JSON object on disk.
///
/// Writes go to a sibling temp file that is then renamed over the store
/// file; readers never observe a partially written document.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    // serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(Error::Storage(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let content = serde_json::to_string_pretty(entries)?;
        let temp = self.path.with_extension("tmp");
        fs::write(&temp, content)
            .and_then(|_| fs::rename(&temp, &self.path))
            .map_err(|e| Error::Storage(format!("failed to write {}: {}", self.path.display(), e)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self.load()?.remove(key))
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut entries = self.load()?;
        entries.insert(key.to_owned(), value.to_owned());
        self.save(&entries)
    }
}

/// The identity of the running process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalIdentity {
    session: InstanceSessionId,
    first_start: bool,
}

impl LocalIdentity {
    /// Load (or create) the persistent instance id and start a new session.
    ///
    /// The session generation stored in `store` is incremented and written
    /// back before the session id is returned.
    pub fn bootstrap(store: &dyn KeyValueStore) -> Result<Self> {
        let (instance, first_start) = match store.get(INSTANCE_ID_KEY)? {
            Some(stored) => (InstanceId::parse(stored.trim())?, false),
            None => {
                let generated = InstanceId::generate();
                store.put(INSTANCE_ID_KEY, generated.as_str())?;
                info!(instance = %generated, "Generated new persistent instance id");
                (generated, true)
            }
        };

        let previous = match store.get(SESSION_GENERATION_KEY)? {
            Some(raw) => raw.trim().parse::<u32>().map_err(|e| {
                Error::Storage(format!("invalid stored session generation '{}': {}", raw, e))
            })?,
            None => 0,
        };
        let generation = previous.saturating_add(1);
        let session = InstanceSessionId::new(&instance, generation)?;
        store.put(SESSION_GENERATION_KEY, &generation.to_string())?;
        debug!(session = %session, generation, "Started new instance session");

        Ok(Self {
            session,
            first_start,
        })
    }

    pub fn session(&self) -> &InstanceSessionId {
        &self.session
    }

    pub fn instance_id(&self) -> InstanceId {
        self.session.instance_id()
    }

    /// True if the instance id was generated during this bootstrap.
    pub fn is_first_start(&self) -> bool {
        self.first_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Freshness;

    #[test]
    fn test_bootstrap_keeps_instance_and_advances_session() {
        let store = MemoryStore::new();
        let first = LocalIdentity::bootstrap(&store).unwrap();
        let second = LocalIdentity::bootstrap(&store).unwrap();

        assert!(first.is_first_start());
        assert!(!second.is_first_start());
        assert_eq!(first.instance_id(), second.instance_id());
        assert_eq!(
            second.session().freshness_against(first.session()),
            Freshness::Newer
        );
    }

    #[test]
    fn test_bootstrap_rejects_corrupt_instance_id() {
        let store = MemoryStore::new();
        store.put(INSTANCE_ID_KEY, "not-an-id").unwrap();
        assert!(matches!(
            LocalIdentity::bootstrap(&store),
            Err(Error::MalformedIdentifier(_))
        ));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let first = LocalIdentity::bootstrap(&FileStore::new(&path)).unwrap();
        let second = LocalIdentity::bootstrap(&FileStore::new(&path)).unwrap();

        assert_eq!(first.instance_id(), second.instance_id());
        assert_eq!(second.session().generation(), first.session().generation() + 1);
    }
}
