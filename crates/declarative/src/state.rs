//! State store - last applied inputs and observed outputs per resource
//!
//! Records are keyed by resource identity. A `put` replaces the previous
//! record for that key and nothing else, so concurrent writers for distinct
//! identities never interfere.

use crate::error::{Error, Result};
use crate::types::PropertyBag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};

/// Current on-disk schema version
pub const STATE_VERSION: u32 = 1;

/// Persisted state of one applied resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Resource identity (matches the declaration)
    #[serde(default)]
    pub id: String,
    /// Type tag the resource was created with
    pub resource_type: String,
    /// Identity assigned by the provider on create
    pub provider_id: String,
    /// Inputs as last applied, references already resolved
    pub inputs: PropertyBag,
    /// Outputs as last observed
    pub outputs: PropertyBag,
    /// Identities this resource depended on when applied
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// When this record was written
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn new(
        id: impl Into<String>,
        resource_type: impl Into<String>,
        provider_id: impl Into<String>,
        inputs: PropertyBag,
        outputs: PropertyBag,
        dependencies: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            provider_id: provider_id.into(),
            inputs,
            outputs,
            dependencies,
            updated_at: Utc::now(),
        }
    }
}

/// Key-value persistence for resource state
pub trait StateStore: Send + Sync {
    /// Last applied record for an identity
    fn get(&self, id: &str) -> Result<Option<StateRecord>>;

    /// Replace the record for `record.id`
    fn put(&self, record: StateRecord) -> Result<()>;

    /// Drop the record for an identity, returning it if present
    fn remove(&self, id: &str) -> Result<Option<StateRecord>>;

    /// All records, ordered by identity
    fn list(&self) -> Result<Vec<StateRecord>>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, StateRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with records
    pub fn with_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, StateRecord>> {
        match self.records.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, StateRecord>> {
        match self.records.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl StateStore for MemoryStore {
    fn get(&self, id: &str) -> Result<Option<StateRecord>> {
        Ok(self.read().get(id).cloned())
    }

    fn put(&self, record: StateRecord) -> Result<()> {
        self.write().insert(record.id.clone(), record);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<Option<StateRecord>> {
        Ok(self.write().remove(id))
    }

    fn list(&self) -> Result<Vec<StateRecord>> {
        Ok(self.read().values().cloned().collect())
    }
}

/// Layout of the state file
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    /// Missing in files written before versioning, read as 0
    #[serde(default)]
    version: u32,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    resources: BTreeMap<String, StateRecord>,
}

/// JSON file store
///
/// The whole document is rewritten on every change, through a temporary
/// file and a rename, so readers never see a partial file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, StateRecord>>,
}

impl FileStore {
    /// Open a state file, starting empty if it does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            log::debug!("State file {} does not exist, starting empty", path.display());
            return Ok(Self {
                path,
                records: Mutex::new(BTreeMap::new()),
            });
        }

        let content = fs::read_to_string(&path)?;
        let file: StateFile = serde_json::from_str(&content)?;

        if file.version > STATE_VERSION {
            return Err(Error::StateVersion {
                found: file.version,
                supported: STATE_VERSION,
            });
        }
        if file.version < STATE_VERSION {
            log::info!(
                "Upgrading state file {} from version {} to {}",
                path.display(),
                file.version,
                STATE_VERSION
            );
        }

        let resources = file
            .resources
            .into_iter()
            .map(|(id, mut record)| {
                // version 0 files did not repeat the key inside the record
                if record.id.is_empty() {
                    record.id.clone_from(&id);
                }
                (id, record)
            })
            .collect();

        log::debug!("Loaded state from {}", path.display());
        Ok(Self {
            path,
            records: Mutex::new(resources),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, StateRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, records: &BTreeMap<String, StateRecord>) -> Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }

        let file = StateFile {
            version: STATE_VERSION,
            last_updated: Some(Utc::now()),
            resources: records.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;

        log::debug!("Saved state to {}", self.path.display());
        Ok(())
    }
}

impl StateStore for FileStore {
    fn get(&self, id: &str) -> Result<Option<StateRecord>> {
        Ok(self.lock().get(id).cloned())
    }

    fn put(&self, record: StateRecord) -> Result<()> {
        let mut records = self.lock();
        log::debug!("state: put {}", record.id);
        let mut next = records.clone();
        next.insert(record.id.clone(), record);
        self.persist(&next)?;
        *records = next;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<Option<StateRecord>> {
        let mut records = self.lock();
        if !records.contains_key(id) {
            return Ok(None);
        }
        log::debug!("state: remove {id}");
        let mut next = records.clone();
        let removed = next.remove(id);
        self.persist(&next)?;
        *records = next;
        Ok(removed)
    }

    fn list(&self) -> Result<Vec<StateRecord>> {
        Ok(self.lock().values().cloned().collect())
    }
}
