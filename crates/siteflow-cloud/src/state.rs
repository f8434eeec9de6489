//! State management for provisioned resources
//!
//! Every node that reached Active (or is being deleted) has a [`StateRecord`]
//! holding the last-applied desired attributes, their hash, and the observed
//! outputs. Writes are compare-and-swap on the record version, so two
//! operations racing on the same node cannot both win.
//!
//! Two stores are provided: [`MemoryStateStore`] and [`FileStateStore`], the
//! latter persisting `.siteflow/state.json`.

use crate::error::{CloudError, Result};
use crate::provider::Outputs;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use siteflow_core::{Reference, ResolvedAttributes, ResourceKind};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

const STATE_VERSION: u32 = 1;
const STATE_DIR: &str = ".siteflow";
const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
const STATE_TEMP: &str = "state.json.tmp";
const LOCK_FILE: &str = "lock.json";

/// Locks older than this are considered abandoned
const LOCK_STALE_AFTER_SECS: i64 = 60;
const LOCK_ATTEMPTS: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Persisted lifecycle status of a recorded node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Active,
    Deleting,
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordStatus::Active => write!(f, "active"),
            RecordStatus::Deleting => write!(f, "deleting"),
        }
    }
}

/// Snapshot of one provisioned node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Resource kind
    pub kind: ResourceKind,

    /// Persisted lifecycle status
    pub status: RecordStatus,

    /// Hash of the resolved desired attributes last applied
    pub desired_hash: String,

    /// Resolved desired attributes last applied
    pub desired: ResolvedAttributes,

    /// Outputs observed from the provider
    pub outputs: Outputs,

    /// Node ids this node depended on when applied
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Compare-and-swap version (assigned by the store)
    pub version: u64,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    pub fn new(
        kind: ResourceKind,
        desired: ResolvedAttributes,
        outputs: Outputs,
        dependencies: Vec<String>,
    ) -> Self {
        Self {
            kind,
            status: RecordStatus::Active,
            desired_hash: hash_attributes(&desired),
            desired,
            outputs,
            dependencies,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = status;
        self
    }

    /// Output value, falling back to the applied attribute of the same name
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name).or_else(|| self.desired.get(name))
    }
}

/// Stable hash of resolved attributes (canonical JSON, sorted keys)
pub fn hash_attributes(attributes: &ResolvedAttributes) -> String {
    let mut hasher = Sha256::new();
    // BTreeMap and serde_json::Map serialize with sorted keys
    hasher.update(serde_json::to_vec(attributes).unwrap_or_default());
    hex::encode(hasher.finalize())
}

/// Full state: versioned collection of records keyed by node id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State file format version
    pub version: u32,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Records indexed by node id
    pub resources: BTreeMap<String, StateRecord>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
        }
    }
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&StateRecord> {
        self.resources.get(id)
    }

    /// Resolve a reference against recorded outputs
    pub fn lookup(&self, reference: &Reference) -> Option<Value> {
        self.resources
            .get(&reference.node)
            .and_then(|r| r.output(&reference.output))
            .cloned()
    }

    /// Add or update a record
    pub fn set_record(&mut self, id: String, record: StateRecord) {
        self.resources.insert(id, record);
        self.updated_at = Utc::now();
    }

    /// Remove a record
    pub fn remove_record(&mut self, id: &str) -> Option<StateRecord> {
        let result = self.resources.remove(id);
        if result.is_some() {
            self.updated_at = Utc::now();
        }
        result
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Compare-and-swap insert; returns the new version
    fn compare_and_put(
        &mut self,
        id: &str,
        mut record: StateRecord,
        expected_version: u64,
    ) -> Result<u64> {
        let actual = self.resources.get(id).map(|r| r.version).unwrap_or(0);
        if actual != expected_version {
            return Err(CloudError::StateConflict {
                node: id.to_string(),
                expected: expected_version,
                actual,
            });
        }
        record.version = expected_version + 1;
        record.updated_at = Utc::now();
        let version = record.version;
        self.set_record(id.to_string(), record);
        Ok(version)
    }

    /// Compare-and-swap removal
    fn compare_and_remove(&mut self, id: &str, expected_version: u64) -> Result<()> {
        let actual = self.resources.get(id).map(|r| r.version).unwrap_or(0);
        if actual != expected_version {
            return Err(CloudError::StateConflict {
                node: id.to_string(),
                expected: expected_version,
                actual,
            });
        }
        self.remove_record(id);
        Ok(())
    }
}

/// Durable record of applied state with optimistic-concurrency writes
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current record of a node
    async fn get(&self, id: &str) -> Result<Option<StateRecord>>;

    /// Write a record if the stored version equals `expected_version`
    /// (0 means "no record yet"). Returns the new version.
    async fn put(&self, id: &str, record: StateRecord, expected_version: u64) -> Result<u64>;

    /// Remove a record if the stored version equals `expected_version`
    async fn remove(&self, id: &str, expected_version: u64) -> Result<()>;

    /// Full state
    async fn snapshot(&self) -> Result<StateSnapshot>;
}

/// In-memory state store
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: RwLock<StateSnapshot>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, id: &str) -> Result<Option<StateRecord>> {
        Ok(self.state.read().await.get(id).cloned())
    }

    async fn put(&self, id: &str, record: StateRecord, expected_version: u64) -> Result<u64> {
        self.state
            .write()
            .await
            .compare_and_put(id, record, expected_version)
    }

    async fn remove(&self, id: &str, expected_version: u64) -> Result<()> {
        self.state
            .write()
            .await
            .compare_and_remove(id, expected_version)
    }

    async fn snapshot(&self) -> Result<StateSnapshot> {
        Ok(self.state.read().await.clone())
    }
}

/// File-backed state store (`<project>/.siteflow/state.json`)
///
/// Each write takes a short-lived lock file so that separate processes
/// serialize their read-modify-write cycles; the version check then decides
/// which writer wins.
pub struct FileStateStore {
    /// Project root directory
    project_root: PathBuf,

    /// Serializes writers inside this process
    write_guard: Mutex<()>,
}

impl FileStateStore {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
            write_guard: Mutex::new(()),
        }
    }

    /// Get the state directory path
    fn state_dir(&self) -> PathBuf {
        self.project_root.join(STATE_DIR)
    }

    /// Get the state file path
    pub fn state_path(&self) -> PathBuf {
        self.state_dir().join(STATE_FILE)
    }

    /// Get the backup file path
    fn backup_path(&self) -> PathBuf {
        self.state_dir().join(STATE_BACKUP)
    }

    /// Get the path new state is written to before it replaces the file
    fn temp_path(&self) -> PathBuf {
        self.state_dir().join(STATE_TEMP)
    }

    /// Get the lock file path
    fn lock_path(&self) -> PathBuf {
        self.state_dir().join(LOCK_FILE)
    }

    /// Ensure the state directory exists
    async fn ensure_state_dir(&self) -> Result<()> {
        let dir = self.state_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
            tracing::debug!("Created state directory: {}", dir.display());
        }
        Ok(())
    }

    /// Load the current state
    pub async fn load(&self) -> Result<StateSnapshot> {
        let path = self.state_path();
        if !path.exists() {
            tracing::debug!("State file not found, returning empty state");
            return Ok(StateSnapshot::new());
        }

        let content = fs::read_to_string(&path).await?;
        let state: StateSnapshot = serde_json::from_str(&content)?;

        // Version check
        if state.version > STATE_VERSION {
            return Err(CloudError::StateError(format!(
                "State file version {} is newer than supported version {}",
                state.version, STATE_VERSION
            )));
        }

        tracing::debug!("Loaded state with {} resources", state.resources.len());
        Ok(state)
    }

    /// Save the state
    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        self.ensure_state_dir().await?;

        let path = self.state_path();
        let temp = self.temp_path();

        // state.json is only ever replaced by a complete file
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&temp, content).await?;

        if path.exists() {
            fs::copy(&path, self.backup_path()).await?;
        }
        fs::rename(&temp, &path).await?;

        tracing::debug!("Saved state with {} resources", state.resources.len());
        Ok(())
    }

    /// Acquire the lock file for one read-modify-write cycle
    async fn acquire_lock(&self) -> Result<StateLock> {
        self.ensure_state_dir().await?;
        let lock_path = self.lock_path();

        for _ in 0..LOCK_ATTEMPTS {
            let lock_info = LockInfo {
                holder: std::env::var("HOSTNAME")
                    .or_else(|_| std::env::var("HOST"))
                    .unwrap_or_else(|_| "unknown".to_string()),
                pid: std::process::id(),
                acquired_at: Utc::now(),
            };

            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(_) => {
                    let content = serde_json::to_string_pretty(&lock_info)?;
                    fs::write(&lock_path, content).await?;
                    return Ok(StateLock {
                        lock_path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.remove_stale_lock(&lock_path).await? {
                        continue;
                    }
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CloudError::LockError(format!(
            "State is locked: {}",
            lock_path.display()
        )))
    }

    /// Remove a lock left behind by a crashed process
    async fn remove_stale_lock(&self, lock_path: &Path) -> Result<bool> {
        let Ok(content) = fs::read_to_string(lock_path).await else {
            return Ok(false);
        };
        // The holder may not have written its info yet
        let Ok(lock_info) = serde_json::from_str::<LockInfo>(&content) else {
            return Ok(false);
        };

        let age = Utc::now().signed_duration_since(lock_info.acquired_at);
        if age.num_seconds() < LOCK_STALE_AFTER_SECS {
            return Ok(false);
        }

        tracing::warn!(
            "Removing stale lock from {} (pid {})",
            lock_info.holder,
            lock_info.pid
        );
        match fs::remove_file(lock_path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn modify<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StateSnapshot) -> Result<T>,
    {
        let _guard = self.write_guard.lock().await;
        let lock = self.acquire_lock().await?;

        let mut state = self.load().await?;
        let result = f(&mut state);
        if result.is_ok() {
            self.save(&state).await?;
        }

        lock.release().await?;
        result
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, id: &str) -> Result<Option<StateRecord>> {
        Ok(self.load().await?.get(id).cloned())
    }

    async fn put(&self, id: &str, record: StateRecord, expected_version: u64) -> Result<u64> {
        self.modify(|state| state.compare_and_put(id, record, expected_version))
            .await
    }

    async fn remove(&self, id: &str, expected_version: u64) -> Result<()> {
        self.modify(|state| state.compare_and_remove(id, expected_version))
            .await
    }

    async fn snapshot(&self) -> Result<StateSnapshot> {
        self.load().await
    }
}

/// Lock information
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// RAII guard for state lock
struct StateLock {
    lock_path: PathBuf,
    released: bool,
}

impl StateLock {
    /// Release the lock
    async fn release(mut self) -> Result<()> {
        if !self.released {
            if self.lock_path.exists() {
                fs::remove_file(&self.lock_path).await?;
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released && self.lock_path.exists() {
            // Synchronous cleanup in drop - not ideal but necessary
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}
