//! Source-to-target ID mapping store.
//!
//! Entries live in memory while a run is in progress and are pushed to a
//! [`MappingBackend`] whenever [`MappingStore::flush`] is called. The batch
//! driver flushes after every batch, which makes each batch a checkpoint.

pub mod file;
pub mod seed;

use crate::core::{MigrateError, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub use file::FileBackend;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Serialized form of the whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingSnapshot {
    pub version: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Entity scope to (source id to target id).
    #[serde(default)]
    pub entities: BTreeMap<String, BTreeMap<String, String>>,
}

impl MappingSnapshot {
    pub fn entry_count(&self) -> usize {
        self.entities.values().map(BTreeMap::len).sum()
    }
}

/// Durable storage for mapping snapshots.
pub trait MappingBackend: Send {
    /// Reads the last persisted snapshot; an empty one if nothing was stored.
    fn load(&self) -> Result<MappingSnapshot>;

    /// Replaces the persisted snapshot.
    fn persist(&mut self, snapshot: &MappingSnapshot) -> Result<()>;

    fn describe(&self) -> String;
}

/// Keeps snapshots in memory only.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    snapshot: Option<MappingSnapshot>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: MappingSnapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
        }
    }
}

impl MappingBackend for MemoryBackend {
    fn load(&self) -> Result<MappingSnapshot> {
        Ok(self.snapshot.clone().unwrap_or_else(|| MappingSnapshot {
            version: SNAPSHOT_VERSION,
            ..MappingSnapshot::default()
        }))
    }

    fn persist(&mut self, snapshot: &MappingSnapshot) -> Result<()> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Entity-scoped source-to-target ID table.
///
/// Re-inserting a source id overwrites the previous target id.
pub struct MappingStore {
    entities: HashMap<String, HashMap<String, String>>,
    backend: Box<dyn MappingBackend>,
    pending: usize,
    flushes: usize,
}

impl std::fmt::Debug for MappingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingStore")
            .field("backend", &self.backend.describe())
            .field("entries", &self.total_len())
            .field("pending", &self.pending)
            .finish()
    }
}

impl MappingStore {
    /// Opens a store, loading whatever the backend already holds.
    pub fn open(backend: impl MappingBackend + 'static) -> Result<Self> {
        let snapshot = backend.load()?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(MigrateError::Serialization(format!(
                "mapping snapshot version {} is newer than supported version {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }

        let entities: HashMap<String, HashMap<String, String>> = snapshot
            .entities
            .into_iter()
            .map(|(scope, pairs)| (scope, pairs.into_iter().collect()))
            .collect();

        let store = Self {
            entities,
            backend: Box::new(backend),
            pending: 0,
            flushes: 0,
        };
        info!(
            "Opened mapping store ({}) with {} entries across {} entities",
            store.backend.describe(),
            store.total_len(),
            store.entities.len()
        );
        Ok(store)
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            entities: HashMap::new(),
            backend: Box::new(MemoryBackend::new()),
            pending: 0,
            flushes: 0,
        }
    }

    /// Opens a JSON-file backed store at `path`.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(FileBackend::new(path))
    }

    /// Records `source_id -> target_id` under `scope`. Returns the previous
    /// target id when the source id was already mapped.
    pub fn insert(&mut self, scope: &str, source_id: &str, target_id: &str) -> Option<String> {
        let previous = self
            .entities
            .entry(scope.to_string())
            .or_default()
            .insert(source_id.to_string(), target_id.to_string());
        if let Some(old) = &previous {
            if old != target_id {
                debug!(
                    "Remapped {} {}: {} -> {}",
                    scope, source_id, old, target_id
                );
            }
        }
        self.pending += 1;
        previous
    }

    pub fn get(&self, scope: &str, source_id: &str) -> Option<&str> {
        self.entities
            .get(scope)
            .and_then(|pairs| pairs.get(source_id))
            .map(String::as_str)
    }

    pub fn contains(&self, scope: &str, source_id: &str) -> bool {
        self.get(scope, source_id).is_some()
    }

    /// Number of entries in one scope.
    pub fn len(&self, scope: &str) -> usize {
        self.entities.get(scope).map_or(0, HashMap::len)
    }

    pub fn total_len(&self) -> usize {
        self.entities.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Scopes with at least one entry, sorted.
    pub fn scopes(&self) -> Vec<&str> {
        let mut scopes: Vec<&str> = self
            .entities
            .iter()
            .filter(|(_, pairs)| !pairs.is_empty())
            .map(|(scope, _)| scope.as_str())
            .collect();
        scopes.sort_unstable();
        scopes
    }

    /// Entries of one scope sorted by source id.
    pub fn entries(&self, scope: &str) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .entities
            .get(scope)
            .map(|pairs| {
                pairs
                    .iter()
                    .map(|(s, t)| (s.as_str(), t.as_str()))
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_unstable();
        entries
    }

    /// Inserts since the last successful flush.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Successful flushes since the store was opened.
    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn snapshot(&self) -> MappingSnapshot {
        MappingSnapshot {
            version: SNAPSHOT_VERSION,
            updated_at: Some(Utc::now()),
            entities: self
                .entities
                .iter()
                .map(|(scope, pairs)| {
                    (
                        scope.clone(),
                        pairs
                            .iter()
                            .map(|(s, t)| (s.clone(), t.clone()))
                            .collect(),
                    )
                })
                .collect(),
        }
    }

    /// Persists pending entries. Returns `false` when there was nothing to write.
    pub fn flush(&mut self) -> Result<bool> {
        if self.pending == 0 {
            return Ok(false);
        }
        let snapshot = self.snapshot();
        self.backend.persist(&snapshot)?;
        debug!(
            "Flushed {} new mappings to {} ({} total)",
            self.pending,
            self.backend.describe(),
            snapshot.entry_count()
        );
        self.pending = 0;
        self.flushes += 1;
        Ok(true)
    }
}
