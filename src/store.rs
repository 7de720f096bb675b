//! Durable enrichment cache keyed by entity id.
//!
//! The whole cache lives in memory behind one lock, and [`EnrichmentStore::merge`] is the only
//! mutation. The on-disk form is a single JSON object mapping qid to record, rewritten by
//! snapshot-and-rename so readers never observe a half-written file.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use crate::entity::{EnrichedEntity, EntityAttributes, Timestamp};
use crate::error::StoreError;
use crate::qid::Qid;

/// Default cache location consumed by the transformation layer.
pub const DEFAULT_CACHE_PATH: &str = "data/wikidata_labels.json";

/// Effect of one merge call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The qid was new and a record was created.
    Inserted,
    /// A newer fetch replaced the stored attributes.
    Updated,
    /// The fetch was not newer than the stored record; nothing changed.
    Unchanged,
}

/// Keyed cache of enriched entities.
pub struct EnrichmentStore {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<Qid, EnrichedEntity>>,
    dirty: AtomicBool,
    // Serializes snapshot writers; they share one temp file.
    flush_lock: Mutex<()>,
}

impl EnrichmentStore {
    /// Creates a store that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        }
    }

    /// Loads the cache at `path`, starting empty only when no file exists.
    ///
    /// A file that exists but cannot be read or validated is an error: proceeding with an empty
    /// cache would refetch everything and regress timestamps on the next flush.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no cache found, starting empty");
                return Ok(Self {
                    path: Some(path),
                    entries: RwLock::new(HashMap::new()),
                    dirty: AtomicBool::new(false),
                    flush_lock: Mutex::new(()),
                });
            }
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        let entries = parse_snapshot(&path, &contents)?;
        tracing::info!(path = %path.display(), entities = entries.len(), "loaded cache");
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        })
    }

    /// Backing file, if persistent.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of cached entities.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the cache holds no entities.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Returns a copy of the record for `qid`.
    pub fn get(&self, qid: &Qid) -> Option<EnrichedEntity> {
        self.read().get(qid).cloned()
    }

    /// Returns when `qid` was last refreshed, without cloning the record.
    pub fn last_updated(&self, qid: &Qid) -> Option<Timestamp> {
        self.read().get(qid).map(|entity| entity.last_updated)
    }

    /// All records sorted by qid.
    pub fn snapshot(&self) -> Vec<EnrichedEntity> {
        let mut records: Vec<_> = self.read().values().cloned().collect();
        records.sort_by(|a, b| a.qid.cmp(&b.qid));
        records
    }

    /// Reconciles one fetch result into the cache.
    ///
    /// Absent qids are inserted with both timestamps set to `fetched_at`. Present qids are
    /// overwritten only when `fetched_at` is strictly newer than `last_updated`; the whole
    /// attribute set is replaced under the write lock, so concurrent merges for one qid cannot
    /// interleave fields.
    pub fn merge(
        &self,
        qid: &Qid,
        attributes: EntityAttributes,
        fetched_at: Timestamp,
    ) -> MergeOutcome {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let outcome = match entries.get_mut(qid) {
            None => {
                entries.insert(
                    qid.clone(),
                    EnrichedEntity::first_fetch(qid.clone(), attributes, fetched_at),
                );
                MergeOutcome::Inserted
            }
            Some(existing) if fetched_at > existing.last_updated => {
                existing.refresh(attributes, fetched_at);
                MergeOutcome::Updated
            }
            Some(_) => MergeOutcome::Unchanged,
        };
        if outcome != MergeOutcome::Unchanged {
            self.dirty.store(true, Ordering::Release);
        }
        outcome
    }

    /// Whether merges happened since the last successful flush.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Persists the cache if it changed since the last flush.
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let _guard = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.write_snapshot(path);
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }

    /// Flushes and releases the store.
    pub fn close(self) -> Result<(), StoreError> {
        self.flush()
    }

    fn write_snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let write_err = |source: std::io::Error| StoreError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let (bytes, count) = self.encode_snapshot()?;
        let tmp_path = tmp_path_for(path);
        let mut file = File::create(&tmp_path).map_err(write_err)?;
        file.write_all(&bytes).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        fs::rename(&tmp_path, path).map_err(write_err)?;
        tracing::debug!(path = %path.display(), entities = count, "flushed cache");
        Ok(())
    }

    // Only serialization happens under the read lock; merges never wait on disk I/O.
    fn encode_snapshot(&self) -> Result<(Vec<u8>, usize), StoreError> {
        let entries = self.read();
        let sorted: BTreeMap<&Qid, &EnrichedEntity> = entries.iter().collect();
        let mut bytes = serde_json::to_vec(&sorted)?;
        bytes.push(b'\n');
        Ok((bytes, sorted.len()))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Qid, EnrichedEntity>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn parse_snapshot(path: &Path, contents: &str) -> Result<HashMap<Qid, EnrichedEntity>, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    if contents.trim().is_empty() {
        return Err(corrupt("file is empty".to_string()));
    }
    let records: HashMap<String, EnrichedEntity> =
        serde_json::from_str(contents).map_err(|err| corrupt(err.to_string()))?;
    let mut entries = HashMap::with_capacity(records.len());
    for (key, entity) in records {
        if key != entity.qid.as_str() {
            return Err(corrupt(format!(
                "key {key} holds record for {}",
                entity.qid
            )));
        }
        if entity.first_seen_ingestion > entity.last_updated {
            return Err(corrupt(format!(
                "{key} was first seen after its last update"
            )));
        }
        entries.insert(entity.qid.clone(), entity);
    }
    Ok(entries)
}
