use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, info};

use crate::limits::MAX_UNITS;
use crate::model::*;
use crate::wal::{JournalEntry, Wal};

use super::{StoreError, VersionedRecordStore};

#[derive(Debug, Clone)]
struct StoredUnit {
    record: UnitRecord,
    version: VersionToken,
}

type SharedUnit = Arc<RwLock<StoredUnit>>;

enum JournalCommand {
    Append {
        entry: JournalEntry,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        entries: Vec<JournalEntry>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the journal and group-commits appends:
/// take the first append, drain whatever else is already queued, then one
/// fsync for the lot.
async fn journal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            JournalCommand::Append { entry, response } => {
                let mut batch = vec![(entry, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(JournalCommand::Append { entry, response }) => batch.push((entry, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                for (_, tx) in batch {
                    let r = match &result {
                        Ok(()) => Ok(()),
                        Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
                    };
                    let _ = tx.send(r);
                }

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(JournalEntry, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (entry, _) in batch {
        if let Err(e) = wal.append_buffered(entry) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the
    // next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { entries, response } => {
            let result = Wal::write_compact_file(wal.path(), &entries).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        JournalCommand::Append { entry, response } => {
            let result = wal.append_buffered(&entry).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

/// Record store kept in memory, optionally journaled to disk.
///
/// Each unit sits behind its own `RwLock`; a conditional write holds the
/// unit's write lock across the version check, the journal append and the
/// apply, so the check-and-set is atomic per unit.
///
/// Every journaled mutation also holds `journal_gate` for reading, taken
/// before any unit lock. Compaction holds it for writing across snapshot and
/// swap, so no append can land in the old file after the snapshot was taken.
pub struct MemoryRecordStore {
    units: DashMap<UnitId, SharedUnit>,
    journal: Option<mpsc::Sender<JournalCommand>>,
    journal_gate: RwLock<()>,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    /// Volatile store with no journal.
    pub fn new() -> Self {
        Self {
            units: DashMap::new(),
            journal: None,
            journal_gate: RwLock::new(()),
        }
    }

    /// Replay the journal at `path` and keep appending to it. Must be called
    /// inside a tokio runtime.
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let entries = Wal::replay(&path)?;
        let wal = Wal::open(&path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(wal, rx));

        let store = Self {
            units: DashMap::new(),
            journal: Some(tx),
            journal_gate: RwLock::new(()),
        };
        let replayed = entries.len();
        for entry in entries {
            store.apply_replayed(entry);
        }
        info!(path = %path.display(), replayed, units = store.units.len(), "record store journal replayed");
        Ok(store)
    }

    fn apply_replayed(&self, entry: JournalEntry) {
        debug!(unit_id = entry.unit_id(), "replay");
        let (unit_id, stored) = match entry {
            JournalEntry::UnitRegistered { unit_id, version } => (
                unit_id,
                StoredUnit {
                    record: UnitRecord::default(),
                    version,
                },
            ),
            JournalEntry::UnitWritten {
                unit_id,
                version,
                record,
            } => (unit_id, StoredUnit { record, version }),
        };
        self.units.insert(unit_id, Arc::new(RwLock::new(stored)));
    }

    async fn journal_append(&self, entry: JournalEntry) -> Result<(), StoreError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        journal
            .send(JournalCommand::Append { entry, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("journal writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    /// Create an empty unit. Its sub-tasks appear as pending on first read.
    ///
    /// The id is reserved in the map, write-locked, before the journal
    /// append; readers of a unit still being registered wait for the append.
    pub async fn register_unit(&self, unit_id: &str) -> Result<VersionToken, StoreError> {
        let _gate = self.journal_gate.read().await;
        if self.units.len() >= MAX_UNITS {
            return Err(StoreError::LimitExceeded("too many units"));
        }

        let version = VersionToken::mint();
        let unit: SharedUnit = Arc::new(RwLock::new(StoredUnit {
            record: UnitRecord {
                updated_at: now_ms(),
                ..Default::default()
            },
            version: version.clone(),
        }));
        let reservation = unit
            .clone()
            .try_write_owned()
            .map_err(|_| StoreError::Unavailable("fresh unit lock contended".into()))?;
        match self.units.entry(unit_id.to_string()) {
            Entry::Occupied(_) => return Err(StoreError::AlreadyExists(unit_id.to_string())),
            Entry::Vacant(v) => {
                v.insert(unit.clone());
            }
        }

        let appended = self
            .journal_append(JournalEntry::UnitRegistered {
                unit_id: unit_id.to_string(),
                version: version.clone(),
            })
            .await;
        if let Err(e) = appended {
            self.units.remove_if(unit_id, |_, current| Arc::ptr_eq(current, &unit));
            return Err(e);
        }
        drop(reservation);
        Ok(version)
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    fn get_unit(&self, unit_id: &str) -> Option<SharedUnit> {
        self.units.get(unit_id).map(|e| e.value().clone())
    }

    /// False once a failed registration has withdrawn `unit` from the map.
    fn is_live(&self, unit_id: &str, unit: &SharedUnit) -> bool {
        self.units.get(unit_id).is_some_and(|e| Arc::ptr_eq(e.value(), unit))
    }

    /// Rewrite the journal with one entry per unit. Journaled mutations
    /// wait until the new file is in place.
    pub async fn compact_journal(&self) -> Result<(), StoreError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let _gate = self.journal_gate.write().await;
        let shared: Vec<(UnitId, SharedUnit)> = self
            .units
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut entries = Vec::with_capacity(shared.len());
        for (unit_id, unit) in shared {
            let guard = unit.read().await;
            entries.push(JournalEntry::UnitWritten {
                unit_id,
                version: guard.version.clone(),
                record: guard.record.clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        journal
            .send(JournalCommand::Compact { entries, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("journal writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let Some(journal) = &self.journal else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if journal
            .send(JournalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl VersionedRecordStore for MemoryRecordStore {
    async fn read_unit(&self, unit_id: &str) -> Result<VersionedUnit, StoreError> {
        let unit = self
            .get_unit(unit_id)
            .ok_or_else(|| StoreError::NotFound(unit_id.to_string()))?;
        let guard = unit.read().await;
        if !self.is_live(unit_id, &unit) {
            return Err(StoreError::NotFound(unit_id.to_string()));
        }
        Ok(VersionedUnit {
            unit_id: unit_id.to_string(),
            record: guard.record.clone(),
            version: guard.version.clone(),
        })
    }

    async fn write_if_version(
        &self,
        unit_id: &str,
        expected: &VersionToken,
        record: UnitRecord,
    ) -> Result<VersionToken, StoreError> {
        let _gate = self.journal_gate.read().await;
        let unit = self
            .get_unit(unit_id)
            .ok_or_else(|| StoreError::NotFound(unit_id.to_string()))?;
        let mut guard = unit.write().await;
        if !self.is_live(unit_id, &unit) {
            return Err(StoreError::NotFound(unit_id.to_string()));
        }
        if &guard.version != expected {
            return Err(StoreError::VersionMismatch {
                unit_id: unit_id.to_string(),
                expected: expected.clone(),
            });
        }

        let version = VersionToken::mint();
        self.journal_append(JournalEntry::UnitWritten {
            unit_id: unit_id.to_string(),
            version: version.clone(),
            record: record.clone(),
        })
        .await?;
        guard.record = record;
        guard.version = version.clone();
        Ok(version)
    }
}
