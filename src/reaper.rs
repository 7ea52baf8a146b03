use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::lock::MemoryLockService;
use crate::store::{MemoryRecordStore, StoreError};

/// Background task that periodically drops expired lock entries. Expired
/// entries already read as absent; this only reclaims their memory.
pub async fn run_lock_reaper(locks: Arc<MemoryLockService>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        reap_locks(&locks);
    }
}

pub fn reap_locks(locks: &MemoryLockService) -> usize {
    let reaped = locks.purge_expired();
    if reaped > 0 {
        metrics::counter!(crate::observability::LOCKS_REAPED_TOTAL).increment(reaped as u64);
        info!(reaped, "reaped expired locks");
    }
    reaped
}

/// Background task that rewrites the store journal once `threshold`
/// appends have piled up since the last compaction.
pub async fn run_compactor(store: Arc<MemoryRecordStore>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            error!("journal compaction failed: {e}");
        }
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_needed(store: &MemoryRecordStore, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.journal_appends_since_compact().await;
    if appends < threshold {
        debug!(appends, threshold, "compaction skipped");
        return Ok(false);
    }
    store.compact_journal().await?;
    info!(appends, units = store.unit_count(), "journal compacted");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::lock::LockService;
    use crate::model::*;
    use crate::store::VersionedRecordStore;

    fn test_journal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("occupancy_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_purges_only_expired_locks() {
        let locks = MemoryLockService::new();
        locks.cond_set("S1", "w1:a", Duration::from_secs(1)).await.unwrap();
        locks.cond_set("S2", "w2:b", Duration::from_secs(60)).await.unwrap();

        assert_eq!(reap_locks(&locks), 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(reap_locks(&locks), 1);
        assert_eq!(locks.live_count(), 1);
        assert_eq!(locks.get("S2").await.unwrap().as_deref(), Some("w2:b"));
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_task_runs_on_interval() {
        let locks = Arc::new(MemoryLockService::new());
        locks.cond_set("S1", "w1:a", Duration::from_secs(1)).await.unwrap();
        let task = tokio::spawn(run_lock_reaper(locks.clone(), Duration::from_secs(5)));

        tokio::time::sleep(Duration::from_secs(6)).await;
        // The background pass already took it.
        assert_eq!(locks.purge_expired(), 0);
        task.abort();
    }

    #[tokio::test]
    async fn compactor_waits_for_threshold_then_shrinks_journal() {
        let path = test_journal_path("compact.wal");
        let store = MemoryRecordStore::open(path.clone()).unwrap();
        store.register_unit("S1").await.unwrap();
        for i in 0..4 {
            let current = store.read_unit("S1").await.unwrap();
            let record = UnitRecord {
                updated_at: i,
                ..current.record
            };
            store.write_if_version("S1", &current.version, record).await.unwrap();
        }

        assert!(!compact_if_needed(&store, 100).await.unwrap());
        assert_eq!(store.journal_appends_since_compact().await, 5);

        assert!(compact_if_needed(&store, 5).await.unwrap());
        assert_eq!(store.journal_appends_since_compact().await, 0);
        let before = store.read_unit("S1").await.unwrap();
        drop(store);

        let reopened = MemoryRecordStore::open(path).unwrap();
        assert_eq!(reopened.read_unit("S1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn volatile_store_never_compacts() {
        let store = MemoryRecordStore::new();
        store.register_unit("S1").await.unwrap();
        assert!(!compact_if_needed(&store, 1).await.unwrap());
    }
}
