use std::sync::Arc;

use serde_json::json;

use crate::coordination::{AggregateStats, CoordError, Coordinator};
use crate::models::PersistedRecord;
use crate::state::{run_blocking, RecordStore};

/// Result of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Written { records: usize, found: usize },
    /// The record store rejected the batch; the buffer is kept for the next flush.
    Retained { buffered: usize },
}

/// Buffers records for one worker and writes them in bulk.
pub struct BatchPersister {
    records: Arc<dyn RecordStore>,
    coordinator: Coordinator,
    worker_id: String,
    base_url: String,
    buffer: Vec<PersistedRecord>,
}

impl BatchPersister {
    pub fn new(
        records: Arc<dyn RecordStore>,
        coordinator: Coordinator,
        worker_id: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            records,
            coordinator,
            worker_id: worker_id.into(),
            base_url: base_url.into(),
            buffer: Vec::new(),
        }
    }

    pub fn accumulate(&mut self, record: PersistedRecord) {
        self.buffer.push(record);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Upsert the buffer, then publish counters and the recent ring.
    ///
    /// Record-store failures are logged and the buffer is kept. A coordination error
    /// after a successful write is returned to the caller.
    pub async fn flush(&mut self, recent_limit: usize) -> Result<FlushOutcome, CoordError> {
        if self.buffer.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        let pending = self.buffer.clone();
        let stored =
            run_blocking(&self.records, move |records| records.upsert_batch(&pending)).await;
        if let Err(e) = stored {
            tracing::error!(
                worker = %self.worker_id,
                buffered = self.buffer.len(),
                "Bulk write failed, keeping buffer: {}",
                e
            );
            return Ok(FlushOutcome::Retained {
                buffered: self.buffer.len(),
            });
        }

        let written = std::mem::take(&mut self.buffer);
        let mut delta = AggregateStats::default();
        let mut recent = Vec::new();
        for record in &written {
            if let Some(found) = record.as_found() {
                delta.found += 1;
                if found.profile.is_support {
                    delta.support += 1;
                }
                if found.profile.is_banned {
                    delta.banned += 1;
                }
                let mut entry = match serde_json::to_value(found) {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!(id = found.profile.id, "Skipping recent entry: {}", e);
                        continue;
                    }
                };
                if let Some(fields) = entry.as_object_mut() {
                    fields.insert(
                        "url".to_string(),
                        json!(format!("{}{}/", self.base_url, found.profile.id)),
                    );
                }
                recent.push(entry.to_string());
            }
        }

        tracing::info!(
            worker = %self.worker_id,
            records = written.len(),
            found = delta.found,
            "Saved batch"
        );

        self.coordinator.record_stats(delta).await?;
        self.coordinator.push_recent(&recent, recent_limit).await?;

        Ok(FlushOutcome::Written {
            records: written.len(),
            found: delta.found as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;
    use crate::models::{Profile, ProfileRecord};
    use crate::state::{ProfileFlag, RecordCounts, RedbRecordStore, StateError};
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn profile(id: u64, support: bool, banned: bool) -> Profile {
        Profile {
            id,
            nickname: format!("user{}", id),
            registered_at: String::new(),
            rating: Some(5.0),
            review_count: 1,
            lot_count: 0,
            is_banned: banned,
            is_support: support,
            scraped_at: Utc::now(),
        }
    }

    /// Fails every write while `failing` is set.
    struct FlakyStore {
        inner: RedbRecordStore,
        failing: AtomicBool,
    }

    impl RecordStore for FlakyStore {
        fn upsert_batch(&self, records: &[PersistedRecord]) -> Result<usize, StateError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StateError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk gone",
                )));
            }
            self.inner.upsert_batch(records)
        }
        fn get(&self, id: u64) -> Result<Option<PersistedRecord>, StateError> {
            self.inner.get(id)
        }
        fn find_by_nickname(&self, nickname: &str) -> Result<Vec<ProfileRecord>, StateError> {
            self.inner.find_by_nickname(nickname)
        }
        fn find_by_flag(&self, flag: ProfileFlag) -> Result<Vec<u64>, StateError> {
            self.inner.find_by_flag(flag)
        }
        fn ids_in_range(&self, start: u64, end: u64) -> Result<Vec<u64>, StateError> {
            self.inner.ids_in_range(start, end)
        }
        fn max_found_id(&self) -> Result<Option<u64>, StateError> {
            self.inner.max_found_id()
        }
        fn count(&self) -> Result<RecordCounts, StateError> {
            self.inner.count()
        }
        fn ensure_indexes(&self) -> Result<bool, StateError> {
            self.inner.ensure_indexes()
        }
    }

    #[tokio::test]
    async fn test_flush_writes_and_publishes() {
        let dir = TempDir::new().unwrap();
        let records: Arc<dyn RecordStore> = Arc::new(RedbRecordStore::new(dir.path()).unwrap());
        let coord = Coordinator::new(Arc::new(MemoryStore::new()));
        let mut persister =
            BatchPersister::new(records.clone(), coord.clone(), "w1", "https://example.test/users/");

        assert_eq!(persister.flush(10).await.unwrap(), FlushOutcome::Empty);

        persister.accumulate(PersistedRecord::found(profile(1, true, false), "w1"));
        persister.accumulate(PersistedRecord::found(profile(2, false, true), "w1"));
        persister.accumulate(PersistedRecord::tombstone(3, "w1"));
        assert_eq!(persister.len(), 3);

        assert_eq!(
            persister.flush(10).await.unwrap(),
            FlushOutcome::Written {
                records: 3,
                found: 2
            }
        );
        assert!(persister.is_empty());
        assert_eq!(records.count().unwrap(), RecordCounts { found: 2, not_found: 1 });

        let stats = coord.aggregate_stats().await.unwrap();
        assert_eq!(stats, AggregateStats { found: 2, support: 1, banned: 1 });

        let recent = coord.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        let newest: serde_json::Value = serde_json::from_str(&recent[0]).unwrap();
        assert_eq!(newest["id"], 2);
        assert_eq!(newest["url"], "https://example.test/users/2/");
    }

    #[tokio::test]
    async fn test_recent_ring_is_trimmed() {
        let dir = TempDir::new().unwrap();
        let records: Arc<dyn RecordStore> = Arc::new(RedbRecordStore::new(dir.path()).unwrap());
        let coord = Coordinator::new(Arc::new(MemoryStore::new()));
        let mut persister = BatchPersister::new(records, coord.clone(), "w1", "u/");

        for id in 1..=5 {
            persister.accumulate(PersistedRecord::found(profile(id, false, false), "w1"));
        }
        persister.flush(3).await.unwrap();
        assert_eq!(coord.recent(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_buffer() {
        let dir = TempDir::new().unwrap();
        let flaky = Arc::new(FlakyStore {
            inner: RedbRecordStore::new(dir.path()).unwrap(),
            failing: AtomicBool::new(true),
        });
        let coord = Coordinator::new(Arc::new(MemoryStore::new()));
        let mut persister = BatchPersister::new(flaky.clone(), coord.clone(), "w1", "u/");

        persister.accumulate(PersistedRecord::found(profile(9, false, false), "w1"));
        assert_eq!(
            persister.flush(10).await.unwrap(),
            FlushOutcome::Retained { buffered: 1 }
        );
        assert_eq!(coord.aggregate_stats().await.unwrap().found, 0);

        flaky.failing.store(false, Ordering::SeqCst);
        assert_eq!(
            persister.flush(10).await.unwrap(),
            FlushOutcome::Written {
                records: 1,
                found: 1
            }
        );
        assert!(flaky.get(9).unwrap().is_some());
    }
}
