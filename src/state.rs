use redb::{
    Database, MultimapTableDefinition, ReadableTable, ReadableTableMetadata, TableDefinition,
    WriteTransaction,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::models::{PersistedRecord, ProfileRecord};

#[derive(Error, Debug)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("Database creation error: {0}")]
    RedbCreate(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Record store {0} is already open in another process")]
    AlreadyOpen(PathBuf),

    #[error("Record store task failed: {0}")]
    Blocking(String),
}

impl From<tokio::task::JoinError> for StateError {
    fn from(e: tokio::task::JoinError) -> Self {
        StateError::Blocking(e.to_string())
    }
}

/// Status flags a found profile can be looked up by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileFlag {
    Banned,
    Support,
}

impl ProfileFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileFlag::Banned => "banned",
            ProfileFlag::Support => "support",
        }
    }

    fn of(record: &ProfileRecord) -> Vec<ProfileFlag> {
        let mut flags = Vec::new();
        if record.profile.is_banned {
            flags.push(ProfileFlag::Banned);
        }
        if record.profile.is_support {
            flags.push(ProfileFlag::Support);
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCounts {
    pub found: u64,
    pub not_found: u64,
}

/// Durable store of per-ID results.
///
/// Writes are upserts keyed by ID: writing an ID that already exists replaces the old
/// record, so re-scraping an ID is never a conflict.
pub trait RecordStore: Send + Sync {
    /// Upsert every record in one transaction. Within a batch the last record for an ID
    /// wins. Returns how many records were written.
    fn upsert_batch(&self, records: &[PersistedRecord]) -> Result<usize, StateError>;

    fn get(&self, id: u64) -> Result<Option<PersistedRecord>, StateError>;

    /// Case-insensitive exact nickname match.
    fn find_by_nickname(&self, nickname: &str) -> Result<Vec<ProfileRecord>, StateError>;

    fn find_by_flag(&self, flag: ProfileFlag) -> Result<Vec<u64>, StateError>;

    /// IDs with any record (found or tombstone) in `[start, end]`, ascending.
    fn ids_in_range(&self, start: u64, end: u64) -> Result<Vec<u64>, StateError>;

    /// Highest ID holding a found profile. Tombstones never count.
    fn max_found_id(&self) -> Result<Option<u64>, StateError>;

    fn count(&self) -> Result<RecordCounts, StateError>;

    /// Rebuild secondary indexes when they are missing. Returns true when a rebuild ran.
    fn ensure_indexes(&self) -> Result<bool, StateError>;
}

/// Run a record-store call on tokio's blocking pool. redb commits fsync and range scans
/// can be long, neither belongs on the async workers.
pub async fn run_blocking<T, F>(records: &Arc<dyn RecordStore>, call: F) -> Result<T, StateError>
where
    F: FnOnce(&dyn RecordStore) -> Result<T, StateError> + Send + 'static,
    T: Send + 'static,
{
    let records = Arc::clone(records);
    tokio::task::spawn_blocking(move || call(records.as_ref())).await?
}

/// Record store on top of redb.
pub struct RedbRecordStore {
    db: Arc<Database>,
}

impl RedbRecordStore {
    const RECORDS: TableDefinition<'static, u64, &'static [u8]> = TableDefinition::new("records");
    const FOUND_IDS: TableDefinition<'static, u64, ()> = TableDefinition::new("found_ids");
    const NICKNAMES: MultimapTableDefinition<'static, &'static str, u64> =
        MultimapTableDefinition::new("by_nickname");
    const FLAGS: MultimapTableDefinition<'static, &'static str, u64> =
        MultimapTableDefinition::new("by_flag");

    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, StateError> {
        let data_path = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_path)?;

        let db_path = data_path.join("profiles.redb");
        // redb holds an exclusive file lock; a second process on this data dir fails here.
        let db = match Database::create(&db_path) {
            Ok(db) => db,
            Err(redb::DatabaseError::DatabaseAlreadyOpen) => {
                return Err(StateError::AlreadyOpen(db_path))
            }
            Err(e) => return Err(e.into()),
        };

        // Create every table up front so read transactions never miss one.
        let write_txn = db.begin_write()?;
        {
            let _records = write_txn.open_table(Self::RECORDS)?;
            let _found = write_txn.open_table(Self::FOUND_IDS)?;
            let _nicknames = write_txn.open_multimap_table(Self::NICKNAMES)?;
            let _flags = write_txn.open_multimap_table(Self::FLAGS)?;
        }
        write_txn.commit()?;

        tracing::debug!("Opened record store at {}", db_path.display());
        Ok(Self { db: Arc::new(db) })
    }

    fn decode(bytes: &[u8]) -> Result<PersistedRecord, StateError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn index_in_txn(txn: &WriteTransaction, record: &PersistedRecord) -> Result<(), StateError> {
        if let Some(found) = record.as_found() {
            let id = found.profile.id;
            txn.open_table(Self::FOUND_IDS)?.insert(id, ())?;
            txn.open_multimap_table(Self::NICKNAMES)?
                .insert(found.profile.nickname.to_lowercase().as_str(), id)?;
            let mut flags = txn.open_multimap_table(Self::FLAGS)?;
            for flag in ProfileFlag::of(found) {
                flags.insert(flag.as_str(), id)?;
            }
        }
        Ok(())
    }

    fn unindex_in_txn(txn: &WriteTransaction, record: &PersistedRecord) -> Result<(), StateError> {
        if let Some(found) = record.as_found() {
            let id = found.profile.id;
            txn.open_table(Self::FOUND_IDS)?.remove(id)?;
            txn.open_multimap_table(Self::NICKNAMES)?
                .remove(found.profile.nickname.to_lowercase().as_str(), id)?;
            let mut flags = txn.open_multimap_table(Self::FLAGS)?;
            for flag in ProfileFlag::of(found) {
                flags.remove(flag.as_str(), id)?;
            }
        }
        Ok(())
    }
}

impl RecordStore for RedbRecordStore {
    fn upsert_batch(&self, records: &[PersistedRecord]) -> Result<usize, StateError> {
        if records.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        for record in records {
            let id = record.id();
            let previous = {
                let table = write_txn.open_table(Self::RECORDS)?;
                let bytes = table.get(id)?.map(|guard| guard.value().to_vec());
                bytes
            };
            if let Some(bytes) = previous {
                Self::unindex_in_txn(&write_txn, &Self::decode(&bytes)?)?;
            }

            let encoded = serde_json::to_vec(record)?;
            write_txn
                .open_table(Self::RECORDS)?
                .insert(id, encoded.as_slice())?;
            Self::index_in_txn(&write_txn, record)?;
        }
        write_txn.commit()?;
        Ok(records.len())
    }

    fn get(&self, id: u64) -> Result<Option<PersistedRecord>, StateError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(Self::RECORDS)?;
        match table.get(id)? {
            Some(bytes) => Ok(Some(Self::decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn find_by_nickname(&self, nickname: &str) -> Result<Vec<ProfileRecord>, StateError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_multimap_table(Self::NICKNAMES)?;
        let records = read_txn.open_table(Self::RECORDS)?;

        let mut found = Vec::new();
        for id in index.get(nickname.to_lowercase().as_str())? {
            let id = id?.value();
            if let Some(bytes) = records.get(id)? {
                if let PersistedRecord::Found(record) = Self::decode(bytes.value())? {
                    found.push(record);
                }
            }
        }
        Ok(found)
    }

    fn find_by_flag(&self, flag: ProfileFlag) -> Result<Vec<u64>, StateError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_multimap_table(Self::FLAGS)?;
        let mut ids = Vec::new();
        for id in index.get(flag.as_str())? {
            ids.push(id?.value());
        }
        Ok(ids)
    }

    fn ids_in_range(&self, start: u64, end: u64) -> Result<Vec<u64>, StateError> {
        if start > end {
            return Ok(Vec::new());
        }
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(Self::RECORDS)?;
        let mut ids = Vec::new();
        for entry in table.range(start..=end)? {
            let (key, _value) = entry?;
            ids.push(key.value());
        }
        Ok(ids)
    }

    fn max_found_id(&self) -> Result<Option<u64>, StateError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(Self::FOUND_IDS)?;
        let last = table.last()?.map(|(key, _)| key.value());
        Ok(last)
    }

    fn count(&self) -> Result<RecordCounts, StateError> {
        let read_txn = self.db.begin_read()?;
        let total = read_txn.open_table(Self::RECORDS)?.len()?;
        let found = read_txn.open_table(Self::FOUND_IDS)?.len()?;
        Ok(RecordCounts {
            found,
            not_found: total.saturating_sub(found),
        })
    }

    fn ensure_indexes(&self) -> Result<bool, StateError> {
        {
            let read_txn = self.db.begin_read()?;
            let records = read_txn.open_table(Self::RECORDS)?;
            let found = read_txn.open_table(Self::FOUND_IDS)?;
            if records.is_empty()? || !found.is_empty()? {
                return Ok(false);
            }
        }

        tracing::info!("Record indexes are empty, rebuilding from stored records");
        let write_txn = self.db.begin_write()?;
        let mut stored = Vec::new();
        {
            let table = write_txn.open_table(Self::RECORDS)?;
            for entry in table.iter()? {
                let (_key, value) = entry?;
                stored.push(Self::decode(value.value())?);
            }
        }
        for record in &stored {
            Self::index_in_txn(&write_txn, record)?;
        }
        write_txn.commit()?;
        tracing::info!("Rebuilt indexes over {} records", stored.len());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Profile;
    use chrono::Utc;
    use tempfile::TempDir;

    fn profile(id: u64, nickname: &str, banned: bool, support: bool) -> Profile {
        Profile {
            id,
            nickname: nickname.to_string(),
            registered_at: "1 January 2020".to_string(),
            rating: None,
            review_count: 0,
            lot_count: 0,
            is_banned: banned,
            is_support: support,
            scraped_at: Utc::now(),
        }
    }

    fn found(id: u64, nickname: &str) -> PersistedRecord {
        PersistedRecord::found(profile(id, nickname, false, false), "test")
    }

    #[test]
    fn test_state_creation() {
        let dir = TempDir::new().unwrap();
        let store = RedbRecordStore::new(dir.path()).unwrap();
        assert_eq!(store.count().unwrap(), RecordCounts::default());
        assert_eq!(store.max_found_id().unwrap(), None);
    }

    #[test]
    fn test_second_open_of_same_dir_is_rejected() {
        let dir = TempDir::new().unwrap();
        let _owner = RedbRecordStore::new(dir.path()).unwrap();
        assert!(matches!(
            RedbRecordStore::new(dir.path()),
            Err(StateError::AlreadyOpen(_))
        ));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = RedbRecordStore::new(dir.path()).unwrap();

        let batch = vec![found(1, "alpha"), PersistedRecord::tombstone(2, "test")];
        store.upsert_batch(&batch).unwrap();
        store.upsert_batch(&batch).unwrap();

        let counts = store.count().unwrap();
        assert_eq!(counts.found, 1);
        assert_eq!(counts.not_found, 1);
        assert_eq!(store.find_by_nickname("alpha").unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_replaces_tombstone_and_reindexes() {
        let dir = TempDir::new().unwrap();
        let store = RedbRecordStore::new(dir.path()).unwrap();

        store
            .upsert_batch(&[PersistedRecord::tombstone(5, "test")])
            .unwrap();
        assert_eq!(store.max_found_id().unwrap(), None);

        store.upsert_batch(&[found(5, "Old")]).unwrap();
        store.upsert_batch(&[found(5, "New")]).unwrap();

        assert!(store.get(5).unwrap().unwrap().is_found());
        assert!(store.find_by_nickname("old").unwrap().is_empty());
        assert_eq!(store.find_by_nickname("NEW").unwrap()[0].profile.id, 5);
        assert_eq!(store.max_found_id().unwrap(), Some(5));
    }

    #[test]
    fn test_max_found_id_ignores_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = RedbRecordStore::new(dir.path()).unwrap();
        store
            .upsert_batch(&[
                found(3, "a"),
                found(7, "b"),
                PersistedRecord::tombstone(9, "test"),
            ])
            .unwrap();
        assert_eq!(store.max_found_id().unwrap(), Some(7));
    }

    #[test]
    fn test_ids_in_range_includes_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = RedbRecordStore::new(dir.path()).unwrap();
        store
            .upsert_batch(&[
                found(1, "a"),
                found(2, "b"),
                PersistedRecord::tombstone(4, "test"),
                found(10, "c"),
            ])
            .unwrap();
        assert_eq!(store.ids_in_range(1, 5).unwrap(), vec![1, 2, 4]);
        assert_eq!(store.ids_in_range(5, 9).unwrap(), Vec::<u64>::new());
        assert_eq!(store.ids_in_range(9, 3).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn test_find_by_flag() {
        let dir = TempDir::new().unwrap();
        let store = RedbRecordStore::new(dir.path()).unwrap();
        store
            .upsert_batch(&[
                PersistedRecord::found(profile(1, "a", true, false), "test"),
                PersistedRecord::found(profile(2, "b", false, true), "test"),
                PersistedRecord::found(profile(3, "c", true, true), "test"),
            ])
            .unwrap();
        assert_eq!(store.find_by_flag(ProfileFlag::Banned).unwrap(), vec![1, 3]);
        assert_eq!(store.find_by_flag(ProfileFlag::Support).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = TempDir::new().unwrap();
        {
            let store = RedbRecordStore::new(dir.path()).unwrap();
            store.upsert_batch(&[found(42, "kept")]).unwrap();
        }
        let store = RedbRecordStore::new(dir.path()).unwrap();
        assert_eq!(store.max_found_id().unwrap(), Some(42));
        assert!(!store.ensure_indexes().unwrap());
    }
}
