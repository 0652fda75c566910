//! File record persistence.
//!
//! Sessions never hold a `FileRecord` across await points; they keep the id
//! and mutate through [`FileStore::update`], which serializes writers on a
//! per-record basis. The SQL-backed store of the full application implements
//! the same trait; [`MemoryStore`] is the in-process reference used by the
//! protocol core and its tests.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use nocturne_shared::crypto::ContentHash;
use nocturne_shared::types::{ConversationId, FileId};

use crate::error::{Result, StoreError};
use crate::models::FileRecord;

pub trait FileStore: Send + Sync {
    fn insert(&self, record: FileRecord) -> Result<()>;

    fn get(&self, id: FileId) -> Result<FileRecord>;

    /// Lookup by (conversation, hash), the resume key across sessions.
    fn find_by_hash(
        &self,
        conversation: ConversationId,
        hash: &ContentHash,
    ) -> Result<Option<FileRecord>>;

    /// Mutate one record under the store's per-record exclusion and return
    /// the updated value.
    fn update(
        &self,
        id: FileId,
        mutate: &mut dyn FnMut(&mut FileRecord),
    ) -> Result<FileRecord>;

    fn delete(&self, id: FileId) -> Result<bool>;

    /// Records in Waiting or Transferring state.
    fn list_active(&self) -> Result<Vec<FileRecord>>;
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<FileId, FileRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileStore for MemoryStore {
    fn insert(&self, record: FileRecord) -> Result<()> {
        let mut records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        if records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        debug!(file = %record.id, name = %record.name, "Inserted file record");
        records.insert(record.id, record);
        Ok(())
    }

    fn get(&self, id: FileId) -> Result<FileRecord> {
        let records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        records.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    fn find_by_hash(
        &self,
        conversation: ConversationId,
        hash: &ContentHash,
    ) -> Result<Option<FileRecord>> {
        let records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records
            .values()
            .find(|r| r.conversation == conversation && r.hash.as_ref() == Some(hash))
            .cloned())
    }

    fn update(
        &self,
        id: FileId,
        mutate: &mut dyn FnMut(&mut FileRecord),
    ) -> Result<FileRecord> {
        let mut records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        mutate(record);
        Ok(record.clone())
    }

    fn delete(&self, id: FileId) -> Result<bool> {
        let mut records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records.remove(&id).is_some())
    }

    fn list_active(&self) -> Result<Vec<FileRecord>> {
        let records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records.values().filter(|r| r.is_active()).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileState;

    fn record() -> FileRecord {
        FileRecord::new_outgoing(ConversationId::new(), "photo.jpg", "/tmp/photo.jpg", 4096)
    }

    #[test]
    fn test_insert_get_delete() {
        let store = MemoryStore::new();
        let r = record();
        let id = r.id;

        store.insert(r.clone()).unwrap();
        assert_eq!(store.get(id).unwrap(), r);
        assert!(matches!(
            store.insert(r),
            Err(StoreError::Duplicate(other)) if other == id
        ));

        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert!(matches!(store.get(id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_update_returns_new_value() {
        let store = MemoryStore::new();
        let r = record();
        let id = r.id;
        store.insert(r).unwrap();

        let updated = store
            .update(id, &mut |r| {
                r.state = FileState::Transferring;
                r.add_bytes_transferred(1024);
            })
            .unwrap();
        assert_eq!(updated.state, FileState::Transferring);
        assert_eq!(updated.bytes_transferred, 1024);
        assert_eq!(store.get(id).unwrap(), updated);
    }

    #[test]
    fn test_find_by_hash() {
        let store = MemoryStore::new();
        let mut r = record();
        let conversation = r.conversation;
        let hash = ContentHash([3u8; 32]);
        r.hash = Some(hash);
        store.insert(r.clone()).unwrap();

        assert_eq!(
            store.find_by_hash(conversation, &hash).unwrap(),
            Some(r.clone())
        );
        assert_eq!(
            store
                .find_by_hash(ConversationId::new(), &hash)
                .unwrap(),
            None
        );
        assert_eq!(
            store
                .find_by_hash(conversation, &ContentHash([4u8; 32]))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_list_active_filters_finished() {
        let store = MemoryStore::new();
        let active = record();
        let mut done = record();
        done.state = FileState::Done;
        store.insert(active.clone()).unwrap();
        store.insert(done).unwrap();

        let listed = store.list_active().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, active.id);
    }
}
