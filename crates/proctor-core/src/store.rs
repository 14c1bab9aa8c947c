use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::types::{FaceRecord, UpsertOutcome};

/// Persistent per-user face records.
///
/// Implementations must make `put` atomic: the name, fingerprint, reference
/// and variations of a record are replaced together or not at all.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<FaceRecord>, StorageError>;

    /// Insert or replace the record for `user_id`. Verification stats of an
    /// existing record are preserved.
    async fn put(&self, user_id: &str, record: &FaceRecord) -> Result<UpsertOutcome, StorageError>;

    /// Snapshot of every record, in no particular order.
    async fn all(&self) -> Result<Vec<FaceRecord>, StorageError>;

    /// Bump the verification counter, set `is_verified` and stamp the time.
    async fn record_verification(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;
}

/// In-process store, used by tests and the offline CLI.
#[derive(Default)]
pub struct MemoryIdentityStore {
    records: RwLock<HashMap<String, FaceRecord>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StorageError {
    StorageError::new("identity store lock poisoned")
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn get(&self, user_id: &str) -> Result<Option<FaceRecord>, StorageError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(user_id).cloned())
    }

    async fn put(&self, user_id: &str, record: &FaceRecord) -> Result<UpsertOutcome, StorageError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        match records.get_mut(user_id) {
            Some(existing) => {
                existing.name = record.name.clone();
                existing.fingerprint = record.fingerprint.clone();
                existing.reference = record.reference.clone();
                existing.variations = record.variations.clone();
                Ok(UpsertOutcome::Updated)
            }
            None => {
                let mut record = record.clone();
                record.user_id = user_id.to_string();
                records.insert(user_id.to_string(), record);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn all(&self) -> Result<Vec<FaceRecord>, StorageError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.values().cloned().collect())
    }

    async fn record_verification(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let record = records
            .get_mut(user_id)
            .ok_or_else(|| StorageError::new(format!("no record for user {user_id}")))?;
        record.verification_count += 1;
        record.is_verified = true;
        record.last_verified_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;

    fn record(user: &str, name: &str, fp: &str) -> FaceRecord {
        FaceRecord::new(user, name, Fingerprint::from_stored(fp), None, vec![], Utc::now())
    }

    #[tokio::test]
    async fn test_insert_then_update() {
        let store = MemoryIdentityStore::new();
        assert_eq!(
            store.put("u1", &record("u1", "Ada", "aa")).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.put("u1", &record("u1", "Ada L.", "bb")).await.unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(store.len(), 1);

        let stored = store.get("u1").await.unwrap().unwrap();
        assert_eq!(stored.name, "Ada L.");
        assert_eq!(stored.fingerprint.as_str(), "bb");
    }

    #[tokio::test]
    async fn test_update_preserves_stats() {
        let store = MemoryIdentityStore::new();
        store.put("u1", &record("u1", "Ada", "aa")).await.unwrap();
        let at = Utc::now();
        store.record_verification("u1", at).await.unwrap();
        store.record_verification("u1", at).await.unwrap();

        store.put("u1", &record("u1", "Ada", "cc")).await.unwrap();
        let stored = store.get("u1").await.unwrap().unwrap();
        assert_eq!(stored.verification_count, 2);
        assert!(stored.is_verified);
        assert_eq!(stored.last_verified_at, Some(at));
    }

    #[tokio::test]
    async fn test_record_verification_unknown_user() {
        let store = MemoryIdentityStore::new();
        assert!(store.record_verification("ghost", Utc::now()).await.is_err());
        assert!(store.get("ghost").await.unwrap().is_none());
    }
}
