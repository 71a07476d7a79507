use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use mediagraph_core::{JobId, JobRecord};

use super::{Mutator, ResultStore, StoreError, UpdateOutcome};

#[derive(Debug, Clone)]
struct Entry {
    record: JobRecord,
    expires_at: Instant,
}

impl Entry {
    fn new(record: JobRecord) -> Self {
        let expires_at = Instant::now() + record.ttl;
        Self { record, expires_at }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory result store for tests/dev.
///
/// Updates run under the map's write lock, which makes them atomic per key.
/// Expired entries read as `NotFound` and are dropped lazily or by
/// [`InMemoryResultStore::purge_expired`].
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    records: RwLock<HashMap<JobId, Entry>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut records) = self.records.write() else {
            return 0;
        };
        let now = Instant::now();
        let before = records.len();
        records.retain(|_, e| e.is_live(now));
        before - records.len()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.records
            .read()
            .map(|r| r.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

impl ResultStore for InMemoryResultStore {
    fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        records.insert(record.job_id.clone(), Entry::new(record.clone()));
        Ok(())
    }

    fn get(&self, job_id: &JobId) -> Result<JobRecord, StoreError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        match records.get(job_id) {
            Some(entry) if entry.is_live(Instant::now()) => Ok(entry.record.clone()),
            _ => Err(StoreError::NotFound(job_id.clone())),
        }
    }

    fn update(&self, job_id: &JobId, mutator: &mut Mutator<'_>) -> Result<UpdateOutcome, StoreError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;

        let current = match records.get(job_id) {
            Some(entry) if entry.is_live(Instant::now()) => entry.record.clone(),
            Some(_) => {
                records.remove(job_id);
                return Err(StoreError::NotFound(job_id.clone()));
            }
            None => return Err(StoreError::NotFound(job_id.clone())),
        };

        match mutator(&current) {
            Some(next) => {
                records.insert(job_id.clone(), Entry::new(next.clone()));
                Ok(UpdateOutcome::Updated(next))
            }
            None => Ok(UpdateOutcome::Unchanged(current)),
        }
    }

    fn delete(&self, job_id: &JobId) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        records.remove(job_id);
        Ok(())
    }

    fn expire_after(&self, job_id: &JobId, ttl: Duration) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let now = Instant::now();
        match records.get_mut(job_id) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = now + ttl;
                Ok(())
            }
            _ => Err(StoreError::NotFound(job_id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use serde_json::json;

    use mediagraph_core::{JobKind, JobState};

    use super::*;

    fn test_record(ttl: Duration) -> JobRecord {
        JobRecord::new(JobKind::MetaToSceneGraph, json!({"meta": "X"}), ttl)
    }

    #[test]
    fn put_then_get_observes_write() {
        let store = InMemoryResultStore::new();
        let record = test_record(Duration::from_secs(60));
        store.put(&record).unwrap();

        assert_eq!(store.get(&record.job_id).unwrap(), record);
    }

    #[test]
    fn missing_record_is_not_found() {
        let store = InMemoryResultStore::new();
        let id = JobId::new(JobKind::RetrieveSceneGraph);
        assert_eq!(store.get(&id), Err(StoreError::NotFound(id.clone())));

        let err = store.update(&id, &mut |r| Some(r.clone())).unwrap_err();
        assert_eq!(err, StoreError::NotFound(id));
    }

    #[test]
    fn update_applies_or_declines() {
        let store = InMemoryResultStore::new();
        let record = test_record(Duration::from_secs(60));
        store.put(&record).unwrap();

        let outcome = store
            .update(&record.job_id, &mut |r| {
                let mut next = r.clone();
                next.claim().ok()?;
                Some(next)
            })
            .unwrap();
        assert!(outcome.is_updated());
        assert_eq!(store.get(&record.job_id).unwrap().state, JobState::Running);

        let outcome = store.update(&record.job_id, &mut |_| None).unwrap();
        assert!(!outcome.is_updated());
        assert_eq!(outcome.record().state, JobState::Running);
    }

    #[test]
    fn concurrent_claims_are_exclusive() {
        let store = Arc::new(InMemoryResultStore::new());
        let record = test_record(Duration::from_secs(60));
        store.put(&record).unwrap();

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                let id = record.job_id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .update(&id, &mut |r| {
                            let mut next = r.clone();
                            next.claim().ok()?;
                            Some(next)
                        })
                        .unwrap()
                        .is_updated()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.get(&record.job_id).unwrap().attempt, 1);
    }

    #[test]
    fn expired_records_read_as_not_found() {
        let store = InMemoryResultStore::new();
        let record = test_record(Duration::from_millis(20));
        store.put(&record).unwrap();

        thread::sleep(Duration::from_millis(40));
        assert!(matches!(store.get(&record.job_id), Err(StoreError::NotFound(_))));
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn expire_after_shortens_lifetime() {
        let store = InMemoryResultStore::new();
        let record = test_record(Duration::from_secs(60));
        store.put(&record).unwrap();

        store.expire_after(&record.job_id, Duration::ZERO).unwrap();
        assert!(matches!(store.get(&record.job_id), Err(StoreError::NotFound(_))));

        let missing = JobId::new(JobKind::MetaToSceneGraph);
        assert!(store.expire_after(&missing, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn delete_is_idempotent() {
        let store = InMemoryResultStore::new();
        let record = test_record(Duration::from_secs(60));
        store.put(&record).unwrap();

        store.delete(&record.job_id).unwrap();
        store.delete(&record.job_id).unwrap();
        assert!(matches!(store.get(&record.job_id), Err(StoreError::NotFound(_))));
    }
}
