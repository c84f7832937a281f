//! Mock remote CRM for testing.
//!
//! Holds records in memory, records every call, and allows queueing forced
//! failures. Remote edits can be simulated with [`MockRemote::edit_remote`].

use super::{Page, RemoteCrm, RemoteError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};
use sync_types::{now_millis, EntityData, EntityType, RemoteId, RemoteRecord, Timestamp};

/// A call observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    /// `get()`.
    Get(RemoteId),
    /// `create()`.
    Create(EntityType),
    /// `update()`.
    Update(RemoteId),
    /// `archive()`.
    Archive(RemoteId),
    /// `list_page()`.
    ListPage(EntityType, Option<String>),
}

/// Mock remote CRM for testing.
///
/// Clones share state, so a test can keep a handle while the engine owns
/// another.
#[derive(Debug, Default)]
pub struct MockRemote {
    inner: Arc<Mutex<MockRemoteInner>>,
}

#[derive(Debug, Default)]
struct MockRemoteInner {
    records: BTreeMap<RemoteId, RemoteRecord>,
    archived: HashSet<RemoteId>,
    calls: Vec<RemoteCall>,
    failures: VecDeque<RemoteError>,
    next_id: u64,
    clock: Option<Timestamp>,
}

impl MockRemoteInner {
    fn take_failure(&mut self) -> Result<(), RemoteError> {
        match self.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn stamp(&self) -> Timestamp {
        self.clock.unwrap_or_else(now_millis)
    }

    fn live(&self, remote_id: &RemoteId) -> Result<&RemoteRecord, RemoteError> {
        if self.archived.contains(remote_id) {
            return Err(RemoteError::NotFound(remote_id.to_string()));
        }
        self.records
            .get(remote_id)
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))
    }
}

impl MockRemote {
    /// Create an empty mock remote.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockRemoteInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed or replace a record directly, without recording a call.
    pub fn insert(&self, record: RemoteRecord) {
        let mut inner = self.lock();
        inner.archived.remove(&record.remote_id);
        inner.records.insert(record.remote_id.clone(), record);
    }

    /// Simulate an edit made by someone else on the remote side.
    ///
    /// Returns false if the record does not exist.
    pub fn edit_remote(
        &self,
        remote_id: &RemoteId,
        modified: Timestamp,
        edit: impl FnOnce(&mut EntityData),
    ) -> bool {
        let mut inner = self.lock();
        match inner.records.get_mut(remote_id) {
            Some(record) => {
                edit(&mut record.data);
                record.last_modified = modified;
                true
            }
            None => false,
        }
    }

    /// Current stored record, including archived ones.
    pub fn record(&self, remote_id: &RemoteId) -> Option<RemoteRecord> {
        self.lock().records.get(remote_id).cloned()
    }

    /// Whether a record was archived.
    pub fn is_archived(&self, remote_id: &RemoteId) -> bool {
        self.lock().archived.contains(remote_id)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.records.len() - inner.archived.len()
    }

    /// True when no live records exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fix the timestamp stamped on writes. `None` uses the wall clock.
    pub fn set_clock(&self, clock: Option<Timestamp>) {
        self.lock().clock = clock;
    }

    /// Cause the next call to fail with `error`. Failures queue up.
    pub fn fail_next(&self, error: RemoteError) {
        self.lock().failures.push_back(error);
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    /// Number of calls so far.
    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Clear all state.
    pub fn reset(&self) {
        *self.lock() = MockRemoteInner::default();
    }
}

impl Clone for MockRemote {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl RemoteCrm for MockRemote {
    async fn get(
        &self,
        entity_type: EntityType,
        remote_id: &RemoteId,
    ) -> Result<RemoteRecord, RemoteError> {
        let mut inner = self.lock();
        inner.calls.push(RemoteCall::Get(remote_id.clone()));
        inner.take_failure()?;

        let record = inner.live(remote_id)?;
        if record.data.entity_type() != entity_type {
            return Err(RemoteError::NotFound(remote_id.to_string()));
        }
        Ok(record.clone())
    }

    async fn create(&self, data: &EntityData) -> Result<RemoteRecord, RemoteError> {
        let mut inner = self.lock();
        inner.calls.push(RemoteCall::Create(data.entity_type()));
        inner.take_failure()?;

        inner.next_id += 1;
        let record = RemoteRecord {
            remote_id: RemoteId::new((1000 + inner.next_id).to_string()),
            data: data.clone(),
            last_modified: inner.stamp(),
        };
        inner
            .records
            .insert(record.remote_id.clone(), record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        remote_id: &RemoteId,
        data: &EntityData,
    ) -> Result<RemoteRecord, RemoteError> {
        let mut inner = self.lock();
        inner.calls.push(RemoteCall::Update(remote_id.clone()));
        inner.take_failure()?;

        inner.live(remote_id)?;
        let stamp = inner.stamp();
        let record = RemoteRecord {
            remote_id: remote_id.clone(),
            data: data.clone(),
            last_modified: stamp,
        };
        inner.records.insert(remote_id.clone(), record.clone());
        Ok(record)
    }

    async fn archive(
        &self,
        _entity_type: EntityType,
        remote_id: &RemoteId,
    ) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        inner.calls.push(RemoteCall::Archive(remote_id.clone()));
        inner.take_failure()?;

        inner.live(remote_id)?;
        inner.archived.insert(remote_id.clone());
        Ok(())
    }

    async fn list_page(
        &self,
        entity_type: EntityType,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Page, RemoteError> {
        let mut inner = self.lock();
        inner
            .calls
            .push(RemoteCall::ListPage(entity_type, after.map(str::to_string)));
        inner.take_failure()?;

        let start = match after {
            Some(cursor) => Bound::Excluded(RemoteId::new(cursor)),
            None => Bound::Unbounded,
        };
        let mut matching = inner
            .records
            .range((start, Bound::Unbounded))
            .map(|(_, record)| record)
            .filter(|r| r.data.entity_type() == entity_type && !inner.archived.contains(&r.remote_id));

        let records: Vec<RemoteRecord> = matching.by_ref().take(limit.max(1)).cloned().collect();
        let next = match (matching.next(), records.last()) {
            (Some(_), Some(last)) => Some(last.remote_id.to_string()),
            _ => None,
        };
        Ok(Page { records, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{Company, Contact};

    fn contact(email: &str) -> EntityData {
        EntityData::Contact(Contact::new(email))
    }

    #[tokio::test]
    async fn create_assigns_ids_and_stamps() {
        let remote = MockRemote::new();
        remote.set_clock(Some(5_000));

        let a = remote.create(&contact("a@x")).await.unwrap();
        let b = remote.create(&contact("b@x")).await.unwrap();

        assert_ne!(a.remote_id, b.remote_id);
        assert_eq!(a.last_modified, 5_000);
        assert_eq!(remote.len(), 2);
        assert_eq!(remote.calls(), vec![
            RemoteCall::Create(EntityType::Contact),
            RemoteCall::Create(EntityType::Contact),
        ]);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let remote = MockRemote::new();
        let err = remote
            .get(EntityType::Contact, &RemoteId::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)));
    }

    #[tokio::test]
    async fn forced_failures_are_consumed_in_order() {
        let remote = MockRemote::new();
        remote.fail_next(RemoteError::rate_limited());
        remote.fail_next(RemoteError::NotFound("x".into()));

        let first = remote.create(&contact("a@x")).await.unwrap_err();
        let second = remote.create(&contact("a@x")).await.unwrap_err();
        assert_eq!(first, RemoteError::rate_limited());
        assert!(matches!(second, RemoteError::NotFound(_)));

        // Next call should work
        remote.create(&contact("a@x")).await.unwrap();
        assert_eq!(remote.call_count(), 3);
    }

    #[tokio::test]
    async fn archived_records_disappear() {
        let remote = MockRemote::new();
        let a = remote.create(&contact("a@x")).await.unwrap();

        remote.archive(EntityType::Contact, &a.remote_id).await.unwrap();

        assert!(remote.is_archived(&a.remote_id));
        assert!(remote.is_empty());
        assert!(remote.get(EntityType::Contact, &a.remote_id).await.is_err());
        assert!(remote.update(&a.remote_id, &contact("b@x")).await.is_err());
    }

    #[tokio::test]
    async fn edit_remote_changes_data_and_timestamp() {
        let remote = MockRemote::new();
        remote.set_clock(Some(1_000));
        let a = remote.create(&contact("a@x")).await.unwrap();

        assert!(remote.edit_remote(&a.remote_id, 2_000, |data| {
            if let EntityData::Contact(c) = data {
                c.phone = Some("555".into());
            }
        }));

        let fetched = remote.get(EntityType::Contact, &a.remote_id).await.unwrap();
        assert_eq!(fetched.last_modified, 2_000);
        assert!(matches!(fetched.data, EntityData::Contact(ref c) if c.phone.as_deref() == Some("555")));
    }

    #[tokio::test]
    async fn list_pages_through_one_type() {
        let remote = MockRemote::new();
        for i in 0..5 {
            remote.create(&contact(&format!("{}@x", i))).await.unwrap();
        }
        remote
            .create(&EntityData::Company(Company::new("Acme")))
            .await
            .unwrap();

        let first = remote.list_page(EntityType::Contact, 2, None).await.unwrap();
        assert_eq!(first.records.len(), 2);
        let second = remote
            .list_page(EntityType::Contact, 2, first.next.as_deref())
            .await
            .unwrap();
        assert_eq!(second.records.len(), 2);
        let third = remote
            .list_page(EntityType::Contact, 2, second.next.as_deref())
            .await
            .unwrap();
        assert_eq!(third.records.len(), 1);
        assert!(third.next.is_none());

        let companies = remote.list_page(EntityType::Company, 10, None).await.unwrap();
        assert_eq!(companies.records.len(), 1);
        assert!(companies.next.is_none());
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let remote1 = MockRemote::new();
        let remote2 = remote1.clone();

        remote1.create(&contact("a@x")).await.unwrap();
        assert_eq!(remote2.len(), 1);

        remote2.reset();
        assert!(remote1.is_empty());
        assert_eq!(remote1.call_count(), 0);
    }
}
