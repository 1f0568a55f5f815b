//! In-process catalog backend.
//!
//! Committed state sits behind one `RwLock`; decisions are serialised per
//! request id with an async mutex kept in a `DashMap`, so unrelated requests
//! never wait on each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use super::{CatalogStore, DecisionTx, DecisionUpdate, StoreError};
use crate::models::database::{
    DatabaseListing, DatabaseStatus, NewProvisionedDatabase, ProvisionedDatabase,
};
use crate::models::request::{Request, RequestStatus};

/// A write that can be made to fail once via [`MemoryStore::fail_on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    InsertRequest,
    UpdateRequest,
    InsertDatabase,
    MarkProvisioned,
    Commit,
}

struct StoredRequest {
    seq: u64,
    request: Request,
}

#[derive(Default)]
struct State {
    requests: HashMap<Uuid, StoredRequest>,
    databases: Vec<ProvisionedDatabase>,
    next_seq: u64,
}

impl State {
    fn database_count(&self, request_id: Uuid) -> usize {
        self.databases
            .iter()
            .filter(|d| d.request_id == request_id)
            .count()
    }
}

struct Inner {
    state: RwLock<State>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    next_db_id: AtomicI64,
    faults: DashSet<Fault>,
}

impl Inner {
    fn trip(&self, fault: Fault) -> Result<(), StoreError> {
        if self.faults.remove(&fault).is_some() {
            tracing::debug!(?fault, "memory store: injected fault");
            return Err(StoreError::Injected(fault));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                locks: DashMap::new(),
                next_db_id: AtomicI64::new(1),
                faults: DashSet::new(),
            }),
        }
    }

    /// Make the next occurrence of `fault` return [`StoreError::Injected`].
    pub fn fail_on(&self, fault: Fault) {
        self.inner.faults.insert(fault);
    }

    /// Insert a database record outside any decision, bypassing the engine.
    /// Used to stage broken catalogs for reconciliation checks.
    pub async fn insert_database_unchecked(
        &self,
        record: NewProvisionedDatabase,
    ) -> ProvisionedDatabase {
        let id = self.inner.next_db_id.fetch_add(1, Ordering::SeqCst);
        let db = record.with_id(id);
        self.inner.state.write().await.databases.push(db.clone());
        db
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn insert_request(&self, request: &Request) -> Result<(), StoreError> {
        self.inner.trip(Fault::InsertRequest)?;
        let mut state = self.inner.state.write().await;
        if state.requests.contains_key(&request.id) {
            return Err(StoreError::Corrupt(format!(
                "duplicate request id {}",
                request.id
            )));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.requests.insert(
            request.id,
            StoredRequest {
                seq,
                request: request.clone(),
            },
        );
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<Request>, StoreError> {
        let state = self.inner.state.read().await;
        Ok(state.requests.get(&id).map(|s| s.request.clone()))
    }

    async fn get_request_status(&self, id: Uuid) -> Result<Option<RequestStatus>, StoreError> {
        let state = self.inner.state.read().await;
        Ok(state.requests.get(&id).map(|s| s.request.status))
    }

    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        limit: Option<i64>,
    ) -> Result<Vec<Request>, StoreError> {
        let state = self.inner.state.read().await;
        let mut matched: Vec<&StoredRequest> = state
            .requests
            .values()
            .filter(|s| status.map_or(true, |st| s.request.status == st))
            .collect();
        matched.sort_by(|a, b| {
            b.request
                .created_at
                .cmp(&a.request.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        let take = limit.map_or(usize::MAX, |l| usize::try_from(l.max(0)).unwrap_or(usize::MAX));
        Ok(matched
            .into_iter()
            .take(take)
            .map(|s| s.request.clone())
            .collect())
    }

    async fn list_active_databases(&self) -> Result<Vec<DatabaseListing>, StoreError> {
        let state = self.inner.state.read().await;
        let mut rows: Vec<DatabaseListing> = state
            .databases
            .iter()
            .filter(|d| d.status == DatabaseStatus::Active)
            .filter_map(|d| {
                state.requests.get(&d.request_id).map(|owner| DatabaseListing {
                    database: d.clone(),
                    team_name: owner.request.team_name.clone(),
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            b.database
                .created_at
                .cmp(&a.database.created_at)
                .then(b.database.id.cmp(&a.database.id))
        });
        Ok(rows)
    }

    async fn list_databases(&self) -> Result<Vec<ProvisionedDatabase>, StoreError> {
        let state = self.inner.state.read().await;
        Ok(state.databases.clone())
    }

    async fn databases_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<ProvisionedDatabase>, StoreError> {
        let state = self.inner.state.read().await;
        Ok(state
            .databases
            .iter()
            .filter(|d| d.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn requests_with_database_counts(&self) -> Result<Vec<(Request, usize)>, StoreError> {
        let state = self.inner.state.read().await;
        let mut counts: HashMap<Uuid, usize> = HashMap::new();
        for db in &state.databases {
            *counts.entry(db.request_id).or_default() += 1;
        }

        let mut stored: Vec<&StoredRequest> = state.requests.values().collect();
        stored.sort_by(|a, b| {
            b.request
                .created_at
                .cmp(&a.request.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(stored
            .into_iter()
            .map(|s| {
                let count = counts.get(&s.request.id).copied().unwrap_or(0);
                (s.request.clone(), count)
            })
            .collect())
    }

    async fn request_with_database_count(
        &self,
        id: Uuid,
    ) -> Result<Option<(Request, usize)>, StoreError> {
        let state = self.inner.state.read().await;
        Ok(state
            .requests
            .get(&id)
            .map(|s| (s.request.clone(), state.database_count(id))))
    }

    async fn begin_decision(&self, id: Uuid) -> Result<Box<dyn DecisionTx>, StoreError> {
        let exists = self.inner.state.read().await.requests.contains_key(&id);
        if !exists {
            return Ok(Box::new(MemoryDecisionTx {
                inner: self.inner.clone(),
                id,
                guard: None,
                request: None,
                staged: Vec::new(),
                dirty: false,
            }));
        }

        let lock = self.inner.locks.entry(id).or_default().clone();
        let guard = lock.lock_owned().await;
        let request = self
            .inner
            .state
            .read()
            .await
            .requests
            .get(&id)
            .map(|s| s.request.clone());

        Ok(Box::new(MemoryDecisionTx {
            inner: self.inner.clone(),
            id,
            guard: Some(guard),
            request,
            staged: Vec::new(),
            dirty: false,
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Staged writes for one request; applied to [`State`] only on commit.
struct MemoryDecisionTx {
    inner: Arc<Inner>,
    id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    request: Option<Request>,
    staged: Vec<ProvisionedDatabase>,
    dirty: bool,
}

impl Drop for MemoryDecisionTx {
    fn drop(&mut self) {
        if self.guard.take().is_some() {
            // Forget the per-id mutex once nobody else holds or waits on it
            self.inner
                .locks
                .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

impl MemoryDecisionTx {
    fn held(&mut self) -> Result<&mut Request, StoreError> {
        self.request
            .as_mut()
            .ok_or_else(|| StoreError::Corrupt("no request held by this decision".into()))
    }
}

#[async_trait]
impl DecisionTx for MemoryDecisionTx {
    fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    async fn update_request_on_decision(
        &mut self,
        update: &DecisionUpdate,
    ) -> Result<Request, StoreError> {
        self.inner.trip(Fault::UpdateRequest)?;
        let req = self.held()?;
        req.status = update.status;
        req.approver = Some(update.approver.clone());
        req.approval_notes = update.notes.clone();
        req.approved_at = Some(update.approved_at);
        req.provisioned_at = update.provisioned_at;
        let snapshot = req.clone();
        self.dirty = true;
        Ok(snapshot)
    }

    async fn insert_provisioned_database(
        &mut self,
        record: &NewProvisionedDatabase,
    ) -> Result<ProvisionedDatabase, StoreError> {
        self.inner.trip(Fault::InsertDatabase)?;
        let id = self.inner.next_db_id.fetch_add(1, Ordering::SeqCst);
        let db = record.clone().with_id(id);
        self.staged.push(db.clone());
        Ok(db)
    }

    async fn mark_provisioned(&mut self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.trip(Fault::MarkProvisioned)?;
        let req = self.held()?;
        req.status = RequestStatus::Provisioned;
        req.provisioned_at = Some(at);
        self.dirty = true;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.inner.trip(Fault::Commit)?;
        if !self.dirty && self.staged.is_empty() {
            return Ok(());
        }

        let request = self.request.take();
        let staged = std::mem::take(&mut self.staged);
        let mut state = self.inner.state.write().await;
        if let Some(req) = request {
            if let Some(stored) = state.requests.get_mut(&req.id) {
                stored.request = req;
            }
        }
        state.databases.extend(staged);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::request::{DbType, Environment, NewRequest, Size};
    use std::time::Duration;

    fn sample(team: &str) -> Request {
        Request::pending(NewRequest {
            team_name: team.into(),
            db_type: DbType::Postgres,
            environment: Environment::Dev,
            size: Size::Small,
            purpose: "testing".into(),
        })
    }

    fn approve_update() -> DecisionUpdate {
        DecisionUpdate {
            status: RequestStatus::Approved,
            approver: "lead@example.com".into(),
            notes: None,
            approved_at: Utc::now(),
            provisioned_at: None,
        }
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let store = MemoryStore::new();
        let req = sample("a");
        store.insert_request(&req).await.unwrap();

        let mut tx = store.begin_decision(req.id).await.unwrap();
        tx.update_request_on_decision(&approve_update()).await.unwrap();
        assert_eq!(
            store.get_request_status(req.id).await.unwrap(),
            Some(RequestStatus::Pending)
        );

        tx.commit().await.unwrap();
        assert_eq!(
            store.get_request_status(req.id).await.unwrap(),
            Some(RequestStatus::Approved)
        );
    }

    #[tokio::test]
    async fn test_drop_without_commit_rolls_back() {
        let store = MemoryStore::new();
        let req = sample("a");
        store.insert_request(&req).await.unwrap();

        {
            let mut tx = store.begin_decision(req.id).await.unwrap();
            tx.update_request_on_decision(&approve_update()).await.unwrap();
            let record = NewProvisionedDatabase {
                request_id: req.id,
                name: "a_dev_postgres_00000000".into(),
                db_type: DbType::Postgres,
                environment: Environment::Dev,
                host: "h".into(),
                port: 5432,
                estimated_cost: rust_decimal::Decimal::new(50, 0),
                created_at: Utc::now(),
            };
            tx.insert_provisioned_database(&record).await.unwrap();
        }

        assert_eq!(
            store.get_request_status(req.id).await.unwrap(),
            Some(RequestStatus::Pending)
        );
        assert!(store.list_databases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_id_waits_for_holder() {
        let store = MemoryStore::new();
        let req = sample("a");
        store.insert_request(&req).await.unwrap();

        let held = store.begin_decision(req.id).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(100), store.begin_decision(req.id)).await;
        assert!(blocked.is_err(), "second decision must wait for the first");

        drop(held);
        let next =
            tokio::time::timeout(Duration::from_millis(100), store.begin_decision(req.id)).await;
        assert!(next.is_ok());
    }

    #[tokio::test]
    async fn test_different_ids_do_not_block() {
        let store = MemoryStore::new();
        let a = sample("a");
        let b = sample("b");
        store.insert_request(&a).await.unwrap();
        store.insert_request(&b).await.unwrap();

        let _held = store.begin_decision(a.id).await.unwrap();
        let other =
            tokio::time::timeout(Duration::from_millis(100), store.begin_decision(b.id)).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_id_yields_empty_decision() {
        let store = MemoryStore::new();
        let tx = store.begin_decision(Uuid::new_v4()).await.unwrap();
        assert!(tx.request().is_none());
    }

    #[tokio::test]
    async fn test_fault_fires_once() {
        let store = MemoryStore::new();
        store.fail_on(Fault::InsertRequest);
        let req = sample("a");
        assert!(matches!(
            store.insert_request(&req).await,
            Err(StoreError::Injected(Fault::InsertRequest))
        ));
        store.insert_request(&req).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_requests_filter_and_limit() {
        let store = MemoryStore::new();
        for team in ["a", "b", "c"] {
            store.insert_request(&sample(team)).await.unwrap();
        }

        let all = store.list_requests(None, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].team_name, "c");

        let limited = store.list_requests(None, Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);

        let approved = store
            .list_requests(Some(RequestStatus::Approved), None)
            .await
            .unwrap();
        assert!(approved.is_empty());
    }

    #[tokio::test]
    async fn test_decision_locks_are_released_after_use() {
        let store = MemoryStore::new();
        let a = sample("a");
        let b = sample("b");
        store.insert_request(&a).await.unwrap();
        store.insert_request(&b).await.unwrap();

        let mut tx = store.begin_decision(a.id).await.unwrap();
        tx.update_request_on_decision(&approve_update()).await.unwrap();
        tx.commit().await.unwrap();
        drop(store.begin_decision(b.id).await.unwrap());
        assert_eq!(store.inner.locks.len(), 0);

        let held = store.begin_decision(a.id).await.unwrap();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.begin_decision(a.id).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
        // The waiter still references the mutex, so the entry survives
        waiter.await.unwrap().unwrap();
        assert_eq!(store.inner.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_requests_with_database_counts() {
        let store = MemoryStore::new();
        let a = sample("a");
        let b = sample("b");
        store.insert_request(&a).await.unwrap();
        store.insert_request(&b).await.unwrap();

        let mut tx = store.begin_decision(a.id).await.unwrap();
        tx.update_request_on_decision(&approve_update()).await.unwrap();
        tx.insert_provisioned_database(&NewProvisionedDatabase {
            request_id: a.id,
            name: "a_dev_postgres_00000000".into(),
            db_type: DbType::Postgres,
            environment: Environment::Dev,
            host: "h".into(),
            port: 5432,
            estimated_cost: rust_decimal::Decimal::new(50, 0),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
        tx.mark_provisioned(Utc::now()).await.unwrap();
        tx.commit().await.unwrap();

        let rows = store.requests_with_database_counts().await.unwrap();
        let summary: Vec<(Uuid, RequestStatus, usize)> = rows
            .iter()
            .map(|(r, n)| (r.id, r.status, *n))
            .collect();
        assert_eq!(
            summary,
            vec![
                (b.id, RequestStatus::Pending, 0),
                (a.id, RequestStatus::Provisioned, 1),
            ]
        );

        let (req, count) = store.request_with_database_count(a.id).await.unwrap().unwrap();
        assert_eq!(req.status, RequestStatus::Provisioned);
        assert_eq!(count, 1);
        assert!(store
            .request_with_database_count(Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }
}
