//! Catalog Store: durable keeper of requests and provisioned databases.
//!
//! Two backends: [`postgres::PgStore`] for deployments and
//! [`memory::MemoryStore`] for local runs and tests. The lifecycle engine only
//! sees the [`CatalogStore`] trait.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::database::{DatabaseListing, NewProvisionedDatabase, ProvisionedDatabase};
use crate::models::request::{Request, RequestStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("injected fault at {0:?}")]
    Injected(memory::Fault),
}

/// Fields written when a pending request is decided.
#[derive(Debug, Clone)]
pub struct DecisionUpdate {
    pub status: RequestStatus,
    pub approver: String,
    pub notes: Option<String>,
    pub approved_at: DateTime<Utc>,
    pub provisioned_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn insert_request(&self, request: &Request) -> Result<(), StoreError>;

    async fn get_request(&self, id: Uuid) -> Result<Option<Request>, StoreError>;

    async fn get_request_status(&self, id: Uuid) -> Result<Option<RequestStatus>, StoreError>;

    /// Newest first. `limit = None` returns every match.
    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        limit: Option<i64>,
    ) -> Result<Vec<Request>, StoreError>;

    /// Active databases joined with the owning request's team, newest first.
    async fn list_active_databases(&self) -> Result<Vec<DatabaseListing>, StoreError>;

    /// Every database record regardless of status.
    async fn list_databases(&self) -> Result<Vec<ProvisionedDatabase>, StoreError>;

    async fn databases_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<ProvisionedDatabase>, StoreError>;

    /// Every request paired with the number of database records it owns,
    /// newest first. Both sides come from one consistent read.
    async fn requests_with_database_counts(&self) -> Result<Vec<(Request, usize)>, StoreError>;

    /// One request and its database record count, read together.
    async fn request_with_database_count(
        &self,
        id: Uuid,
    ) -> Result<Option<(Request, usize)>, StoreError>;

    /// Open a unit of work holding `id` exclusively until commit or drop.
    ///
    /// Concurrent calls for the same id wait for each other; calls for
    /// different ids proceed in parallel. Dropping the returned handle without
    /// calling [`DecisionTx::commit`] discards every staged write.
    async fn begin_decision(&self, id: Uuid) -> Result<Box<dyn DecisionTx>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn close(&self) {}
}

/// Writes issued while a request is held by [`CatalogStore::begin_decision`].
#[async_trait]
pub trait DecisionTx: Send {
    /// The request as read under the lock, `None` if it does not exist.
    fn request(&self) -> Option<&Request>;

    /// Apply the decision and return the row as re-read after the write.
    async fn update_request_on_decision(
        &mut self,
        update: &DecisionUpdate,
    ) -> Result<Request, StoreError>;

    async fn insert_provisioned_database(
        &mut self,
        record: &NewProvisionedDatabase,
    ) -> Result<ProvisionedDatabase, StoreError>;

    async fn mark_provisioned(&mut self, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
