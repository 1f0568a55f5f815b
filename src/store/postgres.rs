use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{CatalogStore, DecisionTx, DecisionUpdate, StoreError};
use crate::models::database::{
    DatabaseListing, DatabaseStatus, NewProvisionedDatabase, ProvisionedDatabase,
};
use crate::models::request::{Request, RequestStatus};

const REQUEST_COLUMNS: &str = "request_id, team_name, db_type, environment, size, purpose, status, \
     created_at, approved_at, approver, approval_notes, provisioned_at";

const REQUEST_COLUMNS_R: &str = "r.request_id, r.team_name, r.db_type, r.environment, r.size, \
     r.purpose, r.status, r.created_at, r.approved_at, r.approver, r.approval_notes, r.provisioned_at";

const DATABASE_COLUMNS: &str = "d.db_id, d.request_id, d.db_name, d.db_type, d.environment, d.host, \
     d.port, d.estimated_cost, d.status, d.created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn insert_request(&self, request: &Request) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO db_requests
               (request_id, team_name, db_type, environment, size, purpose, status, created_at,
                approved_at, approver, approval_notes, provisioned_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(request.id)
        .bind(&request.team_name)
        .bind(request.db_type.as_str())
        .bind(request.environment.as_str())
        .bind(request.size.as_str())
        .bind(&request.purpose)
        .bind(request.status)
        .bind(request.created_at)
        .bind(request.approved_at)
        .bind(&request.approver)
        .bind(&request.approval_notes)
        .bind(request.provisioned_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("insert_request failed: {:?}", e);
            e
        })?;
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<Request>, StoreError> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM db_requests WHERE request_id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Request::from))
    }

    async fn get_request_status(&self, id: Uuid) -> Result<Option<RequestStatus>, StoreError> {
        let status = sqlx::query_scalar::<_, RequestStatus>(
            "SELECT status FROM db_requests WHERE request_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(status)
    }

    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        limit: Option<i64>,
    ) -> Result<Vec<Request>, StoreError> {
        // NULL limit means no limit in Postgres
        let rows = sqlx::query_as::<_, RequestRow>(&format!(
            r#"SELECT {REQUEST_COLUMNS} FROM db_requests
               WHERE ($1::varchar IS NULL OR status = $1)
               ORDER BY created_at DESC
               LIMIT $2"#
        ))
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Request::from).collect())
    }

    async fn list_active_databases(&self) -> Result<Vec<DatabaseListing>, StoreError> {
        let rows = sqlx::query_as::<_, DatabaseListingRow>(&format!(
            r#"SELECT {DATABASE_COLUMNS}, r.team_name
               FROM provisioned_databases d
               JOIN db_requests r ON d.request_id = r.request_id
               WHERE d.status = 'active'
               ORDER BY d.created_at DESC, d.db_id DESC"#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<DatabaseListing, StoreError> {
                Ok(DatabaseListing {
                    team_name: row.team_name,
                    database: row.database.try_into()?,
                })
            })
            .collect()
    }

    async fn list_databases(&self) -> Result<Vec<ProvisionedDatabase>, StoreError> {
        let rows = sqlx::query_as::<_, DatabaseRow>(&format!(
            "SELECT {DATABASE_COLUMNS} FROM provisioned_databases d ORDER BY d.db_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ProvisionedDatabase::try_from).collect()
    }

    async fn databases_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<ProvisionedDatabase>, StoreError> {
        let rows = sqlx::query_as::<_, DatabaseRow>(&format!(
            "SELECT {DATABASE_COLUMNS} FROM provisioned_databases d WHERE d.request_id = $1 ORDER BY d.db_id ASC"
        ))
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ProvisionedDatabase::try_from).collect()
    }

    async fn requests_with_database_counts(&self) -> Result<Vec<(Request, usize)>, StoreError> {
        // One statement, one snapshot
        let rows = sqlx::query_as::<_, RequestCountRow>(&format!(
            r#"SELECT {REQUEST_COLUMNS_R}, COUNT(d.db_id) AS database_count
               FROM db_requests r
               LEFT JOIN provisioned_databases d ON d.request_id = r.request_id
               GROUP BY r.request_id
               ORDER BY r.created_at DESC"#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RequestCountRow::into_pair).collect()
    }

    async fn request_with_database_count(
        &self,
        id: Uuid,
    ) -> Result<Option<(Request, usize)>, StoreError> {
        let row = sqlx::query_as::<_, RequestCountRow>(&format!(
            r#"SELECT {REQUEST_COLUMNS_R}, COUNT(d.db_id) AS database_count
               FROM db_requests r
               LEFT JOIN provisioned_databases d ON d.request_id = r.request_id
               WHERE r.request_id = $1
               GROUP BY r.request_id"#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RequestCountRow::into_pair).transpose()
    }

    async fn begin_decision(&self, id: Uuid) -> Result<Box<dyn DecisionTx>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock is held until commit/rollback; a second decider blocks here
        // and then reads the committed status.
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM db_requests WHERE request_id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        Ok(Box::new(PgDecisionTx {
            tx,
            id,
            request: row.map(Request::from),
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// A decision transaction. Dropping it rolls back.
struct PgDecisionTx {
    tx: Transaction<'static, Postgres>,
    id: Uuid,
    request: Option<Request>,
}

#[async_trait]
impl DecisionTx for PgDecisionTx {
    fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    async fn update_request_on_decision(
        &mut self,
        update: &DecisionUpdate,
    ) -> Result<Request, StoreError> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            r#"UPDATE db_requests
               SET status = $2, approver = $3, approval_notes = $4,
                   approved_at = $5, provisioned_at = $6
               WHERE request_id = $1
               RETURNING {REQUEST_COLUMNS}"#
        ))
        .bind(self.id)
        .bind(update.status)
        .bind(&update.approver)
        .bind(&update.notes)
        .bind(update.approved_at)
        .bind(update.provisioned_at)
        .fetch_one(&mut *self.tx)
        .await?;

        let request = Request::from(row);
        self.request = Some(request.clone());
        Ok(request)
    }

    async fn insert_provisioned_database(
        &mut self,
        record: &NewProvisionedDatabase,
    ) -> Result<ProvisionedDatabase, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO provisioned_databases
               (request_id, db_name, db_type, environment, host, port, estimated_cost, status, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, 'active', $8)
               RETURNING db_id"#,
        )
        .bind(record.request_id)
        .bind(&record.name)
        .bind(record.db_type.as_str())
        .bind(record.environment.as_str())
        .bind(&record.host)
        .bind(i32::from(record.port))
        .bind(record.estimated_cost)
        .bind(record.created_at)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(record.clone().with_id(id))
    }

    async fn mark_provisioned(&mut self, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE db_requests SET status = 'provisioned', provisioned_at = $2 WHERE request_id = $1",
        )
        .bind(self.id)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;

        if let Some(req) = self.request.as_mut() {
            req.status = RequestStatus::Provisioned;
            req.provisioned_at = Some(at);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

// -- Rows --

#[derive(Debug, sqlx::FromRow)]
struct RequestRow {
    request_id: Uuid,
    team_name: String,
    db_type: String,
    environment: String,
    size: String,
    purpose: String,
    status: RequestStatus,
    created_at: DateTime<Utc>,
    approved_at: Option<DateTime<Utc>>,
    approver: Option<String>,
    approval_notes: Option<String>,
    provisioned_at: Option<DateTime<Utc>>,
}

impl From<RequestRow> for Request {
    fn from(row: RequestRow) -> Self {
        Self {
            id: row.request_id,
            team_name: row.team_name,
            db_type: row.db_type.into(),
            environment: row.environment.into(),
            size: row.size.into(),
            purpose: row.purpose,
            status: row.status,
            created_at: row.created_at,
            approved_at: row.approved_at,
            approver: row.approver,
            approval_notes: row.approval_notes,
            provisioned_at: row.provisioned_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RequestCountRow {
    #[sqlx(flatten)]
    request: RequestRow,
    database_count: i64,
}

impl RequestCountRow {
    fn into_pair(self) -> Result<(Request, usize), StoreError> {
        let count = usize::try_from(self.database_count).map_err(|_| {
            StoreError::Corrupt(format!("negative database count {}", self.database_count))
        })?;
        Ok((Request::from(self.request), count))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DatabaseRow {
    db_id: i64,
    request_id: Uuid,
    db_name: String,
    db_type: String,
    environment: String,
    host: String,
    port: i32,
    estimated_cost: Decimal,
    status: DatabaseStatus,
    created_at: DateTime<Utc>,
}

impl TryFrom<DatabaseRow> for ProvisionedDatabase {
    type Error = StoreError;

    fn try_from(row: DatabaseRow) -> Result<Self, Self::Error> {
        let port = u16::try_from(row.port).map_err(|_| {
            StoreError::Corrupt(format!("db_id {} has out-of-range port {}", row.db_id, row.port))
        })?;
        Ok(Self {
            id: row.db_id,
            request_id: row.request_id,
            name: row.db_name,
            db_type: row.db_type.into(),
            environment: row.environment.into(),
            host: row.host,
            port,
            estimated_cost: row.estimated_cost,
            status: row.status,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DatabaseListingRow {
    #[sqlx(flatten)]
    database: DatabaseRow,
    team_name: String,
}
