//! Request lifecycle engine.
//!
//! ```text
//! submit ──▶ pending ──approve──▶ approved ──provision──▶ provisioned
//!               │
//!               └──reject──▶ rejected
//! ```
//!
//! `approve` and provisioning run inside one [`DecisionTx`], so callers only
//! ever observe `pending`, `rejected` or `provisioned`. A request seen in
//! `approved`, or a provisioned request without exactly one database record,
//! means a write was lost outside this engine and is reported through
//! [`Inconsistency`] rather than repaired.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::cost::{database_name, ProvisioningPolicy, StandardPolicy, DEFAULT_HOST};
use crate::models::database::{DatabaseCatalog, NewProvisionedDatabase, ProvisionedDatabase};
use crate::models::request::{
    Decision, DecisionAction, NewRequest, Request, RequestStatus,
};
use crate::store::{CatalogStore, DecisionTx, DecisionUpdate};

/// Page size for unfiltered request listings.
pub const DEFAULT_LIST_LIMIT: i64 = 50;

/// Result of a successful decide call.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<ProvisionedDatabase>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InconsistencyKind {
    /// Status is `provisioned` but no database record exists.
    ProvisionedWithoutDatabase,
    /// More than one database record points at the request.
    DuplicateDatabases { count: usize },
    /// A database record exists for a request that is not `provisioned`.
    DatabaseWithoutProvisioning { count: usize },
    /// Left in `approved`; provisioning never completed.
    StuckApproved,
    /// Timestamps disagree with the status.
    TimestampMismatch { field: &'static str },
}

impl std::fmt::Display for InconsistencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InconsistencyKind::ProvisionedWithoutDatabase => {
                f.write_str("provisioned but no database record exists")
            }
            InconsistencyKind::DuplicateDatabases { count } => {
                write!(f, "{} database records linked to one request", count)
            }
            InconsistencyKind::DatabaseWithoutProvisioning { count } => {
                write!(f, "{} database record(s) linked to a non-provisioned request", count)
            }
            InconsistencyKind::StuckApproved => {
                f.write_str("approved but provisioning never completed")
            }
            InconsistencyKind::TimestampMismatch { field } => {
                write!(f, "{} does not match status", field)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Inconsistency {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub database_count: usize,
    #[serde(flatten)]
    pub kind: InconsistencyKind,
}

/// Classify a request against the number of database records it owns.
pub fn classify(request: &Request, database_count: usize) -> Option<InconsistencyKind> {
    use InconsistencyKind::*;

    match request.status {
        RequestStatus::Approved => return Some(StuckApproved),
        RequestStatus::Provisioned if database_count == 0 => {
            return Some(ProvisionedWithoutDatabase)
        }
        RequestStatus::Provisioned if database_count > 1 => {
            return Some(DuplicateDatabases { count: database_count })
        }
        RequestStatus::Pending | RequestStatus::Rejected if database_count > 0 => {
            return Some(DatabaseWithoutProvisioning { count: database_count })
        }
        _ => {}
    }

    let decided = request.status != RequestStatus::Pending;
    if request.approved_at.is_some() != decided {
        return Some(TimestampMismatch { field: "approved_at" });
    }
    let provisioned = request.status == RequestStatus::Provisioned;
    if request.provisioned_at.is_some() != provisioned {
        return Some(TimestampMismatch { field: "provisioned_at" });
    }
    None
}

pub struct LifecycleEngine {
    store: Arc<dyn CatalogStore>,
    policy: Arc<dyn ProvisioningPolicy>,
    host: String,
    list_limit: i64,
}

impl LifecycleEngine {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self {
            store,
            policy: Arc::new(StandardPolicy),
            host: DEFAULT_HOST.to_string(),
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn ProvisioningPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_list_limit(mut self, limit: i64) -> Self {
        self.list_limit = limit.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    /// Create a pending request. Only non-empty team name and purpose are required.
    pub async fn submit(&self, new: NewRequest) -> Result<Request, AppError> {
        require_text("team_name", &new.team_name)?;
        require_text("purpose", &new.purpose)?;

        let request = Request::pending(new);
        self.store.insert_request(&request).await?;

        tracing::info!(
            request_id = %request.id,
            team = %request.team_name,
            db_type = %request.db_type,
            size = %request.size,
            "Created request"
        );
        Ok(request)
    }

    pub async fn get_request(&self, id: Uuid) -> Result<Request, AppError> {
        self.store
            .get_request(id)
            .await?
            .ok_or_else(|| AppError::NotFound(id.to_string()))
    }

    /// Newest first; capped at the page size only when no filter is given.
    pub async fn list_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<Request>, AppError> {
        let limit = match status {
            Some(_) => None,
            None => Some(self.list_limit),
        };
        Ok(self.store.list_requests(status, limit).await?)
    }

    /// Approve or reject a pending request.
    ///
    /// The status check and every write happen while the request is held by
    /// the store, so of several concurrent calls on one id exactly one wins.
    pub async fn decide(&self, id: Uuid, decision: Decision) -> Result<DecisionOutcome, AppError> {
        require_text("approver", &decision.approver)?;

        let mut tx = self.store.begin_decision(id).await?;
        let current = match tx.request() {
            Some(req) => req.status,
            None => {
                tracing::warn!(request_id = %id, "decide: request not found");
                return Err(AppError::NotFound(id.to_string()));
            }
        };

        if current != RequestStatus::Pending {
            drop(tx);
            if let Some(issue) = self.check_request(id).await? {
                return Err(AppError::ProvisioningInconsistency {
                    id: id.to_string(),
                    reason: issue.kind.to_string(),
                });
            }
            tracing::warn!(request_id = %id, %current, "decide: request already decided");
            return Err(AppError::InvalidTransition {
                id: id.to_string(),
                current,
            });
        }

        let now = Utc::now();
        let status = match decision.action {
            DecisionAction::Approve => RequestStatus::Approved,
            DecisionAction::Reject => RequestStatus::Rejected,
        };
        let update = DecisionUpdate {
            status,
            approver: decision.approver,
            notes: decision.notes,
            approved_at: now,
            provisioned_at: None,
        };
        let decided = tx.update_request_on_decision(&update).await?;

        let database = match decision.action {
            DecisionAction::Approve => Some(self.provision(&mut *tx, &decided, now).await?),
            DecisionAction::Reject => None,
        };
        tx.commit().await?;

        let final_status = if database.is_some() {
            RequestStatus::Provisioned
        } else {
            RequestStatus::Rejected
        };
        tracing::info!(request_id = %id, status = %final_status, "Request {}", final_status);

        Ok(DecisionOutcome {
            request_id: id,
            status: final_status,
            message: format!("Request {} successfully", final_status),
            database,
        })
    }

    async fn provision(
        &self,
        tx: &mut dyn DecisionTx,
        request: &Request,
        now: DateTime<Utc>,
    ) -> Result<ProvisionedDatabase, AppError> {
        let derived = self.policy.derive(&request.size, &request.db_type);
        let record = NewProvisionedDatabase {
            request_id: request.id,
            name: database_name(&request.team_name, &request.environment, &request.db_type),
            db_type: request.db_type.clone(),
            environment: request.environment.clone(),
            host: self.host.clone(),
            port: derived.port,
            estimated_cost: derived.estimated_cost,
            created_at: now,
        };

        let database = tx.insert_provisioned_database(&record).await?;
        tx.mark_provisioned(now).await?;

        tracing::info!(
            request_id = %request.id,
            db_id = database.id,
            db_name = %database.name,
            port = database.port,
            cost = %database.estimated_cost,
            "Provisioned database"
        );
        Ok(database)
    }

    pub async fn list_databases(&self) -> Result<DatabaseCatalog, AppError> {
        let listings = self.store.list_active_databases().await?;
        Ok(DatabaseCatalog::new(listings))
    }

    /// Check one request for partial provisioning. Reports, never repairs.
    pub async fn check_request(&self, id: Uuid) -> Result<Option<Inconsistency>, AppError> {
        let (request, count) = self
            .store
            .request_with_database_count(id)
            .await?
            .ok_or_else(|| AppError::NotFound(id.to_string()))?;
        let issue = classify(&request, count).map(|kind| Inconsistency {
            request_id: id,
            status: request.status,
            database_count: count,
            kind,
        });
        if let Some(issue) = &issue {
            tracing::error!(request_id = %id, "reconciliation required: {}", issue.kind);
        }
        Ok(issue)
    }

    /// Scan the whole catalog for requests needing manual reconciliation.
    pub async fn find_inconsistencies(&self) -> Result<Vec<Inconsistency>, AppError> {
        let issues: Vec<Inconsistency> = self
            .store
            .requests_with_database_counts()
            .await?
            .into_iter()
            .filter_map(|(req, count)| {
                classify(&req, count).map(|kind| Inconsistency {
                    request_id: req.id,
                    status: req.status,
                    database_count: count,
                    kind,
                })
            })
            .collect();

        if !issues.is_empty() {
            tracing::error!(count = issues.len(), "catalog has requests needing reconciliation");
        }
        Ok(issues)
    }
}

fn require_text(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::InvalidInput(format!("{} must not be empty", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::request::{DbType, Environment, Size};

    fn request_in(status: RequestStatus) -> Request {
        let mut req = Request::pending(NewRequest {
            team_name: "t".into(),
            db_type: DbType::Mysql,
            environment: Environment::Staging,
            size: Size::Medium,
            purpose: "p".into(),
        });
        req.status = status;
        if status != RequestStatus::Pending {
            req.approved_at = Some(Utc::now());
        }
        if status == RequestStatus::Provisioned {
            req.provisioned_at = Some(Utc::now());
        }
        req
    }

    #[test]
    fn test_consistent_states() {
        assert_eq!(classify(&request_in(RequestStatus::Pending), 0), None);
        assert_eq!(classify(&request_in(RequestStatus::Rejected), 0), None);
        assert_eq!(classify(&request_in(RequestStatus::Provisioned), 1), None);
    }

    #[test]
    fn test_partial_provisioning_states() {
        assert_eq!(
            classify(&request_in(RequestStatus::Provisioned), 0),
            Some(InconsistencyKind::ProvisionedWithoutDatabase)
        );
        assert_eq!(
            classify(&request_in(RequestStatus::Provisioned), 2),
            Some(InconsistencyKind::DuplicateDatabases { count: 2 })
        );
        assert_eq!(
            classify(&request_in(RequestStatus::Rejected), 1),
            Some(InconsistencyKind::DatabaseWithoutProvisioning { count: 1 })
        );
        assert_eq!(
            classify(&request_in(RequestStatus::Approved), 1),
            Some(InconsistencyKind::StuckApproved)
        );
    }

    #[test]
    fn test_timestamp_mismatch() {
        let mut req = request_in(RequestStatus::Provisioned);
        req.provisioned_at = None;
        assert_eq!(
            classify(&req, 1),
            Some(InconsistencyKind::TimestampMismatch { field: "provisioned_at" })
        );

        let mut req = request_in(RequestStatus::Pending);
        req.approved_at = Some(Utc::now());
        assert_eq!(
            classify(&req, 0),
            Some(InconsistencyKind::TimestampMismatch { field: "approved_at" })
        );
    }

    #[test]
    fn test_require_text() {
        assert!(require_text("team_name", "data-eng").is_ok());
        assert!(matches!(
            require_text("team_name", "   "),
            Err(AppError::InvalidInput(_))
        ));
    }
}
