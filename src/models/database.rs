use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::request::{DbType, Environment};

/// Catalog record materialised when a request is approved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedDatabase {
    #[serde(rename = "db_id")]
    pub id: i64,
    pub request_id: Uuid,
    #[serde(rename = "db_name")]
    pub name: String,
    pub db_type: DbType,
    pub environment: Environment,
    pub host: String,
    pub port: u16,
    #[serde(rename = "estimated_monthly_cost", with = "rust_decimal::serde::float")]
    pub estimated_cost: Decimal,
    pub status: DatabaseStatus,
    pub created_at: DateTime<Utc>,
}

/// Everything but the store-assigned id.
#[derive(Debug, Clone)]
pub struct NewProvisionedDatabase {
    pub request_id: Uuid,
    pub name: String,
    pub db_type: DbType,
    pub environment: Environment,
    pub host: String,
    pub port: u16,
    pub estimated_cost: Decimal,
    pub created_at: DateTime<Utc>,
}

impl NewProvisionedDatabase {
    pub fn with_id(self, id: i64) -> ProvisionedDatabase {
        ProvisionedDatabase {
            id,
            request_id: self.request_id,
            name: self.name,
            db_type: self.db_type,
            environment: self.environment,
            host: self.host,
            port: self.port,
            estimated_cost: self.estimated_cost,
            status: DatabaseStatus::Active,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum DatabaseStatus {
    Active,
    Decommissioned,
}

/// An active database joined with the owning request's team.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseListing {
    #[serde(flatten)]
    pub database: ProvisionedDatabase,
    pub team_name: String,
}

/// Response shape of the catalog query.
#[derive(Debug, Serialize)]
pub struct DatabaseCatalog {
    pub databases: Vec<DatabaseListing>,
    pub total_count: usize,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_monthly_cost: Decimal,
}

impl DatabaseCatalog {
    /// Totals are computed over exactly the listings passed in.
    pub fn new(databases: Vec<DatabaseListing>) -> Self {
        let total: Decimal = databases.iter().map(|d| d.database.estimated_cost).sum();
        Self {
            total_count: databases.len(),
            total_monthly_cost: total.round_dp(2),
            databases,
        }
    }
}
