use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A team's ask for a database, tracked through the approval lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "request_id")]
    pub id: Uuid,
    pub team_name: String,
    pub db_type: DbType,
    pub environment: Environment,
    pub size: Size,
    pub purpose: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approver: Option<String>,
    pub approval_notes: Option<String>,
    pub provisioned_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Build a fresh pending request with a newly issued id.
    pub fn pending(new: NewRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            team_name: new.team_name,
            db_type: new.db_type,
            environment: new.environment,
            size: new.size,
            purpose: new.purpose,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            approved_at: None,
            approver: None,
            approval_notes: None,
            provisioned_at: None,
        }
    }
}

/// Caller-supplied fields of a submission.
#[derive(Debug, Clone, Deserialize)]
pub struct NewRequest {
    pub team_name: String,
    pub db_type: DbType,
    pub environment: Environment,
    pub size: Size,
    pub purpose: String,
}

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Provisioned,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Provisioned => "provisioned",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(RequestStatus::Pending),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            "provisioned" => Ok(RequestStatus::Provisioned),
            other => Err(format!("unknown request status: {}", other)),
        }
    }
}

/// Reviewer verdict on a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    Approve,
    Reject,
}

impl FromStr for DecisionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Ok(DecisionAction::Approve),
            "reject" | "rejected" => Ok(DecisionAction::Reject),
            other => Err(format!("invalid action '{}': expected approve or reject", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub action: DecisionAction,
    pub approver: String,
    pub notes: Option<String>,
}

// ── Free-text attributes with a fallback arm ─────────────────
//
// Known values normalise to lowercase; anything else is kept verbatim in
// `Other` and receives the default cost/port.

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DbType {
    Postgres,
    Mysql,
    Redis,
    Other(String),
}

impl DbType {
    pub fn as_str(&self) -> &str {
        match self {
            DbType::Postgres => "postgres",
            DbType::Mysql => "mysql",
            DbType::Redis => "redis",
            DbType::Other(s) => s,
        }
    }
}

impl From<&str> for DbType {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" => DbType::Postgres,
            "mysql" => DbType::Mysql,
            "redis" => DbType::Redis,
            _ => DbType::Other(s.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
    Other(String),
}

impl Environment {
    pub fn as_str(&self) -> &str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
            Environment::Other(s) => s,
        }
    }
}

impl From<&str> for Environment {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" => Environment::Dev,
            "staging" => Environment::Staging,
            "prod" => Environment::Prod,
            _ => Environment::Other(s.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Size {
    Small,
    Medium,
    Large,
    Other(String),
}

impl Size {
    pub fn as_str(&self) -> &str {
        match self {
            Size::Small => "small",
            Size::Medium => "medium",
            Size::Large => "large",
            Size::Other(s) => s,
        }
    }
}

impl From<&str> for Size {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Size::Small,
            "medium" => Size::Medium,
            "large" => Size::Large,
            _ => Size::Other(s.to_string()),
        }
    }
}

macro_rules! string_conversions {
    ($($ty:ident),*) => {
        $(
            impl From<String> for $ty {
                fn from(s: String) -> Self {
                    $ty::from(s.as_str())
                }
            }

            impl From<$ty> for String {
                fn from(v: $ty) -> Self {
                    v.as_str().to_string()
                }
            }

            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }
        )*
    };
}

string_conversions!(DbType, Environment, Size);
