//! Cost and connection derivation for provisioned databases.
//!
//! The tables here are fixed policy. [`ProvisioningPolicy`] is the seam for
//! swapping them out; [`StandardPolicy`] is what the service runs with.

use rust_decimal::Decimal;

use super::request::{DbType, Environment, Size};

/// Placeholder host every simulated database points at.
pub const DEFAULT_HOST: &str = "db-cluster.example.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Derived {
    pub estimated_cost: Decimal,
    pub port: u16,
}

pub trait ProvisioningPolicy: Send + Sync {
    /// Monthly cost in USD for a size class.
    fn monthly_cost(&self, size: &Size) -> Decimal;

    fn port(&self, db_type: &DbType) -> u16;

    fn derive(&self, size: &Size, db_type: &DbType) -> Derived {
        Derived {
            estimated_cost: self.monthly_cost(size),
            port: self.port(db_type),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardPolicy;

impl ProvisioningPolicy for StandardPolicy {
    fn monthly_cost(&self, size: &Size) -> Decimal {
        match size {
            Size::Small => Decimal::new(5000, 2),
            Size::Medium => Decimal::new(15000, 2),
            Size::Large => Decimal::new(50000, 2),
            Size::Other(_) => Decimal::new(10000, 2),
        }
    }

    fn port(&self, db_type: &DbType) -> u16 {
        match db_type {
            DbType::Postgres => 5432,
            DbType::Mysql => 3306,
            DbType::Redis => 6379,
            DbType::Other(_) => 5432,
        }
    }
}

/// `{team}_{environment}_{db_type}_{8 random hex chars}`
pub fn database_name(team: &str, environment: &Environment, db_type: &DbType) -> String {
    let suffix: [u8; 4] = rand::random();
    format!("{}_{}_{}_{}", team, environment, db_type, hex::encode(suffix))
}
