pub mod cost;
pub mod database;
pub mod request;
