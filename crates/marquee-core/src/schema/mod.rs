//! SQLite schema and connection management.

pub mod db;
pub mod migrations;

pub use db::Database;
