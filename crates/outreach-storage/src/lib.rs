//! Outreach storage crate - SQLite persistence for contacts, organizations,
//! signals, insights, the goal catalog, and the attempt ledger.
//!
//! Provides a WAL-mode SQLite database with migrations, repository
//! implementations, and read-only reporting projections. Every write that
//! creates or advances an attempt is a single conditional statement so that
//! concurrent workers cannot both win.

pub mod attempts;
pub mod db;
pub mod migrations;
pub mod queries;
pub mod repository;

pub use attempts::AttemptRepository;
pub use db::Database;
pub use queries::{GoalStats, ReportService, StageCount};
pub use repository::{
    ContactRepository, GoalRepository, InsightRepository, OrganizationRepository,
    SignalRepository,
};
