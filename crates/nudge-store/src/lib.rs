//! # nudge-store
//!
//! Durable task store (SQLite) with compare-and-set updates, plus the
//! transition audit trail.

pub mod audit;
pub mod store;

pub use audit::{AuditEntry, AuditLogger};
pub use store::{Inserted, Store, StoreStats};
