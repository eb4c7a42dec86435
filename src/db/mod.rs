//! Database module: the state store behind a single actor mailbox.
//!
//! Layout:
//! - `models.rs`: Rust structs mirroring DB rows plus store value types
//! - `schema.rs`: SQL DDL for initializing the database (SQLite-first)
//! - `actor.rs`: the ractor actor owning the sqlx pool, and its RPC handle

pub mod actor;
pub mod models;
pub mod schema;

pub use actor::{DbHandle, HealthPolicy, spawn};
pub use models::{
    DbCredential, DbHealthRecord, HealthObservation, HealthSource, ModelStats, RequestLogEntry,
    SyncOutcome,
};
pub use schema::SQLITE_INIT;
