use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct DbCredential {
    pub id: i64,
    pub key_value: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct DbHealthRecord {
    pub id: i64,
    pub key_id: i64,
    pub model_name: String,
    pub last_tested: Option<DateTime<Utc>>,
    pub next_test_time: DateTime<Utc>,
    /// Most recent upstream HTTP status. `Some(200)` = healthy, other
    /// `Some(_)` = unhealthy, `None` = untested.
    pub status_code: Option<i64>,
    pub test_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-model aggregate for the status writer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelStats {
    pub model_name: String,
    pub healthy: i64,
    pub unhealthy: i64,
    pub requests_last_30m: i64,
}

/// Who observed the status being recorded. A prober observation reschedules
/// the next test by status class; a dispatcher failure only shortens an
/// existing cooldown (live traffic is weaker evidence than a probe).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSource {
    Prober,
    Dispatcher,
}

/// Result of one credential reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub added: usize,
    pub removed: usize,
}

/// One observed upstream status for a (credential, model).
#[derive(Debug, Clone)]
pub struct HealthObservation {
    pub key_id: i64,
    pub model: String,
    pub status: u16,
    pub source: HealthSource,
}

/// One row for the append-only request log. `key_id` is None when no
/// credential could be obtained at all.
#[derive(Debug, Clone)]
pub struct RequestLogEntry {
    pub key_id: Option<i64>,
    pub model: String,
    pub status: u16,
    pub path: String,
    pub response_time_ms: i64,
}
