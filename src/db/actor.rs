use crate::config::HealthConfig;
use crate::db::models::{
    DbCredential, DbHealthRecord, HealthObservation, HealthSource, ModelStats, RequestLogEntry,
    SyncOutcome,
};
use crate::db::schema::SQLITE_INIT;
use crate::error::CastorError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::collections::{BTreeSet, HashSet};
use std::{str::FromStr, time::Duration};
use tracing::info;

/// Dispatcher-sourced failures never push a re-test further out than this.
const DISPATCHER_RETEST_CAP_MINUTES: i64 = 5;

/// Re-test scheduling intervals, resolved from configuration at spawn.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub after_200: ChronoDuration,
    pub after_403: ChronoDuration,
    pub after_4xx: ChronoDuration,
    pub after_5xx: ChronoDuration,
}

impl HealthPolicy {
    pub fn from_config(cfg: &HealthConfig) -> Self {
        Self {
            after_200: ChronoDuration::hours(cfg.interval_200_hours),
            after_403: ChronoDuration::days(cfg.interval_403_days),
            after_4xx: ChronoDuration::days(cfg.interval_4xx_days),
            after_5xx: ChronoDuration::minutes(cfg.interval_5xx_minutes),
        }
    }

    /// Next probe time by status class, as a probe observation would schedule it.
    fn scheduled_retest(&self, status: u16, now: DateTime<Utc>) -> DateTime<Utc> {
        match status {
            200 => now + self.after_200,
            403 => now + self.after_403,
            400..=499 => now + self.after_4xx,
            500..=599 => now + self.after_5xx,
            _ => now + ChronoDuration::days(1),
        }
    }
}

#[derive(Debug)]
pub enum DbActorMessage {
    /// Reconcile the credential table against the full on-disk key set.
    UpsertCredentials(
        BTreeSet<String>,
        RpcReplyPort<Result<SyncOutcome, CastorError>>,
    ),

    /// Align key_health rows with (all credentials) x (supported models).
    ReconcileHealth(
        Vec<String>,
        RpcReplyPort<Result<SyncOutcome, CastorError>>,
    ),

    /// Pick one credential for a model: random among healthy, else random among all.
    PickCredential(
        String,
        RpcReplyPort<Result<Option<DbCredential>, CastorError>>,
    ),

    /// List every credential in the pool.
    ListCredentials(RpcReplyPort<Result<Vec<DbCredential>, CastorError>>),

    /// Read one (credential, model) health record.
    GetHealth(
        i64,
        String,
        RpcReplyPort<Result<Option<DbHealthRecord>, CastorError>>,
    ),

    /// Record an observed upstream status for a (credential, model).
    RecordHealth(HealthObservation, RpcReplyPort<Result<(), CastorError>>),

    /// Append a request-log row.
    LogRequest(RequestLogEntry, RpcReplyPort<Result<(), CastorError>>),

    /// Healthy-credential count for one model.
    CountHealthy(String, RpcReplyPort<Result<i64, CastorError>>),

    /// Per-model aggregate for the status writer.
    CountAggregate(RpcReplyPort<Result<Vec<ModelStats>, CastorError>>),

    /// Total requests logged over the last 24 hours.
    RecentRequestCount(RpcReplyPort<Result<i64, CastorError>>),

    /// Delete request logs older than the horizon. Returns deleted row count.
    PurgeLogsOlderThan(ChronoDuration, RpcReplyPort<Result<u64, CastorError>>),

    BanIp(String, RpcReplyPort<Result<(), CastorError>>),
    ListBans(RpcReplyPort<Result<Vec<String>, CastorError>>),
    UnbanIp(String, RpcReplyPort<Result<(), CastorError>>),
}

#[derive(Clone)]
pub struct DbHandle {
    actor: ActorRef<DbActorMessage>,
}

impl DbHandle {
    pub async fn upsert_credentials(
        &self,
        keys: BTreeSet<String>,
    ) -> Result<SyncOutcome, CastorError> {
        ractor::call!(self.actor, DbActorMessage::UpsertCredentials, keys)
            .map_err(|e| CastorError::Actor(format!("UpsertCredentials RPC failed: {e}")))?
    }

    pub async fn reconcile_health(&self, models: Vec<String>) -> Result<SyncOutcome, CastorError> {
        ractor::call!(self.actor, DbActorMessage::ReconcileHealth, models)
            .map_err(|e| CastorError::Actor(format!("ReconcileHealth RPC failed: {e}")))?
    }

    pub async fn pick_credential(&self, model: &str) -> Result<Option<DbCredential>, CastorError> {
        ractor::call!(self.actor, DbActorMessage::PickCredential, model.to_string())
            .map_err(|e| CastorError::Actor(format!("PickCredential RPC failed: {e}")))?
    }

    pub async fn list_credentials(&self) -> Result<Vec<DbCredential>, CastorError> {
        ractor::call!(self.actor, DbActorMessage::ListCredentials)
            .map_err(|e| CastorError::Actor(format!("ListCredentials RPC failed: {e}")))?
    }

    pub async fn get_health(
        &self,
        key_id: i64,
        model: &str,
    ) -> Result<Option<DbHealthRecord>, CastorError> {
        ractor::call!(
            self.actor,
            DbActorMessage::GetHealth,
            key_id,
            model.to_string()
        )
        .map_err(|e| CastorError::Actor(format!("GetHealth RPC failed: {e}")))?
    }

    pub async fn record_health(&self, observation: HealthObservation) -> Result<(), CastorError> {
        ractor::call!(self.actor, DbActorMessage::RecordHealth, observation)
            .map_err(|e| CastorError::Actor(format!("RecordHealth RPC failed: {e}")))?
    }

    pub async fn log_request(&self, entry: RequestLogEntry) -> Result<(), CastorError> {
        ractor::call!(self.actor, DbActorMessage::LogRequest, entry)
            .map_err(|e| CastorError::Actor(format!("LogRequest RPC failed: {e}")))?
    }

    pub async fn count_healthy(&self, model: &str) -> Result<i64, CastorError> {
        ractor::call!(self.actor, DbActorMessage::CountHealthy, model.to_string())
            .map_err(|e| CastorError::Actor(format!("CountHealthy RPC failed: {e}")))?
    }

    pub async fn count_aggregate(&self) -> Result<Vec<ModelStats>, CastorError> {
        ractor::call!(self.actor, DbActorMessage::CountAggregate)
            .map_err(|e| CastorError::Actor(format!("CountAggregate RPC failed: {e}")))?
    }

    pub async fn recent_request_count(&self) -> Result<i64, CastorError> {
        ractor::call!(self.actor, DbActorMessage::RecentRequestCount)
            .map_err(|e| CastorError::Actor(format!("RecentRequestCount RPC failed: {e}")))?
    }

    pub async fn purge_logs_older_than(&self, horizon: ChronoDuration) -> Result<u64, CastorError> {
        ractor::call!(self.actor, DbActorMessage::PurgeLogsOlderThan, horizon)
            .map_err(|e| CastorError::Actor(format!("PurgeLogsOlderThan RPC failed: {e}")))?
    }

    pub async fn ban_ip(&self, ip: &str) -> Result<(), CastorError> {
        ractor::call!(self.actor, DbActorMessage::BanIp, ip.to_string())
            .map_err(|e| CastorError::Actor(format!("BanIp RPC failed: {e}")))?
    }

    pub async fn list_bans(&self) -> Result<Vec<String>, CastorError> {
        ractor::call!(self.actor, DbActorMessage::ListBans)
            .map_err(|e| CastorError::Actor(format!("ListBans RPC failed: {e}")))?
    }

    pub async fn unban_ip(&self, ip: &str) -> Result<(), CastorError> {
        ractor::call!(self.actor, DbActorMessage::UnbanIp, ip.to_string())
            .map_err(|e| CastorError::Actor(format!("UnbanIp RPC failed: {e}")))?
    }
}

struct DbActorState {
    pool: SqlitePool,
    policy: HealthPolicy,
}

struct DbActor;

#[ractor::async_trait]
impl Actor for DbActor {
    type Msg = DbActorMessage;
    type State = DbActorState;
    type Arguments = (String, HealthPolicy);

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        (database_url, policy): Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let connect_opts = SqliteConnectOptions::from_str(database_url.as_str())
            .map_err(|e| ActorProcessingErr::from(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(connect_opts)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db connect failed: {e}")))?;

        apply_schema(&pool)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db schema init failed: {e}")))?;

        info!("DbActor initialized");
        Ok(DbActorState { pool, policy })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DbActorMessage::UpsertCredentials(keys, reply) => {
                let res = self.upsert_credentials(&state.pool, keys).await;
                let _ = reply.send(res);
            }
            DbActorMessage::ReconcileHealth(models, reply) => {
                let res = self.reconcile_health(&state.pool, &models).await;
                let _ = reply.send(res);
            }
            DbActorMessage::PickCredential(model, reply) => {
                let res = self.pick_credential(&state.pool, &model).await;
                let _ = reply.send(res);
            }
            DbActorMessage::ListCredentials(reply) => {
                let res = self.list_credentials(&state.pool).await;
                let _ = reply.send(res);
            }
            DbActorMessage::GetHealth(key_id, model, reply) => {
                let res = self.get_health(&state.pool, key_id, &model).await;
                let _ = reply.send(res);
            }
            DbActorMessage::RecordHealth(observation, reply) => {
                let res = self
                    .record_health(&state.pool, &state.policy, &observation)
                    .await;
                let _ = reply.send(res);
            }
            DbActorMessage::LogRequest(entry, reply) => {
                let res = self.log_request(&state.pool, &entry).await;
                let _ = reply.send(res);
            }
            DbActorMessage::CountHealthy(model, reply) => {
                let res = self.count_healthy(&state.pool, &model).await;
                let _ = reply.send(res);
            }
            DbActorMessage::CountAggregate(reply) => {
                let res = self.count_aggregate(&state.pool).await;
                let _ = reply.send(res);
            }
            DbActorMessage::RecentRequestCount(reply) => {
                let res = self.recent_request_count(&state.pool).await;
                let _ = reply.send(res);
            }
            DbActorMessage::PurgeLogsOlderThan(horizon, reply) => {
                let res = self.purge_logs(&state.pool, horizon).await;
                let _ = reply.send(res);
            }
            DbActorMessage::BanIp(ip, reply) => {
                let res = self.ban_ip(&state.pool, &ip).await;
                let _ = reply.send(res);
            }
            DbActorMessage::ListBans(reply) => {
                let res = self.list_bans(&state.pool).await;
                let _ = reply.send(res);
            }
            DbActorMessage::UnbanIp(ip, reply) => {
                let res = self.unban_ip(&state.pool, &ip).await;
                let _ = reply.send(res);
            }
        }
        Ok(())
    }
}

impl DbActor {
    /// Set reconciliation over the whole credential table, all-or-nothing.
    /// Removed keys cascade to their key_health rows.
    async fn upsert_credentials(
        &self,
        pool: &SqlitePool,
        keys: BTreeSet<String>,
    ) -> Result<SyncOutcome, CastorError> {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        let existing: Vec<(i64, String)> = sqlx::query_as("SELECT id, key_value FROM api_keys")
            .fetch_all(&mut *tx)
            .await?;
        let existing_values: HashSet<&str> =
            existing.iter().map(|(_, v)| v.as_str()).collect();

        let mut outcome = SyncOutcome::default();

        for key in &keys {
            if existing_values.contains(key.as_str()) {
                continue;
            }
            sqlx::query("INSERT INTO api_keys (key_value, created_at) VALUES (?, ?)")
                .bind(key)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            outcome.added += 1;
        }

        for (id, value) in &existing {
            if keys.contains(value) {
                continue;
            }
            sqlx::query("DELETE FROM api_keys WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            outcome.removed += 1;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    /// Ensure exactly one key_health row per (credential, supported model),
    /// all-or-nothing. New rows are untested and immediately due for a probe.
    async fn reconcile_health(
        &self,
        pool: &SqlitePool,
        models: &[String],
    ) -> Result<SyncOutcome, CastorError> {
        let mut tx = pool.begin().await?;
        let now = Utc::now();
        let model_set: HashSet<&str> = models.iter().map(String::as_str).collect();

        let key_ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM api_keys")
            .fetch_all(&mut *tx)
            .await?;
        let pairs: Vec<(i64, String)> =
            sqlx::query_as("SELECT key_id, model_name FROM key_health")
                .fetch_all(&mut *tx)
                .await?;
        let have: HashSet<(i64, &str)> =
            pairs.iter().map(|(id, m)| (*id, m.as_str())).collect();

        let mut outcome = SyncOutcome::default();

        for key_id in &key_ids {
            for model in models {
                if have.contains(&(*key_id, model.as_str())) {
                    continue;
                }
                sqlx::query(
                    r#"
                INSERT INTO key_health (key_id, model_name, next_test_time, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
                )
                .bind(key_id)
                .bind(model)
                .bind(now)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                outcome.added += 1;
            }
        }

        for (key_id, model) in &pairs {
            if model_set.contains(model.as_str()) {
                continue;
            }
            sqlx::query("DELETE FROM key_health WHERE key_id = ? AND model_name = ?")
                .bind(key_id)
                .bind(model)
                .execute(&mut *tx)
                .await?;
            outcome.removed += 1;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn pick_credential(
        &self,
        pool: &SqlitePool,
        model: &str,
    ) -> Result<Option<DbCredential>, CastorError> {
        let healthy = sqlx::query_as::<_, DbCredential>(
            r#"
        SELECT ak.id, ak.key_value, ak.created_at
        FROM api_keys ak
        JOIN key_health kh ON ak.id = kh.key_id
        WHERE kh.model_name = ? AND kh.status_code = 200
        ORDER BY RANDOM()
        LIMIT 1
        "#,
        )
        .bind(model)
        .fetch_optional(pool)
        .await?;

        if healthy.is_some() {
            return Ok(healthy);
        }

        // No healthy key: fall back to any key known for this model.
        let any = sqlx::query_as::<_, DbCredential>(
            r#"
        SELECT ak.id, ak.key_value, ak.created_at
        FROM api_keys ak
        JOIN key_health kh ON ak.id = kh.key_id
        WHERE kh.model_name = ?
        ORDER BY RANDOM()
        LIMIT 1
        "#,
        )
        .bind(model)
        .fetch_optional(pool)
        .await?;

        Ok(any)
    }

    async fn list_credentials(&self, pool: &SqlitePool) -> Result<Vec<DbCredential>, CastorError> {
        let rows = sqlx::query_as::<_, DbCredential>(
            "SELECT id, key_value, created_at FROM api_keys ORDER BY id",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    async fn get_health(
        &self,
        pool: &SqlitePool,
        key_id: i64,
        model: &str,
    ) -> Result<Option<DbHealthRecord>, CastorError> {
        let row = sqlx::query_as::<_, DbHealthRecord>(
            r#"
        SELECT id, key_id, model_name, last_tested, next_test_time, status_code,
               test_count, created_at, updated_at
        FROM key_health
        WHERE key_id = ? AND model_name = ?
        "#,
        )
        .bind(key_id)
        .bind(model)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    async fn record_health(
        &self,
        pool: &SqlitePool,
        policy: &HealthPolicy,
        observation: &HealthObservation,
    ) -> Result<(), CastorError> {
        let now = Utc::now();
        let status = observation.status;

        let next_test_time = if status == 200 {
            now + policy.after_200
        } else {
            match observation.source {
                HealthSource::Prober => policy.scheduled_retest(status, now),
                // A live-traffic failure requests a re-probe soon but never
                // repeatedly postpones an already-near deadline.
                HealthSource::Dispatcher => {
                    let current: Option<DateTime<Utc>> = sqlx::query_scalar(
                        "SELECT next_test_time FROM key_health WHERE key_id = ? AND model_name = ?",
                    )
                    .bind(observation.key_id)
                    .bind(&observation.model)
                    .fetch_optional(pool)
                    .await?;

                    let cap = ChronoDuration::minutes(DISPATCHER_RETEST_CAP_MINUTES);
                    match current {
                        Some(current) if current - now > cap => now + cap,
                        Some(current) => current,
                        None => policy.scheduled_retest(status, now),
                    }
                }
            }
        };

        sqlx::query(
            r#"
        UPDATE key_health
        SET status_code = ?, test_count = test_count + 1, last_tested = ?,
            next_test_time = ?, updated_at = ?
        WHERE key_id = ? AND model_name = ?
        "#,
        )
        .bind(i64::from(status))
        .bind(now)
        .bind(next_test_time)
        .bind(now)
        .bind(observation.key_id)
        .bind(&observation.model)
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn log_request(
        &self,
        pool: &SqlitePool,
        entry: &RequestLogEntry,
    ) -> Result<(), CastorError> {
        sqlx::query(
            r#"
        INSERT INTO request_logs (key_id, model_name, status_code, request_path, response_time_ms, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(entry.key_id)
        .bind(&entry.model)
        .bind(i64::from(entry.status))
        .bind(&entry.path)
        .bind(entry.response_time_ms)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn count_healthy(&self, pool: &SqlitePool, model: &str) -> Result<i64, CastorError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM key_health WHERE model_name = ? AND status_code = 200",
        )
        .bind(model)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    async fn count_aggregate(&self, pool: &SqlitePool) -> Result<Vec<ModelStats>, CastorError> {
        let health_rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
        SELECT
            model_name,
            SUM(CASE WHEN status_code = 200 THEN 1 ELSE 0 END) as healthy,
            SUM(CASE WHEN status_code IS NOT NULL AND status_code != 200 THEN 1 ELSE 0 END) as unhealthy
        FROM key_health
        GROUP BY model_name
        ORDER BY model_name
        "#,
        )
        .fetch_all(pool)
        .await?;

        let since = Utc::now() - ChronoDuration::minutes(30);
        let request_rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
        SELECT model_name, COUNT(*) as request_count
        FROM request_logs
        WHERE created_at >= ?
        GROUP BY model_name
        "#,
        )
        .bind(since)
        .fetch_all(pool)
        .await?;

        let mut stats: Vec<ModelStats> = health_rows
            .into_iter()
            .map(|(model_name, healthy, unhealthy)| ModelStats {
                model_name,
                healthy,
                unhealthy,
                requests_last_30m: 0,
            })
            .collect();

        for (model_name, count) in request_rows {
            if let Some(entry) = stats.iter_mut().find(|s| s.model_name == model_name) {
                entry.requests_last_30m = count;
            }
        }

        Ok(stats)
    }

    async fn recent_request_count(&self, pool: &SqlitePool) -> Result<i64, CastorError> {
        let since = Utc::now() - ChronoDuration::hours(24);
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM request_logs WHERE created_at >= ?")
                .bind(since)
                .fetch_one(pool)
                .await?;
        Ok(count)
    }

    async fn purge_logs(
        &self,
        pool: &SqlitePool,
        horizon: ChronoDuration,
    ) -> Result<u64, CastorError> {
        let threshold = Utc::now() - horizon;
        let result = sqlx::query("DELETE FROM request_logs WHERE created_at < ?")
            .bind(threshold)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ban_ip(&self, pool: &SqlitePool, ip: &str) -> Result<(), CastorError> {
        sqlx::query("INSERT OR IGNORE INTO banned_ips (ip_address, banned_at) VALUES (?, ?)")
            .bind(ip)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(())
    }

    async fn list_bans(&self, pool: &SqlitePool) -> Result<Vec<String>, CastorError> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT ip_address FROM banned_ips")
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }

    async fn unban_ip(&self, pool: &SqlitePool, ip: &str) -> Result<(), CastorError> {
        sqlx::query("DELETE FROM banned_ips WHERE ip_address = ?")
            .bind(ip)
            .execute(pool)
            .await?;
        Ok(())
    }
}

/// Spawn the database actor and return a cloneable handle.
pub async fn spawn(database_url: &str, policy: HealthPolicy) -> DbHandle {
    let (actor, _jh) = ractor::Actor::spawn(None, DbActor, (database_url.to_string(), policy))
        .await
        .expect("failed to spawn DbActor");

    DbHandle { actor }
}

async fn apply_schema(pool: &SqlitePool) -> Result<(), CastorError> {
    for stmt in SQLITE_INIT.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        sqlx::query(s).execute(pool).await?;
    }
    Ok(())
}
