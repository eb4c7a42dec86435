use crate::config::ReportConfig;
use crate::db::DbHandle;
use crate::error::CastorError;
use chrono::Duration as ChronoDuration;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Background purger for the append-only request log.
pub struct LogPurger {
    db: DbHandle,
    retention: ChronoDuration,
}

impl LogPurger {
    pub fn new(db: DbHandle, cfg: &ReportConfig) -> Self {
        Self {
            db,
            retention: ChronoDuration::hours(cfg.log_retention_hours),
        }
    }

    pub fn spawn(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    warn!(error = %e, "log purge pass failed");
                }
            }
        })
    }

    pub async fn run_once(&self) -> Result<(), CastorError> {
        let deleted = self.db.purge_logs_older_than(self.retention).await?;
        if deleted > 0 {
            info!(deleted, "purged old request logs");
        }
        Ok(())
    }
}
