use crate::config::ReportConfig;
use crate::db::DbHandle;
use crate::error::CastorError;
use chrono::Utc;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Background status writer: appends a per-model health report to a text file
/// on a fixed interval, truncating the file first once it grows past the
/// configured cap.
pub struct StatusWriter {
    db: DbHandle,
    path: PathBuf,
    max_bytes: u64,
}

impl StatusWriter {
    pub fn new(db: DbHandle, cfg: &ReportConfig) -> Self {
        Self {
            db,
            path: cfg.status_file_path.clone(),
            max_bytes: cfg.max_status_file_size_bytes(),
        }
    }

    pub fn spawn(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    warn!(error = %e, "status report pass failed");
                }
            }
        })
    }

    pub async fn run_once(&self) -> Result<(), CastorError> {
        self.truncate_if_oversize().await?;

        let stats = self.db.count_aggregate().await?;

        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
        let mut report = format!("--- Model Status Report ({timestamp}) ---\n\n");
        if stats.is_empty() {
            report.push_str("No model stats available.\n");
        } else {
            for entry in &stats {
                let _ = writeln!(report, "Model: {}", entry.model_name);
                let _ = writeln!(report, "  - Available Keys: {}", entry.healthy);
                let _ = writeln!(report, "  - Unavailable Keys: {}", entry.unhealthy);
                let _ = writeln!(
                    report,
                    "  - Requests (Last 30 mins): {}\n",
                    entry.requests_last_30m
                );
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(report.as_bytes()).await?;

        info!(path = %self.path.display(), "status report written");
        Ok(())
    }

    async fn truncate_if_oversize(&self) -> Result<(), CastorError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.len() > self.max_bytes => {
                tokio::fs::write(&self.path, b"").await?;
                info!(path = %self.path.display(), "status file exceeded size cap; truncated");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
