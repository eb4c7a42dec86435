use crate::config::Config;
use crate::db::DbHandle;
use crate::error::CastorError;
use crate::service::key_loader;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Background syncer: reconciles the on-disk key files and the configured
/// model list into the store. Running it twice against unchanged inputs is a
/// no-op in state.
pub struct Syncer {
    db: DbHandle,
    keys_dir: PathBuf,
    models: Vec<String>,
}

impl Syncer {
    pub fn new(db: DbHandle, cfg: &Config) -> Self {
        Self {
            db,
            keys_dir: cfg.basic.keys_dir.clone(),
            models: cfg.upstream.models.clone(),
        }
    }

    pub fn spawn(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    warn!(error = %e, "key sync pass failed");
                }
            }
        })
    }

    pub async fn run_once(&self) -> Result<(), CastorError> {
        let keys = key_loader::load_from_dir(&self.keys_dir)?;

        let credentials = self.db.upsert_credentials(keys).await?;
        if credentials.added > 0 || credentials.removed > 0 {
            info!(
                added = credentials.added,
                removed = credentials.removed,
                "credential pool updated"
            );
        }

        let health = self.db.reconcile_health(self.models.clone()).await?;
        if health.added > 0 || health.removed > 0 {
            info!(
                added = health.added,
                removed = health.removed,
                "health records reconciled"
            );
        }

        Ok(())
    }
}
